//! Inventory persistence + retrying HTTP fetch utilities for lotwatch.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{CanonicalItem, ChangeEvent, ItemStatus, RunRecord};
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-store";

/// Upserts are written in fixed-size chunks to bound statement count per
/// transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Retrying HTTP fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Additional attempts after the first, so `max_retries = 2` means up to
    /// three tries total.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-attempt bound; a timed-out attempt counts as retryable.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url} after retries")]
    HttpStatus { status: u16, url: String },
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Retrying HTTP client. Transport failures, timeouts, and non-2xx statuses
/// are retried with exponential backoff until the retry budget is spent.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, source_name: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(source_name, url, || self.client.get(url)).await
    }

    pub async fn post_form(
        &self,
        source_name: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(source_name, url, || self.client.post(url).form(form))
            .await
    }

    async fn execute(
        &self,
        source_name: &str,
        url: &str,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_name, url);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            match make_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(attempt, status = status.as_u16(), "retrying after bad status");
                }
                Err(err) => {
                    if attempt >= self.backoff.max_retries || !is_retryable_transport(&err) {
                        return Err(FetchError::Transport(err));
                    }
                    debug!(attempt, error = %err, "retrying after transport failure");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("chunk {index} of {total} failed, remaining chunks aborted: {source}")]
    ChunkFailed {
        index: usize,
        total: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

/// Idempotent inventory persistence keyed by (tenant, source, natural key).
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// All currently non-removed items for one (tenant, source) pair.
    async fn load_active(
        &self,
        tenant_id: &str,
        source_name: &str,
    ) -> Result<Vec<CanonicalItem>, StoreError>;

    /// Chunked, idempotent upsert plus in-place soft deletion. A failed
    /// chunk aborts the remaining chunks; committed chunks stay.
    async fn apply(
        &self,
        tenant_id: &str,
        source_name: &str,
        items: &[CanonicalItem],
        removed_keys: &[String],
    ) -> Result<(), StoreError>;

    /// Append-only change event log.
    async fn append_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError>;
}

/// Run bookkeeping, one record per (tenant, source) invocation.
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn start_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError>;
    async fn touch_target(
        &self,
        tenant_id: &str,
        source_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub struct PgStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn upsert_chunk(&self, chunk: &[CanonicalItem]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for item in chunk {
            sqlx::query(
                r#"
                INSERT INTO inventory_items (
                    tenant_id, source_name, natural_key, title, make, model,
                    category, size, price, msrp, sale_price, gvwr, vin,
                    condition, location, status, specs, source_url,
                    observed_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, $18, $19, $20)
                ON CONFLICT (tenant_id, source_name, natural_key) DO UPDATE SET
                    title = EXCLUDED.title,
                    make = EXCLUDED.make,
                    model = EXCLUDED.model,
                    category = EXCLUDED.category,
                    size = EXCLUDED.size,
                    price = EXCLUDED.price,
                    msrp = EXCLUDED.msrp,
                    sale_price = EXCLUDED.sale_price,
                    gvwr = EXCLUDED.gvwr,
                    vin = EXCLUDED.vin,
                    condition = EXCLUDED.condition,
                    location = EXCLUDED.location,
                    status = EXCLUDED.status,
                    specs = EXCLUDED.specs,
                    source_url = EXCLUDED.source_url,
                    observed_at = EXCLUDED.observed_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&item.tenant_id)
            .bind(&item.source_name)
            .bind(&item.natural_key)
            .bind(&item.title)
            .bind(&item.make)
            .bind(&item.model)
            .bind(&item.category)
            .bind(&item.size)
            .bind(item.price)
            .bind(item.msrp)
            .bind(item.sale_price)
            .bind(&item.gvwr)
            .bind(&item.vin)
            .bind(&item.condition)
            .bind(&item.location)
            .bind(item.status.as_str())
            .bind(Json(&item.specs))
            .bind(&item.source_url)
            .bind(item.observed_at)
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

fn item_from_row(row: &PgRow) -> Result<CanonicalItem, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = ItemStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown item status '{status_raw}'")))?;
    let specs: Json<BTreeMap<String, String>> = row.try_get("specs")?;
    Ok(CanonicalItem {
        tenant_id: row.try_get("tenant_id")?,
        source_name: row.try_get("source_name")?,
        natural_key: row.try_get("natural_key")?,
        title: row.try_get("title")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        category: row.try_get("category")?,
        size: row.try_get("size")?,
        price: row.try_get("price")?,
        msrp: row.try_get("msrp")?,
        sale_price: row.try_get("sale_price")?,
        gvwr: row.try_get("gvwr")?,
        vin: row.try_get("vin")?,
        condition: row.try_get("condition")?,
        location: row.try_get("location")?,
        status,
        specs: specs.0,
        source_url: row.try_get("source_url")?,
        observed_at: row.try_get("observed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn load_active(
        &self,
        tenant_id: &str,
        source_name: &str,
    ) -> Result<Vec<CanonicalItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, source_name, natural_key, title, make, model,
                   category, size, price, msrp, sale_price, gvwr, vin,
                   condition, location, status, specs, source_url,
                   observed_at, updated_at
            FROM inventory_items
            WHERE tenant_id = $1 AND source_name = $2 AND status = $3
            ORDER BY natural_key
            "#,
        )
        .bind(tenant_id)
        .bind(source_name)
        .bind(ItemStatus::Available.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn apply(
        &self,
        tenant_id: &str,
        source_name: &str,
        items: &[CanonicalItem],
        removed_keys: &[String],
    ) -> Result<(), StoreError> {
        let chunks: Vec<&[CanonicalItem]> = items.chunks(self.chunk_size).collect();
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            self.upsert_chunk(chunk)
                .await
                .map_err(|source| StoreError::ChunkFailed {
                    index,
                    total,
                    source,
                })?;
            debug!(index, total, rows = chunk.len(), "inventory chunk committed");
        }

        for key_chunk in removed_keys.chunks(self.chunk_size) {
            sqlx::query(
                r#"
                UPDATE inventory_items
                SET status = $1, updated_at = $2
                WHERE tenant_id = $3 AND source_name = $4 AND natural_key = ANY($5)
                "#,
            )
            .bind(ItemStatus::Sold.as_str())
            .bind(Utc::now())
            .bind(tenant_id)
            .bind(source_name)
            .bind(key_chunk)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO change_events (
                    tenant_id, source_name, natural_key, title, change_type,
                    old_price, new_price, detected_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&event.tenant_id)
            .bind(&event.source_name)
            .bind(&event.natural_key)
            .bind(&event.title)
            .bind(event.change_type.as_str())
            .bind(event.old_price)
            .bind(event.new_price)
            .bind(event.detected_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobTracker for PgStore {
    async fn start_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (id, tenant_id, source_name, started_at, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.id)
        .bind(&run.tenant_id)
        .bind(&run.source_name)
        .bind(run.started_at)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scrape_runs
            SET finished_at = $2, status = $3, items_found = $4,
                changes_detected = $5, error_message = $6
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.items_found as i32)
        .bind(run.changes_detected as i32)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_target(
        &self,
        tenant_id: &str,
        source_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scrape_targets
            SET last_run_at = $3
            WHERE tenant_id = $1 AND source_name = $2
            "#,
        )
        .bind(tenant_id)
        .bind(source_name)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, dry runs)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    items: HashMap<(String, String), BTreeMap<String, CanonicalItem>>,
    events: Vec<ChangeEvent>,
    runs: HashMap<Uuid, RunRecord>,
    last_runs: HashMap<(String, String), DateTime<Utc>>,
    chunk_writes: usize,
}

/// In-memory store with the same observable semantics as [`PgStore`],
/// including chunked writes.
pub struct MemoryStore {
    chunk_size: usize,
    inner: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inner: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn items_snapshot(&self, tenant_id: &str, source_name: &str) -> Vec<CanonicalItem> {
        let state = self.inner.lock().await;
        state
            .items
            .get(&(tenant_id.to_string(), source_name.to_string()))
            .map(|by_key| by_key.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn events_snapshot(&self) -> Vec<ChangeEvent> {
        self.inner.lock().await.events.clone()
    }

    pub async fn run_snapshot(&self, id: Uuid) -> Option<RunRecord> {
        self.inner.lock().await.runs.get(&id).cloned()
    }

    pub async fn last_run(&self, tenant_id: &str, source_name: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .await
            .last_runs
            .get(&(tenant_id.to_string(), source_name.to_string()))
            .copied()
    }

    pub async fn chunk_writes(&self) -> usize {
        self.inner.lock().await.chunk_writes
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn load_active(
        &self,
        tenant_id: &str,
        source_name: &str,
    ) -> Result<Vec<CanonicalItem>, StoreError> {
        let state = self.inner.lock().await;
        Ok(state
            .items
            .get(&(tenant_id.to_string(), source_name.to_string()))
            .map(|by_key| {
                by_key
                    .values()
                    .filter(|item| item.status == ItemStatus::Available)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply(
        &self,
        tenant_id: &str,
        source_name: &str,
        items: &[CanonicalItem],
        removed_keys: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        let scope = (tenant_id.to_string(), source_name.to_string());
        for chunk in items.chunks(self.chunk_size) {
            let by_key = state.items.entry(scope.clone()).or_default();
            for item in chunk {
                by_key.insert(item.natural_key.clone(), item.clone());
            }
            state.chunk_writes += 1;
        }
        if !removed_keys.is_empty() {
            let now = Utc::now();
            if let Some(by_key) = state.items.get_mut(&scope) {
                for key in removed_keys {
                    if let Some(item) = by_key.get_mut(key) {
                        item.mark_removed(now);
                    } else {
                        warn!(key, "removal requested for unknown natural key");
                    }
                }
            }
        }
        Ok(())
    }

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<(), StoreError> {
        self.inner.lock().await.events.extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl JobTracker for MemoryStore {
    async fn start_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.inner.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn touch_target(
        &self,
        tenant_id: &str,
        source_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .last_runs
            .insert((tenant_id.to_string(), source_name.to_string()), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotwatch_core::RunStatus;

    fn item(key: &str, price: Option<f64>) -> CanonicalItem {
        let now = Utc::now();
        CanonicalItem {
            tenant_id: "t1".into(),
            source_name: "acme-trailers".into(),
            natural_key: key.into(),
            title: format!("Listing {key}"),
            make: None,
            model: None,
            category: None,
            size: None,
            price,
            msrp: None,
            sale_price: None,
            gvwr: None,
            vin: None,
            condition: None,
            location: None,
            status: ItemStatus::Available,
            specs: BTreeMap::new(),
            source_url: None,
            observed_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn reapplying_an_identical_batch_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![item("A1", Some(1000.0)), item("A2", Some(2000.0))];

        store.apply("t1", "acme-trailers", &batch, &[]).await.unwrap();
        let first = store.items_snapshot("t1", "acme-trailers").await;
        store.apply("t1", "acme-trailers", &batch, &[]).await.unwrap();
        let second = store.items_snapshot("t1", "acme-trailers").await;

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn oversized_batch_is_fully_persisted_across_chunks() {
        let store = MemoryStore::new().with_chunk_size(2);
        let batch: Vec<_> = (0..5).map(|i| item(&format!("K{i}"), Some(100.0))).collect();

        store.apply("t1", "acme-trailers", &batch, &[]).await.unwrap();

        assert_eq!(store.chunk_writes().await, 3);
        let stored = store.items_snapshot("t1", "acme-trailers").await;
        assert_eq!(stored.len(), 5);
        let mut keys: Vec<_> = stored.iter().map(|i| i.natural_key.clone()).collect();
        keys.dedup();
        assert_eq!(keys.len(), 5, "natural keys stay unique after chunked apply");
    }

    #[tokio::test]
    async fn removed_keys_are_soft_deleted_not_dropped() {
        let store = MemoryStore::new();
        let batch = vec![item("A1", Some(1000.0)), item("A2", Some(2000.0))];
        store.apply("t1", "acme-trailers", &batch, &[]).await.unwrap();

        store
            .apply("t1", "acme-trailers", &[], &["A2".to_string()])
            .await
            .unwrap();

        let active = store.load_active("t1", "acme-trailers").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].natural_key, "A1");

        let all = store.items_snapshot("t1", "acme-trailers").await;
        assert_eq!(all.len(), 2, "sold item is kept for history");
        assert!(all
            .iter()
            .any(|i| i.natural_key == "A2" && i.status == ItemStatus::Sold));
    }

    #[tokio::test]
    async fn run_records_are_created_then_finished_once() {
        let store = MemoryStore::new();
        let mut run = RunRecord::start("t1", "acme-trailers", Utc::now());
        store.start_run(&run).await.unwrap();
        assert_eq!(
            store.run_snapshot(run.id).await.unwrap().status,
            RunStatus::Running
        );

        run.finish_success(10, 3, Utc::now());
        store.finish_run(&run).await.unwrap();
        let stored = store.run_snapshot(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.items_found, 10);
        assert_eq!(stored.changes_detected, 3);
    }
}

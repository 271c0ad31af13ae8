//! Platform adapter contracts + the per-platform extraction implementations.
//!
//! Everything downstream of an adapter sees only [`RawListing`] records;
//! parsing heuristics for a given platform family stay inside its adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::ScrapeTarget;
use lotwatch_store::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-adapters";

pub const KIND_PAGINATED_REST: &str = "paginated-rest";
pub const KIND_TOKEN_GATED_API: &str = "token-gated-api";
pub const KIND_SERVER_RENDERED_AJAX: &str = "server-rendered-ajax";
pub const KIND_FACETED_SEARCH: &str = "faceted-search";

/// Source-native record shape handed to the normalizer. Fields an adapter
/// could not find stay `None`; anything labeled but unrecognized lands in
/// `attributes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub stock_number: Option<String>,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub msrp_text: Option<String>,
    pub sale_price_text: Option<String>,
    pub year: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub gvwr: Option<String>,
    pub vin: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Adapter output for one target. `possibly_incomplete` marks batches the
/// change detector must not derive removals from.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<RawListing>,
    pub reported_total: Option<usize>,
    pub possibly_incomplete: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Network(#[from] FetchError),
    /// Expected structural markers are absent; the source likely changed
    /// shape. Never retried.
    #[error("structural mismatch: {0}")]
    Structural(String),
    #[error("target misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Must return an empty extraction when the source legitimately has zero
    /// listings, and fail with [`AdapterError::Structural`] when expected
    /// markers are missing.
    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &ExtractContext,
        target: &ScrapeTarget,
    ) -> Result<Extraction, AdapterError>;
}

/// Closed set of built-in platform kinds behind one capability interface,
/// selected by the target's platform-kind string. New kinds register without
/// touching the pipeline core.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn with_builtin_platforms() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PaginatedRestAdapter));
        registry.register(Arc::new(TokenGatedApiAdapter));
        registry.register(Arc::new(ServerRenderedAjaxAdapter));
        registry.register(Arc::new(FacetedSearchAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Config(format!("bad selector '{selector}': {e}")))
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Last number in free text; count markers usually read "Showing 1 to 24 of
/// 312" where the total comes last.
fn last_number(text: &str) -> Option<usize> {
    let mut found = None;
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() {
            // thousands separator inside one number
        } else if !current.is_empty() {
            if let Ok(v) = current.parse::<usize>() {
                found = Some(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<usize>() {
            found = Some(v);
        }
    }
    found
}

fn json_value_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_stringish(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(json_value_to_text)
}

fn json_node<'a>(value: &'a JsonValue, dotted_path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in dotted_path.split('.').filter(|s| !s.is_empty()) {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

/// Maps one source-native JSON object onto the shared raw shape, probing the
/// field spellings seen across catalog platforms.
pub fn listing_from_json(value: &JsonValue) -> RawListing {
    let mut listing = RawListing {
        stock_number: json_stringish(value, &["stock_number", "stockNumber", "stock_no", "stock", "sku"]),
        title: json_stringish(value, &["title", "name", "heading"]),
        price_text: json_stringish(value, &["price", "list_price", "listPrice", "price_text"]),
        msrp_text: json_stringish(value, &["msrp"]),
        sale_price_text: json_stringish(value, &["sale_price", "salePrice", "special_price", "specialPrice"]),
        year: json_stringish(value, &["year", "model_year", "modelYear"]),
        make: json_stringish(value, &["make", "manufacturer", "brand"]),
        model: json_stringish(value, &["model"]),
        category: json_stringish(value, &["category", "type", "trailer_type", "trailerType"]),
        size: json_stringish(value, &["size", "length", "dimensions"]),
        condition: json_stringish(value, &["condition"]),
        gvwr: json_stringish(value, &["gvwr", "GVWR"]),
        vin: json_stringish(value, &["vin", "VIN"]),
        location: json_stringish(value, &["location", "lot", "city"]),
        url: json_stringish(value, &["url", "link", "detail_url", "detailUrl", "permalink"]),
        attributes: BTreeMap::new(),
    };
    if let Some(attrs) = value
        .get("attributes")
        .or_else(|| value.get("specs"))
        .and_then(|v| v.as_object())
    {
        for (key, raw) in attrs {
            if let Some(text) = json_value_to_text(raw) {
                listing.attributes.insert(key.clone(), text);
            }
        }
    }
    listing
}

fn records_from_json_body(body: &[u8], items_path: &str) -> Result<Vec<RawListing>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Structural(format!("response is not valid JSON: {e}")))?;
    let node = if value.is_array() {
        &value
    } else {
        json_node(&value, items_path).ok_or_else(|| {
            AdapterError::Structural(format!("no '{items_path}' node in response"))
        })?
    };
    let array = node.as_array().ok_or_else(|| {
        AdapterError::Structural(format!("'{items_path}' is not an array of listings"))
    })?;
    Ok(array.iter().map(listing_from_json).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageProgress {
    Continue { empty_streak: usize },
    Stop,
}

/// Stop after two consecutive empty pages, or immediately after a page
/// shorter than the page size.
fn page_progress(fetched: usize, page_size: usize, empty_streak: usize) -> PageProgress {
    if fetched == 0 {
        if empty_streak + 1 >= 2 {
            PageProgress::Stop
        } else {
            PageProgress::Continue {
                empty_streak: empty_streak + 1,
            }
        }
    } else if fetched < page_size {
        PageProgress::Stop
    } else {
        PageProgress::Continue { empty_streak: 0 }
    }
}

/// Materially undercounted: parsed below 90% of what the page reports.
fn materially_undercounted(parsed: usize, reported: usize) -> bool {
    reported > 0 && parsed * 10 < reported * 9
}

/// Walks a paged endpoint until a stop condition fires. The second return
/// value is false when the page cap ended the walk while pages were still
/// full, meaning the collection may be truncated.
async fn collect_pages<F, Fut>(
    max_pages: u64,
    page_size: usize,
    mut fetch_page: F,
) -> Result<(Vec<RawListing>, bool), AdapterError>
where
    F: FnMut(u64) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<RawListing>, AdapterError>>,
{
    let mut records = Vec::new();
    let mut empty_streak = 0usize;
    for page in 1..=max_pages {
        let page_records = fetch_page(page).await?;
        let fetched = page_records.len();
        records.extend(page_records);
        match page_progress(fetched, page_size, empty_streak) {
            PageProgress::Continue { empty_streak: next } => empty_streak = next,
            PageProgress::Stop => return Ok((records, true)),
        }
    }
    Ok((records, false))
}

// ---------------------------------------------------------------------------
// paginated-rest
// ---------------------------------------------------------------------------

/// REST catalog APIs that expose a plain paged listing endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PaginatedRestAdapter;

#[async_trait]
impl PlatformAdapter for PaginatedRestAdapter {
    fn kind(&self) -> &'static str {
        KIND_PAGINATED_REST
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        _ctx: &ExtractContext,
        target: &ScrapeTarget,
    ) -> Result<Extraction, AdapterError> {
        let api_path = target.config_str("api_path").unwrap_or("/api/inventory");
        let page_param = target.config_str("page_param").unwrap_or("page");
        let per_page_param = target.config_str("per_page_param").unwrap_or("per_page");
        let items_path = target.config_str("items_path").unwrap_or("items");
        let page_size = target.config_u64("page_size").unwrap_or(50).max(1) as usize;
        let max_pages = target.config_u64("max_pages").unwrap_or(200);

        let endpoint = join_url(&target.base_url, api_path);
        let (records, complete) = collect_pages(max_pages, page_size, |page| {
            let url = format!("{endpoint}?{page_param}={page}&{per_page_param}={page_size}");
            async move {
                let resp = http.get(&target.source_name, &url).await?;
                records_from_json_body(&resp.body, items_path)
            }
        })
        .await?;

        let possibly_incomplete = !complete;
        if possibly_incomplete {
            warn!(
                source_name = %target.source_name,
                max_pages,
                parsed = records.len(),
                "page cap reached while pages were still full; batch may be truncated"
            );
        }

        Ok(Extraction {
            records,
            reported_total: None,
            possibly_incomplete,
        })
    }
}

// ---------------------------------------------------------------------------
// token-gated-api
// ---------------------------------------------------------------------------

/// APIs gated behind a short-lived token embedded in the landing page
/// markup. A missing token is a structural failure, not a retry case.
#[derive(Debug, Clone, Copy)]
pub struct TokenGatedApiAdapter;

fn extract_embedded_token(
    html: &str,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let Some(element) = document.select(&sel).next() else {
        return Ok(None);
    };
    let token = element
        .value()
        .attr(attr)
        .map(str::to_string)
        .and_then(text_or_none)
        .or_else(|| text_or_none(element.text().collect::<String>()));
    Ok(token)
}

#[async_trait]
impl PlatformAdapter for TokenGatedApiAdapter {
    fn kind(&self) -> &'static str {
        KIND_TOKEN_GATED_API
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        _ctx: &ExtractContext,
        target: &ScrapeTarget,
    ) -> Result<Extraction, AdapterError> {
        let token_selector = target
            .config_str("token_selector")
            .unwrap_or("meta[name=\"api-token\"]");
        let token_attr = target.config_str("token_attr").unwrap_or("content");
        let token_param = target.config_str("token_param").unwrap_or("token");
        let api_path = target.config_str("api_path").unwrap_or("/api/listings");
        let items_path = target.config_str("items_path").unwrap_or("items");
        let limit = target.config_u64("limit").unwrap_or(500);

        let landing = http.get(&target.source_name, &target.base_url).await?;
        let token = extract_embedded_token(&landing.text(), token_selector, token_attr)?
            .ok_or_else(|| {
                AdapterError::Structural(format!(
                    "no auth token at '{token_selector}' on {}",
                    target.base_url
                ))
            })?;

        let url = format!(
            "{}?{}={}&limit={}",
            join_url(&target.base_url, api_path),
            token_param,
            token,
            limit
        );
        let resp = http.get(&target.source_name, &url).await?;
        let records = records_from_json_body(&resp.body, items_path)?;

        Ok(Extraction {
            records,
            reported_total: None,
            possibly_incomplete: false,
        })
    }
}

// ---------------------------------------------------------------------------
// server-rendered-ajax
// ---------------------------------------------------------------------------

/// AJAX endpoints returning a server-rendered HTML fragment for the whole
/// inventory in one bulk POST.
#[derive(Debug, Clone, Copy)]
pub struct ServerRenderedAjaxAdapter;

struct AjaxSelectors {
    marker: Selector,
    container: Selector,
    title: Selector,
    price: Selector,
    link: Selector,
    spec: Selector,
    total: Selector,
}

impl AjaxSelectors {
    fn from_target(target: &ScrapeTarget) -> Result<Self, AdapterError> {
        Ok(Self {
            marker: parse_selector(target.config_str("marker_selector").unwrap_or(".stock-number"))?,
            container: parse_selector(target.config_str("container_selector").unwrap_or(".listing"))?,
            title: parse_selector(target.config_str("title_selector").unwrap_or(".listing-title"))?,
            price: parse_selector(target.config_str("price_selector").unwrap_or(".price"))?,
            link: parse_selector("a[href]")?,
            spec: parse_selector(target.config_str("spec_selector").unwrap_or(".specs li"))?,
            total: parse_selector(target.config_str("total_selector").unwrap_or(".results-count"))?,
        })
    }
}

fn clean_stock_text(text: &str) -> Option<String> {
    let after_hash = match text.rfind('#') {
        Some(idx) => &text[idx + 1..],
        None => text,
    };
    text_or_none(after_hash.to_string())
}

fn assign_labeled_attribute(listing: &mut RawListing, label: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    match label.trim().to_ascii_lowercase().as_str() {
        "gvwr" => listing.gvwr = Some(value.to_string()),
        "vin" => listing.vin = Some(value.to_string()),
        "condition" => listing.condition = Some(value.to_string()),
        "size" | "length" => listing.size = Some(value.to_string()),
        "location" => listing.location = Some(value.to_string()),
        "year" => listing.year = Some(value.to_string()),
        "make" | "manufacturer" => listing.make = Some(value.to_string()),
        "model" => listing.model = Some(value.to_string()),
        "type" | "category" => listing.category = Some(value.to_string()),
        "msrp" => listing.msrp_text = Some(value.to_string()),
        "sale price" | "special price" => listing.sale_price_text = Some(value.to_string()),
        other => {
            listing
                .attributes
                .insert(other.to_string(), value.to_string());
        }
    }
}

fn listing_from_fragment(
    marker: ElementRef<'_>,
    selectors: &AjaxSelectors,
    base_url: &str,
) -> RawListing {
    // The stock marker is the distinguishing element; the listing container
    // is found by walking its ancestors.
    let container = marker
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| selectors.container.matches(el))
        .unwrap_or(marker);

    let mut listing = RawListing {
        stock_number: clean_stock_text(&marker.text().collect::<String>()),
        title: select_first_text(container, &selectors.title),
        price_text: select_first_text(container, &selectors.price),
        url: container
            .select(&selectors.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|href| join_url(base_url, href)),
        ..RawListing::default()
    };

    for spec in container.select(&selectors.spec) {
        let text = spec.text().collect::<String>();
        if let Some((label, value)) = text.split_once(':') {
            assign_labeled_attribute(&mut listing, label, value);
        }
    }
    listing
}

fn parse_ajax_fragment(
    html: &str,
    selectors: &AjaxSelectors,
    base_url: &str,
) -> Result<(Vec<RawListing>, Option<usize>), AdapterError> {
    let document = Html::parse_fragment(html);
    let reported_total = document
        .select(&selectors.total)
        .next()
        .and_then(|el| last_number(&el.text().collect::<String>()));
    let markers: Vec<ElementRef<'_>> = document.select(&selectors.marker).collect();

    if markers.is_empty() {
        return match reported_total {
            Some(0) => Ok((Vec::new(), Some(0))),
            Some(n) => Err(AdapterError::Structural(format!(
                "page reports {n} listings but no stock markers matched"
            ))),
            None => Err(AdapterError::Structural(
                "neither stock markers nor a results count found in fragment".to_string(),
            )),
        };
    }

    let records = markers
        .into_iter()
        .map(|marker| listing_from_fragment(marker, selectors, base_url))
        .collect();
    Ok((records, reported_total))
}

#[async_trait]
impl PlatformAdapter for ServerRenderedAjaxAdapter {
    fn kind(&self) -> &'static str {
        KIND_SERVER_RENDERED_AJAX
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        _ctx: &ExtractContext,
        target: &ScrapeTarget,
    ) -> Result<Extraction, AdapterError> {
        let selectors = AjaxSelectors::from_target(target)?;
        let ajax_path = target.config_str("ajax_path").unwrap_or("/ajax/inventory");
        let limit = target.config_u64("limit").unwrap_or(1000);

        let mut form = vec![("limit".to_string(), limit.to_string())];
        if let Some(extra) = target.config_object("form") {
            for (key, value) in extra {
                if let Some(text) = json_value_to_text(value) {
                    form.push((key.clone(), text));
                }
            }
        }

        let url = join_url(&target.base_url, ajax_path);
        let resp = http.post_form(&target.source_name, &url, &form).await?;
        let (records, reported_total) =
            parse_ajax_fragment(&resp.text(), &selectors, &target.base_url)?;

        let mut possibly_incomplete = false;
        if let Some(total) = reported_total {
            if materially_undercounted(records.len(), total) {
                warn!(
                    source_name = %target.source_name,
                    parsed = records.len(),
                    reported = total,
                    "parsed materially fewer listings than the page reports"
                );
                possibly_incomplete = true;
            }
        }

        Ok(Extraction {
            records,
            reported_total,
            possibly_incomplete,
        })
    }
}

// ---------------------------------------------------------------------------
// faceted-search
// ---------------------------------------------------------------------------

/// Faceted-search frontends whose real query API is advertised in a JSON
/// config blob inside the rendered page.
#[derive(Debug, Clone, Copy)]
pub struct FacetedSearchAdapter;

fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_config_blob(html: &str, marker: &str) -> Result<JsonValue, AdapterError> {
    let idx = html
        .find(marker)
        .ok_or_else(|| AdapterError::Structural(format!("config marker '{marker}' not found")))?;
    let rest = &html[idx + marker.len()..];
    let start = rest.find('{').ok_or_else(|| {
        AdapterError::Structural(format!("no JSON object after config marker '{marker}'"))
    })?;
    let json_text = balanced_object(&rest[start..]).ok_or_else(|| {
        AdapterError::Structural(format!("unterminated JSON object after '{marker}'"))
    })?;
    serde_json::from_str(json_text)
        .map_err(|e| AdapterError::Structural(format!("config blob is not valid JSON: {e}")))
}

#[async_trait]
impl PlatformAdapter for FacetedSearchAdapter {
    fn kind(&self) -> &'static str {
        KIND_FACETED_SEARCH
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        _ctx: &ExtractContext,
        target: &ScrapeTarget,
    ) -> Result<Extraction, AdapterError> {
        let marker = target
            .config_str("config_marker")
            .unwrap_or("window.__SEARCH_CONFIG__ =");
        let api_field = target.config_str("api_field").unwrap_or("apiUrl");
        let total_field = target.config_str("total_field").unwrap_or("totalRows");
        let items_path = target.config_str("items_path").unwrap_or("rows");
        let max_pages = target.config_u64("max_pages").unwrap_or(200);

        let landing = http.get(&target.source_name, &target.base_url).await?;
        let blob = extract_config_blob(&landing.text(), marker)?;

        let api = blob
            .get(api_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AdapterError::Structural(format!("config blob has no '{api_field}' endpoint"))
            })?;
        let total = blob
            .get(total_field)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                AdapterError::Structural(format!("config blob has no '{total_field}' count"))
            })? as usize;
        let page_size = blob
            .get("pageSize")
            .and_then(|v| v.as_u64())
            .or_else(|| target.config_u64("page_size"))
            .unwrap_or(48)
            .max(1);
        let endpoint = join_url(&target.base_url, api);
        let filter = target
            .config_str("filter")
            .map(|f| format!("&filter={f}"))
            .unwrap_or_default();

        let mut records: Vec<RawListing> = Vec::new();
        let mut page = 1u64;
        while records.len() < total && page <= max_pages {
            // Empty facet selection retrieves the whole inventory.
            let url = format!("{endpoint}?page={page}&pageSize={page_size}&facets={filter}");
            let resp = http.get(&target.source_name, &url).await?;
            let page_records = records_from_json_body(&resp.body, items_path)?;
            if page_records.is_empty() {
                break;
            }
            records.extend(page_records);
            page += 1;
        }

        let possibly_incomplete = records.len() < total;
        if possibly_incomplete {
            warn!(
                source_name = %target.source_name,
                parsed = records.len(),
                reported = total,
                "facet API returned fewer rows than its advertised total"
            );
        }

        Ok(Extraction {
            records,
            reported_total: Some(total),
            possibly_incomplete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target_with(kind: &str) -> ScrapeTarget {
        ScrapeTarget {
            tenant_id: "t1".into(),
            source_name: "acme-trailers".into(),
            base_url: "https://acmetrailers.example".into(),
            platform_kind: kind.into(),
            config: BTreeMap::new(),
            enabled: true,
            expected_minimum_count: None,
            last_run_at: None,
        }
    }

    #[test]
    fn registry_dispatches_by_kind_string() {
        let registry = AdapterRegistry::with_builtin_platforms();
        assert!(registry.get(KIND_PAGINATED_REST).is_some());
        assert!(registry.get(KIND_FACETED_SEARCH).is_some());
        assert!(registry.get("carrier-pigeon").is_none());
        assert_eq!(registry.kinds().len(), 4);
    }

    #[test]
    fn pagination_stops_on_short_page_or_two_empty_pages() {
        assert_eq!(page_progress(50, 50, 0), PageProgress::Continue { empty_streak: 0 });
        assert_eq!(page_progress(12, 50, 0), PageProgress::Stop);
        assert_eq!(page_progress(0, 50, 0), PageProgress::Continue { empty_streak: 1 });
        assert_eq!(page_progress(0, 50, 1), PageProgress::Stop);
    }

    #[tokio::test]
    async fn page_walk_ending_at_the_cap_is_marked_truncated() {
        let (records, complete) = collect_pages(3, 2, |page| async move {
            Ok((0..2)
                .map(|i| RawListing {
                    stock_number: Some(format!("P{page}-{i}")),
                    ..RawListing::default()
                })
                .collect())
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 6);
        assert!(!complete, "full pages at the cap mean the walk may be truncated");
    }

    #[tokio::test]
    async fn page_walk_ending_on_a_short_page_is_complete() {
        let (records, complete) = collect_pages(10, 2, |page| async move {
            let count = if page < 3 { 2 } else { 1 };
            Ok((0..count)
                .map(|i| RawListing {
                    stock_number: Some(format!("P{page}-{i}")),
                    ..RawListing::default()
                })
                .collect())
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 5);
        assert!(complete);
    }

    #[test]
    fn undercount_threshold_is_ninety_percent() {
        assert!(!materially_undercounted(90, 100));
        assert!(materially_undercounted(89, 100));
        assert!(!materially_undercounted(0, 0));
    }

    #[test]
    fn json_listing_maps_alternate_field_spellings() {
        let value = json!({
            "stockNumber": "TR-1023",
            "name": "2024 Ironline 7x16 Dump",
            "price": 10995,
            "salePrice": "9995",
            "manufacturer": "Ironline",
            "trailerType": "dump",
            "detailUrl": "/inventory/tr-1023",
            "specs": {"Pull Type": "bumper", "Color": "black"}
        });
        let listing = listing_from_json(&value);
        assert_eq!(listing.stock_number.as_deref(), Some("TR-1023"));
        assert_eq!(listing.title.as_deref(), Some("2024 Ironline 7x16 Dump"));
        assert_eq!(listing.price_text.as_deref(), Some("10995"));
        assert_eq!(listing.sale_price_text.as_deref(), Some("9995"));
        assert_eq!(listing.make.as_deref(), Some("Ironline"));
        assert_eq!(listing.category.as_deref(), Some("dump"));
        assert_eq!(listing.url.as_deref(), Some("/inventory/tr-1023"));
        assert_eq!(listing.attributes.get("Pull Type").map(String::as_str), Some("bumper"));
    }

    #[test]
    fn records_require_an_array_node() {
        let body = br#"{"items": [{"stock": "A1"}, {"stock": "A2"}]}"#;
        let records = records_from_json_body(body, "items").unwrap();
        assert_eq!(records.len(), 2);

        let nested = br#"{"data": {"rows": [{"stock": "A1"}]}}"#;
        let records = records_from_json_body(nested, "data.rows").unwrap();
        assert_eq!(records.len(), 1);

        let err = records_from_json_body(br#"{"items": 7}"#, "items").unwrap_err();
        assert!(matches!(err, AdapterError::Structural(_)));
    }

    #[test]
    fn embedded_token_is_found_or_absent() {
        let html = r#"<html><head><meta name="api-token" content="abc123"></head></html>"#;
        let token = extract_embedded_token(html, "meta[name=\"api-token\"]", "content").unwrap();
        assert_eq!(token.as_deref(), Some("abc123"));

        let bare = "<html><head></head><body></body></html>";
        let missing = extract_embedded_token(bare, "meta[name=\"api-token\"]", "content").unwrap();
        assert!(missing.is_none());
    }

    const AJAX_FRAGMENT: &str = r#"
        <div class="results-count">Showing 1 to 2 of 2 trailers</div>
        <div class="listing">
          <h3 class="listing-title"><a href="/inventory/tr-1023">2024 Ironline 7x16 Dump</a></h3>
          <span class="stock-number">Stock #TR-1023</span>
          <div class="price">$10,995</div>
          <ul class="specs">
            <li>GVWR: 14000 lb</li>
            <li>Condition: New</li>
            <li>Pull Type: Bumper</li>
          </ul>
        </div>
        <div class="listing">
          <h3 class="listing-title"><a href="/inventory/tr-2044">2023 Havok 8.5x20 Enclosed</a></h3>
          <span class="stock-number">Stock #TR-2044</span>
          <div class="price">Call for price</div>
          <ul class="specs">
            <li>Size: 8.5x20</li>
          </ul>
        </div>
    "#;

    #[test]
    fn ajax_fragment_parses_via_stock_markers() {
        let target = target_with(KIND_SERVER_RENDERED_AJAX);
        let selectors = AjaxSelectors::from_target(&target).unwrap();
        let (records, total) =
            parse_ajax_fragment(AJAX_FRAGMENT, &selectors, &target.base_url).unwrap();

        assert_eq!(total, Some(2));
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.stock_number.as_deref(), Some("TR-1023"));
        assert_eq!(first.title.as_deref(), Some("2024 Ironline 7x16 Dump"));
        assert_eq!(first.price_text.as_deref(), Some("$10,995"));
        assert_eq!(first.gvwr.as_deref(), Some("14000 lb"));
        assert_eq!(first.condition.as_deref(), Some("New"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://acmetrailers.example/inventory/tr-1023")
        );
        assert_eq!(first.attributes.get("pull type").map(String::as_str), Some("Bumper"));

        let second = &records[1];
        assert_eq!(second.stock_number.as_deref(), Some("TR-2044"));
        assert_eq!(second.size.as_deref(), Some("8.5x20"));
    }

    #[test]
    fn ajax_fragment_with_no_markers_is_structural_unless_count_is_zero() {
        let target = target_with(KIND_SERVER_RENDERED_AJAX);
        let selectors = AjaxSelectors::from_target(&target).unwrap();

        let empty = r#"<div class="results-count">0 trailers</div><div class="empty"></div>"#;
        let (records, total) = parse_ajax_fragment(empty, &selectors, &target.base_url).unwrap();
        assert!(records.is_empty());
        assert_eq!(total, Some(0));

        let reshaped = r#"<div class="results-count">14 trailers</div><div class="cards"></div>"#;
        let err = parse_ajax_fragment(reshaped, &selectors, &target.base_url).unwrap_err();
        assert!(matches!(err, AdapterError::Structural(_)));

        let hollow = "<div><p>maintenance page</p></div>";
        let err = parse_ajax_fragment(hollow, &selectors, &target.base_url).unwrap_err();
        assert!(matches!(err, AdapterError::Structural(_)));
    }

    #[test]
    fn config_blob_extraction_handles_nested_braces_and_strings() {
        let html = r#"
            <script>
              window.__SEARCH_CONFIG__ = {"apiUrl": "/search/api", "totalRows": 87,
                "labels": {"empty": "no {matches}"}, "pageSize": 24};
            </script>
        "#;
        let blob = extract_config_blob(html, "window.__SEARCH_CONFIG__ =").unwrap();
        assert_eq!(blob["apiUrl"], "/search/api");
        assert_eq!(blob["totalRows"], 87);
        assert_eq!(blob["labels"]["empty"], "no {matches}");

        let err = extract_config_blob("<html></html>", "window.__SEARCH_CONFIG__ =").unwrap_err();
        assert!(matches!(err, AdapterError::Structural(_)));
    }

    #[test]
    fn url_join_and_count_parsing() {
        assert_eq!(
            join_url("https://a.example/", "/api/x"),
            "https://a.example/api/x"
        );
        assert_eq!(
            join_url("https://a.example", "api/x"),
            "https://a.example/api/x"
        );
        assert_eq!(
            join_url("https://a.example", "https://cdn.example/y"),
            "https://cdn.example/y"
        );
        assert_eq!(last_number("Showing 1 to 24 of 1,312 results"), Some(1312));
        assert_eq!(last_number("no digits"), None);
    }

    #[test]
    fn stock_marker_text_is_cleaned() {
        assert_eq!(clean_stock_text("Stock #TR-1023").as_deref(), Some("TR-1023"));
        assert_eq!(clean_stock_text("  8841  ").as_deref(), Some("8841"));
        assert_eq!(clean_stock_text("Stock #"), None);
    }
}

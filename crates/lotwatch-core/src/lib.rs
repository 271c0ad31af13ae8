//! Core domain model for lotwatch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-core";

/// Lifecycle of a canonical listing. `Sold` covers anything no longer
/// observed at the source; a fresh sighting of the same natural key
/// recreates the item as `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Sold,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Sold => "sold",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(ItemStatus::Available),
            "sold" => Some(ItemStatus::Sold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    NewListing,
    PriceDrop,
    PriceIncrease,
    Removed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::NewListing => "NEW_LISTING",
            ChangeType::PriceDrop => "PRICE_DROP",
            ChangeType::PriceIncrease => "PRICE_INCREASE",
            ChangeType::Removed => "REMOVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW_LISTING" => Some(ChangeType::NewListing),
            "PRICE_DROP" => Some(ChangeType::PriceDrop),
            "PRICE_INCREASE" => Some(ChangeType::PriceIncrease),
            "REMOVED" => Some(ChangeType::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One source to poll. Created by configuration; the pipeline only ever
/// touches `last_run_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub tenant_id: String,
    pub source_name: String,
    pub base_url: String,
    pub platform_kind: String,
    #[serde(default)]
    pub config: BTreeMap<String, JsonValue>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expected_minimum_count: Option<usize>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl ScrapeTarget {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }

    pub fn config_object(&self, key: &str) -> Option<&serde_json::Map<String, JsonValue>> {
        self.config.get(key).and_then(|v| v.as_object())
    }
}

/// A scraped listing normalized into the uniform schema.
///
/// Invariants: `natural_key` is unique within (tenant, source); the three
/// price fields are each `None` or strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub tenant_id: String,
    pub source_name: String,
    pub natural_key: String,
    pub title: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub size: Option<String>,
    pub price: Option<f64>,
    pub msrp: Option<f64>,
    pub sale_price: Option<f64>,
    pub gvwr: Option<String>,
    pub vin: Option<String>,
    pub condition: Option<String>,
    pub location: Option<String>,
    pub status: ItemStatus,
    pub specs: BTreeMap<String, String>,
    pub source_url: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalItem {
    pub fn mark_removed(&mut self, at: DateTime<Utc>) {
        self.status = ItemStatus::Sold;
        self.updated_at = at;
    }
}

/// Immutable record of a detected difference between two runs for the same
/// natural key. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub tenant_id: String,
    pub source_name: String,
    pub natural_key: String,
    pub title: String,
    pub change_type: ChangeType,
    pub old_price: Option<f64>,
    pub new_price: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

/// One record per invocation of a target. Created `Running`, finished
/// exactly once as `Success` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub items_found: u32,
    pub changes_detected: u32,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub fn start(tenant_id: &str, source_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            source_name: source_name.to_string(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            items_found: 0,
            changes_detected: 0,
            error_message: None,
        }
    }

    pub fn finish_success(&mut self, items_found: u32, changes_detected: u32, at: DateTime<Utc>) {
        self.status = RunStatus::Success;
        self.items_found = items_found;
        self.changes_detected = changes_detected;
        self.finished_at = Some(at);
        self.error_message = None;
    }

    pub fn finish_failed(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.finished_at = Some(at);
        self.error_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [ItemStatus::Available, ItemStatus::Sold] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("gone"), None);
    }

    #[test]
    fn change_type_serializes_as_wire_names() {
        let json = serde_json::to_string(&ChangeType::PriceDrop).unwrap();
        assert_eq!(json, "\"PRICE_DROP\"");
        assert_eq!(ChangeType::parse("NEW_LISTING"), Some(ChangeType::NewListing));
    }

    #[test]
    fn run_record_transitions_are_terminal_state_writes() {
        let started = Utc::now();
        let mut run = RunRecord::start("t1", "acme-trailers", started);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        run.finish_failed("boom", Utc::now());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("boom"));
        assert!(run.finished_at.is_some());
    }
}

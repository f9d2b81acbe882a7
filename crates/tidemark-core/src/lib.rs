//! Core domain model for the Tidemark sync pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tidemark-core";

/// One external-account credential set, loaded fresh per run from the
/// account registry. Never mutated in place: a refreshed token produces a
/// new `AccessCredentials` value downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAccount {
    pub account_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Entity families the pipeline knows how to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Orders,
    Listings,
    AdMetrics,
    Shipments,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Orders,
        EntityKind::Listings,
        EntityKind::AdMetrics,
        EntityKind::Shipments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Orders => "orders",
            EntityKind::Listings => "listings",
            EntityKind::AdMetrics => "ad_metrics",
            EntityKind::Shipments => "shipments",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// High-water mark of the last successful incremental sync for one
/// `(account, entity)` pair. Monotonically non-decreasing; advanced only
/// after the full page range is durably persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub account_id: String,
    pub entity: EntityKind,
    pub last_synced_at: DateTime<Utc>,
}

/// Opaque external-API record. Ephemeral: exists only within one
/// page-processing cycle.
pub type RawRecord = serde_json::Value;

/// The only value shapes storage will bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Rendering used for natural-key assembly and error reporting.
    pub fn render(&self) -> String {
        match self {
            ScalarValue::Null => String::new(),
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Text(s) => s.clone(),
            ScalarValue::Timestamp(ts) => ts.to_rfc3339(),
            ScalarValue::Json(v) => v.to_string(),
        }
    }
}

/// How a table's rows reach storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// `INSERT .. ON CONFLICT (key) DO UPDATE`.
    Upsert,
    /// Delete all rows for the parent keys present in the batch, then
    /// insert fresh. Used for child tables where composite-key upsert is
    /// awkward; scoped to an explicit parent-key set so no orphans remain.
    DeleteInsert {
        parent_columns: &'static [&'static str],
    },
}

/// Target-table contract an adapter writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
    pub disposition: WriteDisposition,
}

/// A flat column -> scalar mapping shaped for one target table.
///
/// Invariant (total defaulting): every column the adapter declares is
/// present with an explicit `ScalarValue`, never absent. Absence of a
/// source field maps to `Null`/`0`/`""`/`[]`, so storage contracts stay
/// stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub table: &'static str,
    pub columns: BTreeMap<String, ScalarValue>,
    /// Logical recency used by the deduplicator; `None` falls back to
    /// last-seen-wins.
    pub updated_at: Option<DateTime<Utc>>,
}

impl NormalizedRow {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            columns: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn set(&mut self, column: &str, value: ScalarValue) {
        self.columns.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        self.columns.get(column)
    }

    /// Natural key rendered from the table's key columns, used for
    /// deduplication and error reporting. Missing key columns render
    /// empty rather than panicking; the transformer invariant makes that
    /// unreachable for adapter-produced rows.
    pub fn natural_key(&self, key_columns: &[&str]) -> String {
        key_columns
            .iter()
            .map(|col| {
                self.columns
                    .get(*col)
                    .map(ScalarValue::render)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Ordered rows sharing one target table and natural-key shape.
#[derive(Debug, Clone)]
pub struct Batch {
    pub spec: TableSpec,
    pub rows: Vec<NormalizedRow>,
}

/// One recoverable error recorded during a run, queryable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub account_id: String,
    pub entity: Option<EntityKind>,
    pub key: Option<String>,
    pub message: String,
}

/// Run-scoped accumulator. Created at run start, mutated throughout,
/// emitted at run end; diagnostic only, never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRunStats {
    pub accounts_processed: usize,
    pub records_seen: usize,
    pub records_written: usize,
    pub records_skipped: usize,
    pub errors: Vec<RunError>,
}

impl SyncRunStats {
    pub fn record_error(
        &mut self,
        account_id: &str,
        entity: Option<EntityKind>,
        key: Option<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(RunError {
            account_id: account_id.to_string(),
            entity,
            key,
            message: message.into(),
        });
    }
}

/// Per-run window parameters. Absence of `from_date` makes the run
/// incremental-by-default: watermark if present, else the last
/// `default_hours`.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub days: Option<i64>,
    pub full_sync: bool,
}

impl RunParams {
    /// Resolve the incremental window for one `(account, entity)` sync.
    ///
    /// Window semantics are inclusive-from, exclusive-to; boundary overlap
    /// with the previous run is absorbed by upsert idempotence.
    /// Precedence for the lower bound: `full_sync` (epoch), explicit
    /// `from_date`, `days` back from now, watermark, `default_hours` back.
    pub fn resolve_window(
        &self,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        default_hours: i64,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to_date.unwrap_or(now);
        if self.full_sync {
            return (Utc.timestamp_opt(0, 0).single().unwrap_or(now), to);
        }
        let from = self
            .from_date
            .or_else(|| self.days.map(|d| now - Duration::days(d)))
            .or(watermark)
            .unwrap_or_else(|| now - Duration::hours(default_hours));
        (from, to)
    }
}

/// Error taxonomy for the whole pipeline. Isolation scope is part of the
/// contract: `Auth` fails one account, `TransientApi`/`RateLimited` abort
/// the current account/entity page range, `Transform` skips one record,
/// `Persistence` stops after the failing sub-batch.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("auth failed for account {account_id}: {reason}")]
    Auth { account_id: String, reason: String },

    #[error("transient api error: {0}")]
    TransientApi(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transform error (key {key:?}): {reason}")]
    Transform {
        key: Option<String>,
        reason: String,
    },

    #[error("persistence error after {written} rows: {reason}")]
    Persistence { written: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, 0, 0).single().unwrap()
    }

    #[test]
    fn natural_key_joins_key_columns_in_order() {
        let mut row = NormalizedRow::new("orders");
        row.set("account_id", ScalarValue::Text("acc-1".into()));
        row.set("order_id", ScalarValue::Text("900".into()));
        row.set("status", ScalarValue::Text("paid".into()));
        assert_eq!(row.natural_key(&["account_id", "order_id"]), "acc-1:900");
    }

    #[test]
    fn natural_key_renders_missing_columns_empty() {
        let row = NormalizedRow::new("orders");
        assert_eq!(row.natural_key(&["account_id", "order_id"]), ":");
    }

    #[test]
    fn window_defaults_to_watermark_when_no_explicit_bounds() {
        let params = RunParams::default();
        let (from, to) = params.resolve_window(Some(ts(6)), ts(12), 24);
        assert_eq!(from, ts(6));
        assert_eq!(to, ts(12));
    }

    #[test]
    fn window_falls_back_to_recent_hours_without_watermark() {
        let params = RunParams::default();
        let (from, to) = params.resolve_window(None, ts(12), 4);
        assert_eq!(from, ts(8));
        assert_eq!(to, ts(12));
    }

    #[test]
    fn explicit_from_date_beats_watermark() {
        let params = RunParams {
            from_date: Some(ts(2)),
            ..Default::default()
        };
        let (from, _) = params.resolve_window(Some(ts(9)), ts(12), 24);
        assert_eq!(from, ts(2));
    }

    #[test]
    fn days_beats_watermark_but_not_from_date() {
        let params = RunParams {
            days: Some(1),
            ..Default::default()
        };
        let (from, _) = params.resolve_window(Some(ts(11)), ts(12), 24);
        assert_eq!(from, ts(12) - Duration::days(1));
    }

    #[test]
    fn full_sync_starts_at_epoch() {
        let params = RunParams {
            full_sync: true,
            ..Default::default()
        };
        let (from, to) = params.resolve_window(Some(ts(9)), ts(12), 24);
        assert_eq!(from.timestamp(), 0);
        assert_eq!(to, ts(12));
    }

    #[test]
    fn entity_kind_names_are_stable() {
        let names: Vec<&str> = EntityKind::ALL.iter().map(|e| e.as_str()).collect();
        assert_eq!(names, vec!["orders", "listings", "ad_metrics", "shipments"]);
    }

    #[test]
    fn entity_kind_parse_round_trips_and_trims() {
        assert_eq!(EntityKind::parse("orders"), Some(EntityKind::Orders));
        assert_eq!(EntityKind::parse(" AD_METRICS "), Some(EntityKind::AdMetrics));
        assert_eq!(EntityKind::parse("unknown"), None);
    }
}

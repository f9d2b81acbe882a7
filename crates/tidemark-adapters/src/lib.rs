//! Per-entity record transformers: one raw marketplace record fans out to
//! zero or more normalized rows per target table.
//!
//! Every adapter applies total defaulting: a column the target table
//! declares is always present in the output row, mapped from the source
//! field when it exists and to a typed zero value (`""`, `0`, `Null`,
//! `[]`) when it does not.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tidemark_core::{
    EntityKind, NormalizedRow, RawRecord, ScalarValue, SyncError, TableSpec, WriteDisposition,
};

pub const CRATE_NAME: &str = "tidemark-adapters";

pub trait EntityAdapter: Send + Sync {
    fn entity(&self) -> EntityKind;

    /// Paginated listing endpoint this entity is fetched from.
    fn endpoint(&self) -> &'static str;

    /// Target tables in write order; parents before children.
    fn tables(&self) -> &'static [TableSpec];

    /// Pure fan-out from one raw record to normalized rows. Malformed
    /// records produce `SyncError::Transform` carrying the natural key
    /// when one is extractable; the caller skips the record and keeps the
    /// page alive.
    fn transform(
        &self,
        account_id: &str,
        record: &RawRecord,
    ) -> Result<Vec<NormalizedRow>, SyncError>;
}

pub fn adapter_for_entity(kind: EntityKind) -> &'static dyn EntityAdapter {
    match kind {
        EntityKind::Orders => &OrdersAdapter,
        EntityKind::Listings => &ListingsAdapter,
        EntityKind::AdMetrics => &AdMetricsAdapter,
        EntityKind::Shipments => &ShipmentsAdapter,
    }
}

// ── field extraction helpers ────────────────────────────────────────────

fn field<'a>(record: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = record;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Identifiers arrive as numbers or strings depending on the endpoint.
fn id_text(record: &JsonValue, path: &[&str]) -> Option<String> {
    match field(record, path)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_empty(record: &JsonValue, path: &[&str]) -> ScalarValue {
    let text = field(record, path)
        .and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default();
    ScalarValue::Text(text)
}

fn int_or_zero(record: &JsonValue, path: &[&str]) -> ScalarValue {
    ScalarValue::Int(
        field(record, path)
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
    )
}

fn float_or_zero(record: &JsonValue, path: &[&str]) -> ScalarValue {
    ScalarValue::Float(
        field(record, path)
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0),
    )
}

fn bool_or_false(record: &JsonValue, path: &[&str]) -> ScalarValue {
    ScalarValue::Bool(
        field(record, path)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
    )
}

fn json_or_empty_array(record: &JsonValue, path: &[&str]) -> ScalarValue {
    ScalarValue::Json(
        field(record, path)
            .cloned()
            .unwrap_or(JsonValue::Array(Vec::new())),
    )
}

fn parse_timestamp(record: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    field(record, path)
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn timestamp_or_null(record: &JsonValue, path: &[&str]) -> ScalarValue {
    parse_timestamp(record, path)
        .map(ScalarValue::Timestamp)
        .unwrap_or(ScalarValue::Null)
}

fn transform_err(key: Option<String>, reason: impl Into<String>) -> SyncError {
    SyncError::Transform {
        key,
        reason: reason.into(),
    }
}

// ── orders ──────────────────────────────────────────────────────────────

pub const ORDERS_TABLE: TableSpec = TableSpec {
    name: "orders",
    key_columns: &["account_id", "order_id"],
    disposition: WriteDisposition::Upsert,
};

/// Order lines carry no stable per-line id upstream, so the table is
/// replaced per parent order instead of upserted.
pub const ORDER_LINES_TABLE: TableSpec = TableSpec {
    name: "order_lines",
    key_columns: &["account_id", "order_id", "line_no"],
    disposition: WriteDisposition::DeleteInsert {
        parent_columns: &["account_id", "order_id"],
    },
};

struct OrdersAdapter;

impl EntityAdapter for OrdersAdapter {
    fn entity(&self) -> EntityKind {
        EntityKind::Orders
    }

    fn endpoint(&self) -> &'static str {
        "/orders/search"
    }

    fn tables(&self) -> &'static [TableSpec] {
        &[ORDERS_TABLE, ORDER_LINES_TABLE]
    }

    fn transform(
        &self,
        account_id: &str,
        record: &RawRecord,
    ) -> Result<Vec<NormalizedRow>, SyncError> {
        let order_id = id_text(record, &["id"])
            .ok_or_else(|| transform_err(None, "order record without id"))?;
        let updated_at = parse_timestamp(record, &["last_updated"])
            .or_else(|| parse_timestamp(record, &["date_created"]));

        let mut order = NormalizedRow::new(ORDERS_TABLE.name);
        order.updated_at = updated_at;
        order.set("account_id", ScalarValue::Text(account_id.to_string()));
        order.set("order_id", ScalarValue::Text(order_id.clone()));
        order.set("status", text_or_empty(record, &["status"]));
        order.set("date_created", timestamp_or_null(record, &["date_created"]));
        order.set("last_updated", timestamp_or_null(record, &["last_updated"]));
        order.set("total_amount", float_or_zero(record, &["total_amount"]));
        order.set("paid_amount", float_or_zero(record, &["paid_amount"]));
        order.set("currency", text_or_empty(record, &["currency_id"]));
        order.set("buyer_id", text_or_empty(record, &["buyer", "id"]));
        order.set("buyer_nickname", text_or_empty(record, &["buyer", "nickname"]));
        order.set("shipment_id", text_or_empty(record, &["shipping", "id"]));
        order.set("tags", json_or_empty_array(record, &["tags"]));

        let lines = field(record, &["order_items"])
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        order.set("line_count", ScalarValue::Int(lines.len() as i64));

        let mut rows = vec![order];
        for (idx, line) in lines.iter().enumerate() {
            let mut row = NormalizedRow::new(ORDER_LINES_TABLE.name);
            row.updated_at = updated_at;
            row.set("account_id", ScalarValue::Text(account_id.to_string()));
            row.set("order_id", ScalarValue::Text(order_id.clone()));
            row.set("line_no", ScalarValue::Int(idx as i64 + 1));
            row.set("item_id", text_or_empty(line, &["item", "id"]));
            row.set("title", text_or_empty(line, &["item", "title"]));
            row.set("variation_id", text_or_empty(line, &["item", "variation_id"]));
            row.set("quantity", int_or_zero(line, &["quantity"]));
            row.set("unit_price", float_or_zero(line, &["unit_price"]));
            row.set("full_unit_price", float_or_zero(line, &["full_unit_price"]));
            row.set("currency", text_or_empty(line, &["currency_id"]));
            row.set("sale_fee", float_or_zero(line, &["sale_fee"]));
            rows.push(row);
        }

        Ok(rows)
    }
}

// ── listings ────────────────────────────────────────────────────────────

pub const LISTINGS_TABLE: TableSpec = TableSpec {
    name: "listings",
    key_columns: &["account_id", "item_id", "variation_id"],
    disposition: WriteDisposition::Upsert,
};

/// A listing record is ambiguous about its own shape; it is classified
/// into exactly one of these cases and a canonical row is synthesized for
/// each, never conditionally skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingShape {
    /// Explicit variations array: one row per variation.
    MultiVariant,
    /// No variations but a family/catalog grouping: one synthetic row
    /// keyed on the sentinel variation.
    FamilyGrouped,
    /// Plain single listing: one synthetic single-variant row.
    Standalone,
}

impl ListingShape {
    pub fn classify(record: &RawRecord) -> Self {
        let has_variations = field(record, &["variations"])
            .and_then(JsonValue::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if has_variations {
            return ListingShape::MultiVariant;
        }
        let has_family = field(record, &["family_name"])
            .and_then(JsonValue::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if has_family {
            ListingShape::FamilyGrouped
        } else {
            ListingShape::Standalone
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingShape::MultiVariant => "multi_variant",
            ListingShape::FamilyGrouped => "family_grouped",
            ListingShape::Standalone => "standalone",
        }
    }
}

/// Sentinel variation id for rows synthesized from variation-less
/// listings; keeps the natural key total.
const SYNTHETIC_VARIATION_ID: &str = "0";

struct ListingsAdapter;

impl ListingsAdapter {
    fn base_row(&self, account_id: &str, item_id: &str, shape: ListingShape, record: &RawRecord) -> NormalizedRow {
        let mut row = NormalizedRow::new(LISTINGS_TABLE.name);
        row.updated_at = parse_timestamp(record, &["last_updated"]);
        row.set("account_id", ScalarValue::Text(account_id.to_string()));
        row.set("item_id", ScalarValue::Text(item_id.to_string()));
        row.set("title", text_or_empty(record, &["title"]));
        row.set("status", text_or_empty(record, &["status"]));
        row.set("listing_shape", ScalarValue::Text(shape.as_str().to_string()));
        row.set("family_name", text_or_empty(record, &["family_name"]));
        row.set("catalog_listing", bool_or_false(record, &["catalog_listing"]));
        row.set("permalink", text_or_empty(record, &["permalink"]));
        row.set("price", float_or_zero(record, &["price"]));
        row.set("base_price", float_or_zero(record, &["base_price"]));
        row.set("available_quantity", int_or_zero(record, &["available_quantity"]));
        row.set("sold_quantity", int_or_zero(record, &["sold_quantity"]));
        row.set("last_updated", timestamp_or_null(record, &["last_updated"]));
        row
    }
}

impl EntityAdapter for ListingsAdapter {
    fn entity(&self) -> EntityKind {
        EntityKind::Listings
    }

    fn endpoint(&self) -> &'static str {
        "/items/search"
    }

    fn tables(&self) -> &'static [TableSpec] {
        &[LISTINGS_TABLE]
    }

    fn transform(
        &self,
        account_id: &str,
        record: &RawRecord,
    ) -> Result<Vec<NormalizedRow>, SyncError> {
        let item_id = id_text(record, &["id"])
            .ok_or_else(|| transform_err(None, "listing record without id"))?;
        let shape = ListingShape::classify(record);

        match shape {
            ListingShape::MultiVariant => {
                let variations = field(record, &["variations"])
                    .and_then(JsonValue::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut rows = Vec::with_capacity(variations.len());
                for variation in &variations {
                    let variation_id = id_text(variation, &["id"]).ok_or_else(|| {
                        transform_err(
                            Some(format!("{account_id}:{item_id}")),
                            "variation without id",
                        )
                    })?;
                    let mut row = self.base_row(account_id, &item_id, shape, record);
                    row.set("variation_id", ScalarValue::Text(variation_id));
                    // Variation-level figures override the listing-level
                    // defaults where the source provides them.
                    if let Some(price) = field(variation, &["price"]).and_then(JsonValue::as_f64) {
                        row.set("price", ScalarValue::Float(price));
                    }
                    if let Some(qty) =
                        field(variation, &["available_quantity"]).and_then(JsonValue::as_i64)
                    {
                        row.set("available_quantity", ScalarValue::Int(qty));
                    }
                    if let Some(sold) =
                        field(variation, &["sold_quantity"]).and_then(JsonValue::as_i64)
                    {
                        row.set("sold_quantity", ScalarValue::Int(sold));
                    }
                    rows.push(row);
                }
                Ok(rows)
            }
            ListingShape::FamilyGrouped | ListingShape::Standalone => {
                let mut row = self.base_row(account_id, &item_id, shape, record);
                row.set(
                    "variation_id",
                    ScalarValue::Text(SYNTHETIC_VARIATION_ID.to_string()),
                );
                Ok(vec![row])
            }
        }
    }
}

// ── ad metrics ──────────────────────────────────────────────────────────

pub const AD_METRICS_TABLE: TableSpec = TableSpec {
    name: "ad_metrics",
    key_columns: &["account_id", "ad_id", "metric_date"],
    disposition: WriteDisposition::Upsert,
};

struct AdMetricsAdapter;

impl EntityAdapter for AdMetricsAdapter {
    fn entity(&self) -> EntityKind {
        EntityKind::AdMetrics
    }

    fn endpoint(&self) -> &'static str {
        "/ads/metrics"
    }

    fn tables(&self) -> &'static [TableSpec] {
        &[AD_METRICS_TABLE]
    }

    fn transform(
        &self,
        account_id: &str,
        record: &RawRecord,
    ) -> Result<Vec<NormalizedRow>, SyncError> {
        let ad_id = id_text(record, &["ad_id"])
            .ok_or_else(|| transform_err(None, "ad metric record without ad_id"))?;
        let metric_date = field(record, &["date"])
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                transform_err(
                    Some(format!("{account_id}:{ad_id}")),
                    "ad metric record without date",
                )
            })?;

        let mut row = NormalizedRow::new(AD_METRICS_TABLE.name);
        row.set("account_id", ScalarValue::Text(account_id.to_string()));
        row.set("ad_id", ScalarValue::Text(ad_id));
        row.set("metric_date", ScalarValue::Text(metric_date));
        row.set("campaign_id", text_or_empty(record, &["campaign_id"]));
        row.set("clicks", int_or_zero(record, &["clicks"]));
        row.set("impressions", int_or_zero(record, &["prints"]));
        row.set("cost", float_or_zero(record, &["cost"]));
        row.set("units_sold", int_or_zero(record, &["units_quantity"]));
        row.set("total_amount", float_or_zero(record, &["total_amount"]));
        row.set("currency", text_or_empty(record, &["currency_id"]));
        // Daily metric rows carry no update timestamp; recency for
        // duplicate keys falls back to last-seen-wins.
        Ok(vec![row])
    }
}

// ── shipments ───────────────────────────────────────────────────────────

pub const SHIPMENTS_TABLE: TableSpec = TableSpec {
    name: "shipments",
    key_columns: &["account_id", "shipment_id"],
    disposition: WriteDisposition::Upsert,
};

struct ShipmentsAdapter;

impl EntityAdapter for ShipmentsAdapter {
    fn entity(&self) -> EntityKind {
        EntityKind::Shipments
    }

    fn endpoint(&self) -> &'static str {
        "/shipments/search"
    }

    fn tables(&self) -> &'static [TableSpec] {
        &[SHIPMENTS_TABLE]
    }

    fn transform(
        &self,
        account_id: &str,
        record: &RawRecord,
    ) -> Result<Vec<NormalizedRow>, SyncError> {
        let shipment_id = id_text(record, &["id"])
            .ok_or_else(|| transform_err(None, "shipment record without id"))?;

        let mut row = NormalizedRow::new(SHIPMENTS_TABLE.name);
        row.updated_at = parse_timestamp(record, &["last_updated"]);
        row.set("account_id", ScalarValue::Text(account_id.to_string()));
        row.set("shipment_id", ScalarValue::Text(shipment_id));
        row.set("order_id", text_or_empty(record, &["order_id"]));
        row.set("status", text_or_empty(record, &["status"]));
        row.set("substatus", text_or_empty(record, &["substatus"]));
        row.set("tracking_number", text_or_empty(record, &["tracking_number"]));
        row.set("tracking_method", text_or_empty(record, &["tracking_method"]));
        row.set("logistic_type", text_or_empty(record, &["logistic_type"]));
        row.set("cost", float_or_zero(record, &["shipping_option", "cost"]));
        row.set("date_created", timestamp_or_null(record, &["date_created"]));
        row.set("last_updated", timestamp_or_null(record, &["last_updated"]));
        Ok(vec![row])
    }
}

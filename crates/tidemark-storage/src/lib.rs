//! Persistence for Tidemark: idempotent batch upserts and the watermark
//! repository, behind traits so the orchestrator can run against
//! in-memory fakes in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tidemark_core::{
    EntityKind, NormalizedRow, ScalarValue, TableSpec, Watermark, WriteDisposition,
};
use tracing::debug;

pub const CRATE_NAME: &str = "tidemark-storage";

/// Default cap on rows per upsert statement, sized to backend payload
/// limits.
pub const DEFAULT_MAX_BATCH_ROWS: usize = 300;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Partial-success report from a batch write: sub-batches `0..failed`
/// are durably written and stand (no compensating rollback); the caller
/// decides whether to retry or abort the run for that account.
#[derive(Debug, Error)]
#[error("sub-batch {failed_batch_index} failed after {written} rows: {source}")]
pub struct PartialUpsert {
    pub written: usize,
    pub failed_batch_index: usize,
    #[source]
    pub source: StorageError,
}

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Write one deduplicated batch for `spec`. Ok returns the number of
    /// rows written; Err carries the rows that still made it.
    async fn write_batch(
        &self,
        spec: &TableSpec,
        rows: &[NormalizedRow],
    ) -> Result<usize, PartialUpsert>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(
        &self,
        account_id: &str,
        entity: EntityKind,
    ) -> Result<Option<Watermark>, StorageError>;

    /// Advance the watermark; monotonic per `(account, entity)`, so a
    /// regression is silently a no-op.
    async fn advance(
        &self,
        account_id: &str,
        entity: EntityKind,
        to: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(StorageError::from)
}

/// Split rows into bounded sub-batches for sequential statements.
pub fn sub_batches(rows: &[NormalizedRow], max_batch_rows: usize) -> Vec<&[NormalizedRow]> {
    rows.chunks(max_batch_rows.max(1)).collect()
}

fn push_scalar<'qb, 'args>(
    separated: &mut sqlx::query_builder::Separated<'qb, 'args, Postgres, &'static str>,
    value: &ScalarValue,
) {
    match value {
        ScalarValue::Null => {
            separated.push("NULL");
        }
        ScalarValue::Bool(b) => {
            separated.push_bind(*b);
        }
        ScalarValue::Int(i) => {
            separated.push_bind(*i);
        }
        ScalarValue::Float(f) => {
            separated.push_bind(*f);
        }
        ScalarValue::Text(s) => {
            separated.push_bind(s.clone());
        }
        ScalarValue::Timestamp(ts) => {
            separated.push_bind(*ts);
        }
        ScalarValue::Json(v) => {
            separated.push_bind(v.clone());
        }
    }
}

/// Column order for a batch: the first row's keys. Adapter rows for one
/// table all carry the same column set (the total-defaulting invariant),
/// and `BTreeMap` keeps the order deterministic.
fn batch_columns(rows: &[NormalizedRow]) -> Vec<String> {
    rows.first()
        .map(|row| row.columns.keys().cloned().collect())
        .unwrap_or_default()
}

/// `INSERT .. ON CONFLICT (key) DO UPDATE SET col = EXCLUDED.col`.
/// Table and column identifiers come from static `TableSpec`s, never
/// from input data.
fn build_upsert(
    spec: &TableSpec,
    columns: &[String],
    rows: &[NormalizedRow],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", spec.name));
    qb.push(columns.join(", "));
    qb.push(") ");
    qb.push_values(rows, |mut b, row| {
        for column in columns {
            match row.columns.get(column) {
                Some(value) => push_scalar(&mut b, value),
                None => {
                    b.push("NULL");
                }
            }
        }
    });
    qb.push(" ON CONFLICT (");
    qb.push(spec.key_columns.join(", "));
    qb.push(")");

    let update_columns: Vec<&String> = columns
        .iter()
        .filter(|c| !spec.key_columns.contains(&c.as_str()))
        .collect();
    if update_columns.is_empty() {
        qb.push(" DO NOTHING");
    } else {
        qb.push(" DO UPDATE SET ");
        for (idx, column) in update_columns.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            qb.push(format!("{column} = EXCLUDED.{column}"));
        }
    }
    qb
}

fn build_insert(
    spec: &TableSpec,
    columns: &[String],
    rows: &[NormalizedRow],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", spec.name));
    qb.push(columns.join(", "));
    qb.push(") ");
    qb.push_values(rows, |mut b, row| {
        for column in columns {
            match row.columns.get(column) {
                Some(value) => push_scalar(&mut b, value),
                None => {
                    b.push("NULL");
                }
            }
        }
    });
    qb
}

/// Distinct parent-key tuples present in the batch, in first-seen order.
fn distinct_parents(rows: &[NormalizedRow], parent_columns: &[&str]) -> Vec<Vec<ScalarValue>> {
    let mut seen = std::collections::HashSet::new();
    let mut parents = Vec::new();
    for row in rows {
        let tuple: Vec<ScalarValue> = parent_columns
            .iter()
            .map(|col| row.get(col).cloned().unwrap_or(ScalarValue::Null))
            .collect();
        let rendered = tuple
            .iter()
            .map(ScalarValue::render)
            .collect::<Vec<_>>()
            .join("\u{1f}");
        if seen.insert(rendered) {
            parents.push(tuple);
        }
    }
    parents
}

#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
    max_batch_rows: usize,
}

impl PgRowStore {
    pub fn new(pool: PgPool, max_batch_rows: usize) -> Self {
        Self {
            pool,
            max_batch_rows: max_batch_rows.max(1),
        }
    }

    async fn upsert_chunks(
        &self,
        spec: &TableSpec,
        rows: &[NormalizedRow],
    ) -> Result<usize, PartialUpsert> {
        let columns = batch_columns(rows);
        let mut written = 0usize;

        for (idx, chunk) in sub_batches(rows, self.max_batch_rows).into_iter().enumerate() {
            let mut qb = build_upsert(spec, &columns, chunk);
            if let Err(err) = qb.build().execute(&self.pool).await {
                return Err(PartialUpsert {
                    written,
                    failed_batch_index: idx,
                    source: err.into(),
                });
            }
            written += chunk.len();
            debug!(table = spec.name, sub_batch = idx, rows = chunk.len(), "upserted");
        }

        Ok(written)
    }

    /// Delete-then-insert scoped to the batch's parent keys, in one
    /// transaction so readers never observe a parent with its lines
    /// missing. On failure nothing is written (`written = 0`).
    async fn replace_rows(
        &self,
        spec: &TableSpec,
        parent_columns: &[&str],
        rows: &[NormalizedRow],
    ) -> Result<usize, PartialUpsert> {
        let columns = batch_columns(rows);
        let parents = distinct_parents(rows, parent_columns);

        let failed = |idx: usize, err: StorageError| PartialUpsert {
            written: 0,
            failed_batch_index: idx,
            source: err,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| failed(0, e.into()))?;

        let mut delete = QueryBuilder::<Postgres>::new(format!("DELETE FROM {} WHERE (", spec.name));
        delete.push(parent_columns.join(", "));
        delete.push(") IN ");
        delete.push_tuples(&parents, |mut b, parent| {
            for value in parent.iter() {
                push_scalar(&mut b, value);
            }
        });
        delete
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| failed(0, e.into()))?;

        for (idx, chunk) in sub_batches(rows, self.max_batch_rows).into_iter().enumerate() {
            let mut qb = build_insert(spec, &columns, chunk);
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| failed(idx, e.into()))?;
        }

        tx.commit().await.map_err(|e| failed(0, e.into()))?;
        Ok(rows.len())
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn write_batch(
        &self,
        spec: &TableSpec,
        rows: &[NormalizedRow],
    ) -> Result<usize, PartialUpsert> {
        if rows.is_empty() {
            return Ok(0);
        }
        match spec.disposition {
            WriteDisposition::Upsert => self.upsert_chunks(spec, rows).await,
            WriteDisposition::DeleteInsert { parent_columns } => {
                self.replace_rows(spec, parent_columns, rows).await
            }
        }
    }
}

#[derive(Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(
        &self,
        account_id: &str,
        entity: EntityKind,
    ) -> Result<Option<Watermark>, StorageError> {
        let row = sqlx::query(
            "select last_synced_at from sync_watermarks
             where account_id = $1 and entity = $2",
        )
        .bind(account_id)
        .bind(entity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Watermark {
            account_id: account_id.to_string(),
            entity,
            last_synced_at: r.get("last_synced_at"),
        }))
    }

    async fn advance(
        &self,
        account_id: &str,
        entity: EntityKind,
        to: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "insert into sync_watermarks (account_id, entity, last_synced_at, updated_at)
             values ($1, $2, $3, now())
             on conflict (account_id, entity)
             do update set
               last_synced_at = greatest(sync_watermarks.last_synced_at, excluded.last_synced_at),
               updated_at = now()",
        )
        .bind(account_id)
        .bind(entity.as_str())
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tidemark_core::WriteDisposition;

    const TEST_TABLE: TableSpec = TableSpec {
        name: "tidemark_test_rows",
        key_columns: &["account_id", "entity_id"],
        disposition: WriteDisposition::Upsert,
    };

    fn mk_row(account: &str, id: i64, note: &str) -> NormalizedRow {
        let mut row = NormalizedRow::new(TEST_TABLE.name);
        row.set("account_id", ScalarValue::Text(account.to_string()));
        row.set("entity_id", ScalarValue::Int(id));
        row.set("note", ScalarValue::Text(note.to_string()));
        row.set("amount", ScalarValue::Float(id as f64));
        row
    }

    #[test]
    fn sub_batches_split_at_the_cap() {
        let rows: Vec<NormalizedRow> = (0..700).map(|i| mk_row("acc", i, "n")).collect();
        let chunks = sub_batches(&rows, 300);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![300, 300, 100]);
    }

    #[test]
    fn sub_batches_tolerate_zero_cap() {
        let rows: Vec<NormalizedRow> = (0..3).map(|i| mk_row("acc", i, "n")).collect();
        assert_eq!(sub_batches(&rows, 0).len(), 3);
    }

    #[test]
    fn upsert_sql_targets_conflict_key_and_updates_the_rest() {
        let rows = vec![mk_row("acc", 1, "hello")];
        let columns = batch_columns(&rows);
        let qb = build_upsert(&TEST_TABLE, &columns, &rows);
        let sql = qb.sql();

        assert!(sql.starts_with("INSERT INTO tidemark_test_rows (account_id, amount, entity_id, note)"));
        assert!(sql.contains("ON CONFLICT (account_id, entity_id)"));
        assert!(sql.contains("DO UPDATE SET amount = EXCLUDED.amount, note = EXCLUDED.note"));
        assert!(!sql.contains("EXCLUDED.account_id"));
    }

    #[test]
    fn upsert_sql_degrades_to_do_nothing_when_all_columns_are_keys() {
        const KEYS_ONLY: TableSpec = TableSpec {
            name: "keys_only",
            key_columns: &["account_id", "entity_id"],
            disposition: WriteDisposition::Upsert,
        };
        let mut row = NormalizedRow::new(KEYS_ONLY.name);
        row.set("account_id", ScalarValue::Text("acc".into()));
        row.set("entity_id", ScalarValue::Int(1));

        let rows = vec![row];
        let columns = batch_columns(&rows);
        let qb = build_upsert(&KEYS_ONLY, &columns, &rows);
        assert!(qb.sql().contains("DO NOTHING"));
    }

    #[test]
    fn null_scalars_are_inlined_not_bound() {
        let mut row = mk_row("acc", 1, "n");
        row.set("note", ScalarValue::Null);
        let rows = vec![row];
        let columns = batch_columns(&rows);
        let qb = build_upsert(&TEST_TABLE, &columns, &rows);
        assert!(qb.sql().contains("NULL"));
    }

    #[test]
    fn distinct_parents_keep_first_seen_order() {
        let rows = vec![
            mk_row("acc", 7, "a"),
            mk_row("acc", 7, "b"),
            mk_row("acc", 3, "c"),
        ];
        let parents = distinct_parents(&rows, &["account_id", "entity_id"]);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0][1], ScalarValue::Int(7));
        assert_eq!(parents[1][1], ScalarValue::Int(3));
    }

    // Postgres-backed coverage below runs only when TEST_DATABASE_URL is
    // set, mirroring how the watermark repository is exercised in CI.

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");

        sqlx::query(
            "create table if not exists tidemark_test_rows (
               account_id text not null,
               entity_id bigint not null,
               note text,
               amount double precision,
               primary key (account_id, entity_id)
             )",
        )
        .execute(&pool)
        .await
        .ok()?;

        sqlx::query(
            "create table if not exists sync_watermarks (
               account_id text not null,
               entity text not null,
               last_synced_at timestamptz not null,
               updated_at timestamptz not null default now(),
               primary key (account_id, entity)
             )",
        )
        .execute(&pool)
        .await
        .ok()?;

        Some(pool)
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let Some(pool) = test_pool().await else { return };
        let store = PgRowStore::new(pool.clone(), 10);
        let account = format!("idem-{}", std::process::id());
        let rows: Vec<NormalizedRow> = (0..25).map(|i| mk_row(&account, i, "v1")).collect();

        let first = store.write_batch(&TEST_TABLE, &rows).await.expect("first write");
        let second = store.write_batch(&TEST_TABLE, &rows).await.expect("second write");
        assert_eq!(first, 25);
        assert_eq!(second, 25);

        let count: i64 = sqlx::query("select count(*) from tidemark_test_rows where account_id = $1")
            .bind(&account)
            .fetch_one(&pool)
            .await
            .expect("count")
            .get(0);
        assert_eq!(count, 25);
    }

    #[tokio::test]
    async fn upsert_overwrites_non_key_columns() {
        let Some(pool) = test_pool().await else { return };
        let store = PgRowStore::new(pool.clone(), 10);
        let account = format!("overwrite-{}", std::process::id());

        store
            .write_batch(&TEST_TABLE, &[mk_row(&account, 1, "old")])
            .await
            .expect("write old");
        store
            .write_batch(&TEST_TABLE, &[mk_row(&account, 1, "new")])
            .await
            .expect("write new");

        let note: String = sqlx::query(
            "select note from tidemark_test_rows where account_id = $1 and entity_id = 1",
        )
        .bind(&account)
        .fetch_one(&pool)
        .await
        .expect("note")
        .get(0);
        assert_eq!(note, "new");
    }

    #[tokio::test]
    async fn watermark_advance_is_monotonic() {
        let Some(pool) = test_pool().await else { return };
        let store = PgWatermarkStore::new(pool);
        let account = format!("wm-{}", std::process::id());
        let later = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let earlier = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().unwrap();

        assert!(store.get(&account, EntityKind::Orders).await.expect("get").is_none());

        store
            .advance(&account, EntityKind::Orders, later)
            .await
            .expect("advance");
        store
            .advance(&account, EntityKind::Orders, earlier)
            .await
            .expect("regressing advance is a no-op");

        let current = store
            .get(&account, EntityKind::Orders)
            .await
            .expect("get")
            .expect("should exist");
        assert_eq!(current.last_synced_at, later);
        assert_eq!(current.entity, EntityKind::Orders);
    }
}

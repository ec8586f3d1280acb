//! Postgres-backed stock store.
//!
//! Ledger rows, summaries, daily balances, the outbox and the inventory
//! journal live in one database so that every posting commits atomically.
//! The schema is in `migrations/0001_stock_ledger.sql` ([`apply_schema`]).
//!
//! ## Locking
//!
//! - The business-wide stock lock is a transaction-scoped advisory lock
//!   (`pg_advisory_xact_lock`) keyed by the business id.
//! - Summary rows are created with `INSERT .. ON CONFLICT DO NOTHING` and then
//!   row-locked with `SELECT .. FOR UPDATE`.
//! - Every transaction sets `lock_timeout`, so a stuck lock surfaces as a
//!   transient error instead of a hang.
//! - Outbox claims use `FOR UPDATE SKIP LOCKED`, so workers never block each other.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert of the same row |
//! | Database (lock not available) | `55P03` | `Concurrency` | `lock_timeout` elapsed |
//! | Database (serialization failure) | `40001` | `Concurrency` | Conflicting concurrent transaction |
//! | Database (deadlock detected) | `40P01` | `Concurrency` | Lock cycle broken by the server |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | RowNotFound | N/A | `NotFound` | A row the operation needs is missing |
//! | ColumnDecode / Decode | N/A | `Serialization` | Stored value cannot be decoded |
//! | Other | N/A | `Backend` | Network errors, pool timeouts, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresStockStore` is `Send + Sync`. Its synchronous API drives SQLx on a
//! captured Tokio runtime handle, so it must be called from plain threads
//! (such as the outbox relay's), never from inside an async task.

use chrono::{DateTime, NaiveDate, Utc};
use core::str::FromStr;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{Span, instrument, warn};

use stockbook_accounting::{JournalEntry, JournalLine};
use stockbook_core::{
    BusinessId, JournalEntryId, MessageId, OutboxAction, ReferenceId, ReferenceType, StockHistoryId,
    WarehouseId,
};
use stockbook_inventory::{Bucket, MovementFlags, ProductKey, StockBuckets, StockHistory, StockKey};
use stockbook_outbox::{
    DeliveryFailure, DeliveryState, MessageStatus, NewOutboxMessage, OutboxMessage, OutboxRecord,
};

use super::r#trait::{
    DailyBalance, HistoryFilter, IntegrationEvent, StockStore, StockSummary, StockTx, StoreError,
    StoreResult, SummaryLock, ensure_business,
};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

/// Class half of the advisory lock key used for the per-business stock lock.
const STOCK_LOCK_CLASS: i32 = 0x5354_4b4c;

const KEY_MATCH: &str = "business_id = $1 AND warehouse_id = $2 AND product_type = $3 \
                         AND product_id = $4 AND batch_number = $5";

const KEY_COLUMNS: &str = "business_id, warehouse_id, product_type, product_id, batch_number";

const BUCKET_COLUMNS: &str = "opening_qty, received_qty, sale_qty, committed_qty, \
                              transfer_in_qty, transfer_out_qty, adjusted_in_qty, \
                              adjusted_out_qty, current_qty";

const HISTORY_COLUMNS: &str = "id, business_id, warehouse_id, product_type, product_id, \
                               batch_number, stock_date, qty, base_unit_value, reference_type, \
                               reference_id, reference_detail_id, cumulative_sequence, \
                               is_outgoing, is_transfer_in, is_reversal, \
                               reversed_by_stock_history_id, created_at";

const OUTBOX_COLUMNS: &str = "id, sequence, business_id, reference_type, reference_id, action, \
                              payload, status, attempts, last_error, next_attempt_at, \
                              claimed_until, processed_at, created_at";

/// Create the stock ledger tables if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    Ok(())
}

/// Postgres-backed stock store.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    handle: Handle,
    lock_timeout: Duration,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool,
            handle,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Build a store bound to the Tokio runtime of the caller.
    pub fn from_current_runtime(pool: PgPool) -> StoreResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| StoreError::Backend(format!("no tokio runtime available: {e}")))?;
        Ok(Self::new(pool, handle))
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn begin(&self, business_id: BusinessId) -> StoreResult<PgStockTx> {
        let mut tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;

        let timeout = format!("{}ms", self.lock_timeout.as_millis());
        self.handle
            .block_on(
                sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                    .bind(timeout)
                    .execute(&mut *tx),
            )
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PgStockTx {
            tx,
            handle: self.handle.clone(),
            business_id,
        })
    }
}

impl StockStore for PostgresStockStore {
    fn transact<T, E, F>(&self, business_id: BusinessId, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StockTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut pg = self.begin(business_id)?;
        match work(&mut pg) {
            Ok(value) => {
                self.handle
                    .block_on(pg.tx.commit())
                    .map_err(|e| map_sqlx_error("commit", e))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.handle.block_on(pg.tx.rollback()) {
                    warn!(business_id = %business_id, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(operation = "claim_next_message", message_id), err)]
    fn claim_next_message(
        &self,
        business_id: Option<BusinessId>,
        lease: Duration,
    ) -> StoreResult<Option<OutboxRecord>> {
        let sql = format!(
            r#"
            UPDATE pub_sub_message_records
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT c.id
                FROM pub_sub_message_records c
                WHERE c.status = 'pending'
                  AND c.next_attempt_at <= NOW()
                  AND (c.claimed_until IS NULL OR c.claimed_until <= NOW())
                  AND ($1::uuid IS NULL OR c.business_id = $1)
                  AND NOT EXISTS (
                      SELECT 1
                      FROM pub_sub_message_records e
                      WHERE e.business_id = c.business_id
                        AND e.reference_type = c.reference_type
                        AND e.reference_id = c.reference_id
                        AND e.sequence < c.sequence
                        AND e.status <> 'processed'
                  )
                ORDER BY c.sequence
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let row = self
            .handle
            .block_on(
                sqlx::query(&sql)
                    .bind(business_id.map(|b| *b.as_uuid()))
                    .bind(lease.as_secs_f64())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("claim_next_message", e))?;

        let record = row
            .map(|r| OutboxRow::from_row(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("claim_next_message", e))?
            .map(|r| r.0);
        if let Some(record) = &record {
            Span::current().record("message_id", tracing::field::display(record.message.id()));
        }
        Ok(record)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id()), err)]
    fn record_delivery_failure(
        &self,
        message: &OutboxMessage,
        failure: &DeliveryFailure,
    ) -> StoreResult<()> {
        let query = match failure {
            DeliveryFailure::Retry {
                error,
                next_attempt_at,
            } => sqlx::query(
                r#"
                UPDATE pub_sub_message_records
                SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3,
                    claimed_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(*message.id().as_uuid())
            .bind(error.as_str())
            .bind(*next_attempt_at),
            DeliveryFailure::DeadLetter { error } => sqlx::query(
                r#"
                UPDATE pub_sub_message_records
                SET attempts = attempts + 1, last_error = $2, status = 'dead_lettered',
                    claimed_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(*message.id().as_uuid())
            .bind(error.as_str()),
        };

        let result = self
            .handle
            .block_on(query.execute(&self.pool))
            .map_err(|e| map_sqlx_error("record_delivery_failure", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox message {}", message.id())));
        }
        Ok(())
    }

    fn undelivered_messages(&self, business_id: BusinessId) -> StoreResult<Vec<OutboxRecord>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM pub_sub_message_records \
             WHERE business_id = $1 AND status <> 'processed' ORDER BY sequence"
        );
        let rows = self
            .handle
            .block_on(sqlx::query(&sql).bind(business_id.as_uuid()).fetch_all(&self.pool))
            .map_err(|e| map_sqlx_error("undelivered_messages", e))?;
        decode_rows::<OutboxRow>(&rows, "undelivered_messages")
            .map(|rows| rows.into_iter().map(|r| r.0).collect())
    }
}

/// One open Postgres transaction scoped to a business.
struct PgStockTx {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
    business_id: BusinessId,
}

impl PgStockTx {
    fn conn(&mut self) -> (&mut PgConnection, &Handle) {
        (&mut *self.tx, &self.handle)
    }

    fn check_scope(&self, business_id: BusinessId, what: &str) -> StoreResult<()> {
        if business_id != self.business_id {
            return Err(StoreError::TenantIsolation(format!(
                "{what} of business {business_id} written in a transaction of {}",
                self.business_id
            )));
        }
        Ok(())
    }
}

impl StockTx for PgStockTx {
    fn business_id(&self) -> BusinessId {
        self.business_id
    }

    #[instrument(skip(self), fields(business_id = %self.business_id), err)]
    fn acquire_stock_lock(&mut self) -> StoreResult<()> {
        let business = *self.business_id.as_uuid();
        let (conn, handle) = self.conn();
        handle
            .block_on(
                sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2::uuid::text))")
                    .bind(STOCK_LOCK_CLASS)
                    .bind(business)
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error("acquire_stock_lock", e))?;
        Ok(())
    }

    #[instrument(skip(self, key), fields(key = %key), err)]
    fn lock_summary(&mut self, key: &StockKey) -> StoreResult<SummaryLock> {
        ensure_business(self.business_id, key)?;
        let insert = format!(
            "INSERT INTO stock_summaries ({KEY_COLUMNS}) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT DO NOTHING"
        );
        let select = format!(
            "SELECT {KEY_COLUMNS}, {BUCKET_COLUMNS}, last_sequence, updated_at \
             FROM stock_summaries WHERE {KEY_MATCH} FOR UPDATE"
        );

        let (conn, handle) = self.conn();
        let (inserted, row) = handle
            .block_on(async {
                let inserted = bind_key(sqlx::query(&insert), key).execute(&mut *conn).await?;
                let row = bind_key(sqlx::query(&select), key).fetch_one(&mut *conn).await?;
                Ok::<_, sqlx::Error>((inserted, row))
            })
            .map_err(|e| map_sqlx_error("lock_summary", e))?;

        let summary = SummaryRow::from_row(&row).map_err(|e| map_sqlx_error("lock_summary", e))?;
        Ok(SummaryLock {
            created: inserted.rows_affected() == 1,
            summary: summary.0,
        })
    }

    fn next_cumulative_sequence(&mut self, key: &StockKey) -> StoreResult<i64> {
        ensure_business(self.business_id, key)?;
        let sql = format!(
            "UPDATE stock_summaries SET last_sequence = last_sequence + 1 \
             WHERE {KEY_MATCH} RETURNING last_sequence"
        );
        let (conn, handle) = self.conn();
        let row = handle
            .block_on(bind_key(sqlx::query(&sql), key).fetch_optional(conn))
            .map_err(|e| map_sqlx_error("next_cumulative_sequence", e))?
            .ok_or_else(|| StoreError::NotFound(format!("stock summary {key}")))?;
        row.try_get("last_sequence")
            .map_err(|e| map_sqlx_error("next_cumulative_sequence", e))
    }

    #[instrument(skip(self, key), fields(key = %key, bucket = bucket.as_str()), err)]
    fn increment_summary(
        &mut self,
        key: &StockKey,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()> {
        ensure_business(self.business_id, key)?;
        let column = bucket.column();
        let sql = format!(
            "UPDATE stock_summaries SET {column} = {column} + $6, \
             current_qty = current_qty + $7, updated_at = NOW() WHERE {KEY_MATCH}"
        );
        let (conn, handle) = self.conn();
        let result = handle
            .block_on(
                bind_key(sqlx::query(&sql), key)
                    .bind(bucket_delta)
                    .bind(bucket.signed_effect(bucket_delta))
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error("increment_summary", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("stock summary {key}")));
        }
        Ok(())
    }

    #[instrument(skip(self, key), fields(key = %key, bucket = bucket.as_str()), err)]
    fn increment_daily_balance(
        &mut self,
        key: &StockKey,
        date: NaiveDate,
        bucket: Bucket,
        bucket_delta: Decimal,
    ) -> StoreResult<()> {
        ensure_business(self.business_id, key)?;
        // Seed the day from the latest earlier balance, then move it and
        // every later balance.
        let seed = format!(
            r#"
            INSERT INTO stock_summary_daily_balances ({KEY_COLUMNS}, balance_date, {BUCKET_COLUMNS})
            SELECT $1, $2, $3, $4, $5, $6,
                   COALESCE(prev.opening_qty, 0), COALESCE(prev.received_qty, 0),
                   COALESCE(prev.sale_qty, 0), COALESCE(prev.committed_qty, 0),
                   COALESCE(prev.transfer_in_qty, 0), COALESCE(prev.transfer_out_qty, 0),
                   COALESCE(prev.adjusted_in_qty, 0), COALESCE(prev.adjusted_out_qty, 0),
                   COALESCE(prev.current_qty, 0)
            FROM (SELECT 1) AS seed
            LEFT JOIN LATERAL (
                SELECT {BUCKET_COLUMNS}
                FROM stock_summary_daily_balances
                WHERE {KEY_MATCH} AND balance_date < $6
                ORDER BY balance_date DESC
                LIMIT 1
            ) prev ON TRUE
            ON CONFLICT DO NOTHING
            "#
        );
        let column = bucket.column();
        let update = format!(
            "UPDATE stock_summary_daily_balances SET {column} = {column} + $7, \
             current_qty = current_qty + $8 WHERE {KEY_MATCH} AND balance_date >= $6"
        );

        let (conn, handle) = self.conn();
        handle
            .block_on(async {
                bind_key(sqlx::query(&seed), key)
                    .bind(date)
                    .execute(&mut *conn)
                    .await?;
                bind_key(sqlx::query(&update), key)
                    .bind(date)
                    .bind(bucket_delta)
                    .bind(bucket.signed_effect(bucket_delta))
                    .execute(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("increment_daily_balance", e))?;
        Ok(())
    }

    #[instrument(skip(self, row), fields(stock_history_id = %row.id, key = %row.key), err)]
    fn insert_history(&mut self, row: &StockHistory) -> StoreResult<()> {
        ensure_business(self.business_id, &row.key)?;
        let sql = format!(
            "INSERT INTO stock_histories ({HISTORY_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        let (conn, handle) = self.conn();
        handle
            .block_on(
                sqlx::query(&sql)
                    .bind(row.id.as_uuid())
                    .bind(row.key.business_id.as_uuid())
                    .bind(row.key.warehouse_id.as_uuid())
                    .bind(row.key.product.product_type.as_str())
                    .bind(row.key.product.product_id.as_uuid())
                    .bind(row.key.batch_number.as_str())
                    .bind(row.stock_date)
                    .bind(row.quantity)
                    .bind(row.base_unit_value)
                    .bind(row.reference_type.as_str())
                    .bind(row.reference_id.as_uuid())
                    .bind(row.reference_detail_id.as_uuid())
                    .bind(row.cumulative_sequence)
                    .bind(row.flags.is_outgoing)
                    .bind(row.flags.is_transfer_in)
                    .bind(row.is_reversal)
                    .bind(row.reversed_by_stock_history_id.map(|id| *id.as_uuid()))
                    .bind(row.created_at)
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error("insert_history", e))?;
        Ok(())
    }

    fn mark_reversed(&mut self, id: StockHistoryId, reversed_by: StockHistoryId) -> StoreResult<()> {
        let business = *self.business_id.as_uuid();
        let (conn, handle) = self.conn();
        let result = handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE stock_histories
                    SET reversed_by_stock_history_id = $3
                    WHERE business_id = $1 AND id = $2
                      AND is_reversal = FALSE AND reversed_by_stock_history_id IS NULL
                    "#,
                )
                .bind(business)
                .bind(id.as_uuid())
                .bind(reversed_by.as_uuid())
                .execute(conn),
            )
            .map_err(|e| map_sqlx_error("mark_reversed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "stock history {id} is missing or already reversed"
            )));
        }
        Ok(())
    }

    fn history_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<StockHistory>> {
        let business = *self.business_id.as_uuid();
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM stock_histories \
             WHERE business_id = $1 AND reference_type = $2 AND reference_id = $3 \
             ORDER BY stock_date, cumulative_sequence"
        );
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(business)
                    .bind(reference_type.as_str())
                    .bind(reference_id.as_uuid())
                    .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("history_for_reference", e))?;
        decode_history(&rows, "history_for_reference")
    }

    fn history_for_key(&mut self, key: &StockKey) -> StoreResult<Vec<StockHistory>> {
        ensure_business(self.business_id, key)?;
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM stock_histories WHERE {KEY_MATCH} \
             ORDER BY stock_date, cumulative_sequence"
        );
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(bind_key(sqlx::query(&sql), key).fetch_all(conn))
            .map_err(|e| map_sqlx_error("history_for_key", e))?;
        decode_history(&rows, "history_for_key")
    }

    #[instrument(skip(self), fields(business_id = %self.business_id, row_count), err)]
    fn history(&mut self, filter: &HistoryFilter) -> StoreResult<Vec<StockHistory>> {
        let business = *self.business_id.as_uuid();
        let sql = format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM stock_histories
            WHERE business_id = $1
              AND ($2::uuid IS NULL OR warehouse_id = $2)
              AND ($3::text IS NULL OR product_type = $3)
              AND ($4::uuid IS NULL OR product_id = $4)
              AND ($5::date IS NULL OR stock_date >= $5)
              AND ($6::date IS NULL OR stock_date <= $6)
              AND (NOT $7 OR (is_reversal = FALSE AND reversed_by_stock_history_id IS NULL))
            ORDER BY stock_date, warehouse_id, product_type, product_id, batch_number, cumulative_sequence
            "#
        );
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(business)
                    .bind(filter.warehouse_id.map(|w| *w.as_uuid()))
                    .bind(filter.product.map(|p| p.product_type.as_str()))
                    .bind(filter.product.map(|p| *p.product_id.as_uuid()))
                    .bind(filter.from)
                    .bind(filter.until)
                    .bind(filter.valid_only)
                    .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("history", e))?;
        Span::current().record("row_count", rows.len());
        decode_history(&rows, "history")
    }

    fn summaries(&mut self, warehouse_id: Option<WarehouseId>) -> StoreResult<Vec<StockSummary>> {
        let business = *self.business_id.as_uuid();
        let sql = format!(
            "SELECT {KEY_COLUMNS}, {BUCKET_COLUMNS}, last_sequence, updated_at \
             FROM stock_summaries WHERE business_id = $1 AND ($2::uuid IS NULL OR warehouse_id = $2) \
             ORDER BY {KEY_COLUMNS}"
        );
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(business)
                    .bind(warehouse_id.map(|w| *w.as_uuid()))
                    .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("summaries", e))?;
        decode_rows::<SummaryRow>(&rows, "summaries").map(|rows| rows.into_iter().map(|r| r.0).collect())
    }

    fn daily_balances_as_of(
        &mut self,
        as_of: NaiveDate,
        warehouse_id: Option<WarehouseId>,
    ) -> StoreResult<Vec<DailyBalance>> {
        let business = *self.business_id.as_uuid();
        let sql = format!(
            r#"
            SELECT DISTINCT ON ({KEY_COLUMNS}) {KEY_COLUMNS}, balance_date, {BUCKET_COLUMNS}
            FROM stock_summary_daily_balances
            WHERE business_id = $1
              AND ($2::uuid IS NULL OR warehouse_id = $2)
              AND balance_date <= $3
            ORDER BY {KEY_COLUMNS}, balance_date DESC
            "#
        );
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(business)
                    .bind(warehouse_id.map(|w| *w.as_uuid()))
                    .bind(as_of)
                    .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("daily_balances_as_of", e))?;
        decode_rows::<DailyBalanceRow>(&rows, "daily_balances_as_of")
            .map(|rows| rows.into_iter().map(|r| r.0).collect())
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, reference_id = %message.reference_id), err)]
    fn insert_outbox(&mut self, message: NewOutboxMessage) -> StoreResult<OutboxMessage> {
        self.check_scope(message.business_id, "outbox message")?;
        let (conn, handle) = self.conn();
        let row = handle
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO pub_sub_message_records
                        (id, business_id, reference_type, reference_id, action, payload)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    RETURNING sequence, created_at
                    "#,
                )
                .bind(message.id.as_uuid())
                .bind(message.business_id.as_uuid())
                .bind(message.reference_type.as_str())
                .bind(message.reference_id.as_uuid())
                .bind(message.action.as_str())
                .bind(Json(&message.payload))
                .fetch_one(conn),
            )
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        let sequence: i64 = row.try_get("sequence").map_err(|e| map_sqlx_error("insert_outbox", e))?;
        let created_at: DateTime<Utc> =
            row.try_get("created_at").map_err(|e| map_sqlx_error("insert_outbox", e))?;
        Ok(OutboxMessage::from_new(message, sequence, created_at))
    }

    fn is_message_applied(&mut self, message_id: MessageId) -> StoreResult<bool> {
        let (conn, handle) = self.conn();
        let row = handle
            .block_on(
                sqlx::query("SELECT EXISTS (SELECT 1 FROM applied_pub_sub_messages WHERE message_id = $1) AS applied")
                    .bind(message_id.as_uuid())
                    .fetch_one(conn),
            )
            .map_err(|e| map_sqlx_error("is_message_applied", e))?;
        row.try_get("applied").map_err(|e| map_sqlx_error("is_message_applied", e))
    }

    fn record_message_applied(&mut self, message: &OutboxMessage) -> StoreResult<()> {
        self.check_scope(message.business_id(), "applied message")?;
        let (conn, handle) = self.conn();
        handle
            .block_on(async {
                sqlx::query(
                    "INSERT INTO applied_pub_sub_messages (message_id, business_id) VALUES ($1, $2) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(*message.id().as_uuid())
                .bind(message.business_id().as_uuid())
                .execute(&mut *conn)
                .await?;
                sqlx::query(
                    "UPDATE pub_sub_message_records SET status = 'processed', \
                     processed_at = NOW(), claimed_until = NULL WHERE id = $1",
                )
                .bind(*message.id().as_uuid())
                .execute(&mut *conn)
                .await
            })
            .map_err(|e| map_sqlx_error("record_message_applied", e))?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(journal_entry_id = %entry.id), err)]
    fn insert_journal_entry(&mut self, entry: &JournalEntry) -> StoreResult<()> {
        self.check_scope(entry.business_id, "journal entry")?;
        let (conn, handle) = self.conn();
        handle
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO stock_journal_entries
                        (id, business_id, reference_type, reference_id, action, effective_date,
                         lines, description, posted_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(entry.id.as_uuid())
                .bind(entry.business_id.as_uuid())
                .bind(entry.reference_type.as_str())
                .bind(entry.reference_id.as_uuid())
                .bind(entry.action.as_str())
                .bind(entry.effective_date)
                .bind(Json(&entry.lines))
                .bind(entry.description.as_deref())
                .bind(entry.posted_at)
                .execute(conn),
            )
            .map_err(|e| map_sqlx_error("insert_journal_entry", e))?;
        Ok(())
    }

    fn journal_entries_for_reference(
        &mut self,
        reference_type: ReferenceType,
        reference_id: ReferenceId,
    ) -> StoreResult<Vec<JournalEntry>> {
        let business = *self.business_id.as_uuid();
        let (conn, handle) = self.conn();
        let rows = handle
            .block_on(
                sqlx::query(
                    r#"
                    SELECT id, business_id, reference_type, reference_id, action, effective_date,
                           lines, description, posted_at
                    FROM stock_journal_entries
                    WHERE business_id = $1 AND reference_type = $2 AND reference_id = $3
                    ORDER BY posted_at
                    "#,
                )
                .bind(business)
                .bind(reference_type.as_str())
                .bind(reference_id.as_uuid())
                .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("journal_entries_for_reference", e))?;
        decode_rows::<JournalEntryRow>(&rows, "journal_entries_for_reference")
            .map(|rows| rows.into_iter().map(|r| r.0).collect())
    }

    fn insert_integration_event(&mut self, event: &IntegrationEvent) -> StoreResult<()> {
        ensure_business(self.business_id, &event.key)?;
        let sql = format!(
            "INSERT INTO stock_integration_events ({KEY_COLUMNS}, id, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        let (conn, handle) = self.conn();
        handle
            .block_on(
                bind_key(sqlx::query(&sql), &event.key)
                    .bind(event.id)
                    .bind(event.kind.as_str())
                    .bind(event.created_at)
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error("insert_integration_event", e))?;
        Ok(())
    }
}

fn bind_key<'q>(
    query: Query<'q, Postgres, PgArguments>,
    key: &'q StockKey,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(key.business_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(key.product.product_type.as_str())
        .bind(key.product.product_id.as_uuid())
        .bind(key.batch_number.as_str())
}

/// Map SQLx errors to StoreError.
///
/// See the module-level documentation for the complete mapping table.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let message = format!("{operation}: {} (code {code})", db_err.message());
            match code.as_str() {
                "23505" => StoreError::Conflict(message),
                "55P03" | "40001" | "40P01" => StoreError::Concurrency(message),
                _ => StoreError::Backend(message),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("{operation}: row not found")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{operation}: {err}"))
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn decode_rows<T>(rows: &[PgRow], operation: &str) -> StoreResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    rows.iter()
        .map(|row| T::from_row(row).map_err(|e| map_sqlx_error(operation, e)))
        .collect()
}

fn decode_history(rows: &[PgRow], operation: &str) -> StoreResult<Vec<StockHistory>> {
    decode_rows::<HistoryRow>(rows, operation).map(|rows| rows.into_iter().map(|r| r.0).collect())
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn key_from_row(row: &PgRow) -> Result<StockKey, sqlx::Error> {
    let business_id: uuid::Uuid = row.try_get("business_id")?;
    let warehouse_id: uuid::Uuid = row.try_get("warehouse_id")?;
    let product_id: uuid::Uuid = row.try_get("product_id")?;
    Ok(StockKey::new(
        BusinessId::from_uuid(business_id),
        WarehouseId::from_uuid(warehouse_id),
        ProductKey::new(parse_column(row, "product_type")?, product_id.into()),
        row.try_get::<String, _>("batch_number")?,
    ))
}

fn buckets_from_row(row: &PgRow) -> Result<StockBuckets, sqlx::Error> {
    Ok(StockBuckets {
        opening: row.try_get("opening_qty")?,
        received: row.try_get("received_qty")?,
        sale: row.try_get("sale_qty")?,
        committed: row.try_get("committed_qty")?,
        transfer_in: row.try_get("transfer_in_qty")?,
        transfer_out: row.try_get("transfer_out_qty")?,
        adjusted_in: row.try_get("adjusted_in_qty")?,
        adjusted_out: row.try_get("adjusted_out_qty")?,
        current_qty: row.try_get("current_qty")?,
    })
}

/// Row wrapper for decoding `stock_histories`.
struct HistoryRow(StockHistory);

impl<'r> FromRow<'r, PgRow> for HistoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: uuid::Uuid = row.try_get("id")?;
        let reference_id: uuid::Uuid = row.try_get("reference_id")?;
        let detail_id: uuid::Uuid = row.try_get("reference_detail_id")?;
        let reversed_by: Option<uuid::Uuid> = row.try_get("reversed_by_stock_history_id")?;
        Ok(Self(StockHistory {
            id: id.into(),
            key: key_from_row(row)?,
            stock_date: row.try_get("stock_date")?,
            quantity: row.try_get("qty")?,
            base_unit_value: row.try_get("base_unit_value")?,
            reference_type: parse_column(row, "reference_type")?,
            reference_id: reference_id.into(),
            reference_detail_id: detail_id.into(),
            cumulative_sequence: row.try_get("cumulative_sequence")?,
            flags: MovementFlags {
                is_outgoing: row.try_get("is_outgoing")?,
                is_transfer_in: row.try_get("is_transfer_in")?,
            },
            is_reversal: row.try_get("is_reversal")?,
            reversed_by_stock_history_id: reversed_by.map(StockHistoryId::from_uuid),
            created_at: row.try_get("created_at")?,
        }))
    }
}

/// Row wrapper for decoding `stock_summaries`.
struct SummaryRow(StockSummary);

impl<'r> FromRow<'r, PgRow> for SummaryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(StockSummary {
            key: key_from_row(row)?,
            buckets: buckets_from_row(row)?,
            last_sequence: row.try_get("last_sequence")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

struct DailyBalanceRow(DailyBalance);

impl<'r> FromRow<'r, PgRow> for DailyBalanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(DailyBalance {
            key: key_from_row(row)?,
            balance_date: row.try_get("balance_date")?,
            buckets: buckets_from_row(row)?,
        }))
    }
}

/// Row wrapper for decoding `pub_sub_message_records`.
struct OutboxRow(OutboxRecord);

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: uuid::Uuid = row.try_get("id")?;
        let business_id: uuid::Uuid = row.try_get("business_id")?;
        let reference_id: uuid::Uuid = row.try_get("reference_id")?;
        let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
        let attempts: i32 = row.try_get("attempts")?;

        let message = OutboxMessage::from_new(
            NewOutboxMessage {
                id: MessageId::from_uuid(id),
                business_id: BusinessId::from_uuid(business_id),
                reference_type: parse_column(row, "reference_type")?,
                reference_id: reference_id.into(),
                action: parse_column::<OutboxAction>(row, "action")?,
                payload,
            },
            row.try_get("sequence")?,
            row.try_get("created_at")?,
        );
        let delivery = DeliveryState {
            status: parse_column::<MessageStatus>(row, "status")?,
            attempts: u32::try_from(attempts).unwrap_or_default(),
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            claimed_until: row.try_get("claimed_until")?,
            processed_at: row.try_get("processed_at")?,
        };
        Ok(Self(OutboxRecord { message, delivery }))
    }
}

/// Row wrapper for decoding `stock_journal_entries`.
struct JournalEntryRow(JournalEntry);

impl<'r> FromRow<'r, PgRow> for JournalEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: uuid::Uuid = row.try_get("id")?;
        let business_id: uuid::Uuid = row.try_get("business_id")?;
        let reference_id: uuid::Uuid = row.try_get("reference_id")?;
        let Json(lines): Json<Vec<JournalLine>> = row.try_get("lines")?;
        Ok(Self(JournalEntry {
            id: JournalEntryId::from_uuid(id),
            business_id: BusinessId::from_uuid(business_id),
            reference_type: parse_column(row, "reference_type")?,
            reference_id: reference_id.into(),
            action: parse_column(row, "action")?,
            effective_date: row.try_get("effective_date")?,
            lines,
            description: row.try_get("description")?,
            posted_at: row.try_get("posted_at")?,
        }))
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{LedgerEntryId, OrderId, ProductId, ReservationId, Version};
use domain::{ReservationRecord, ReservationStatus, StockLedgerEntry};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{DEFAULT_LOCK_TIMEOUT, InventoryStore, LedgerTransaction},
};

const ENTRY_COLUMNS: &str =
    "id, product_id, total_quantity, reserved_quantity, version, created_at, updated_at";

const RESERVATION_COLUMNS: &str = "id, ledger_entry_id, product_id, order_id, requested_quantity, \
     status, failure_reason, created_at, confirmed_at, released_at, updated_at, event_published_at";

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// PostgreSQL-backed inventory store.
///
/// Entry locks are row locks (`SELECT ... FOR UPDATE`) bounded by the
/// session `lock_timeout`, so a blocked caller fails with
/// [`StoreError::LockTimeout`] instead of waiting forever.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    /// Creates a new PostgreSQL inventory store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long lock acquisition may wait.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("inventory schema migrations applied");
        Ok(())
    }

    async fn acquire(&self, key: LockKey<'_>) -> Result<PostgresLedgerTransaction> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        let (sql, target) = match key {
            LockKey::Product(product_id) => (
                format!(
                    "SELECT {ENTRY_COLUMNS} FROM stock_ledger WHERE product_id = $1 FOR UPDATE"
                ),
                format!("product {product_id}"),
            ),
            LockKey::Entry(entry_id) => (
                format!("SELECT {ENTRY_COLUMNS} FROM stock_ledger WHERE id = $1 FOR UPDATE"),
                format!("ledger entry {entry_id}"),
            ),
        };

        let query = sqlx::query(&sql);
        let query = match key {
            LockKey::Product(product_id) => query.bind(product_id.as_str()),
            LockKey::Entry(entry_id) => query.bind(entry_id.as_uuid()),
        };

        let row = query
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                if is_lock_timeout(&e) {
                    tracing::debug!(%target, "ledger entry lock wait timed out");
                    return StoreError::LockTimeout {
                        target,
                        waited: self.lock_timeout,
                    };
                }
                StoreError::Database(e)
            })?
            .ok_or_else(|| match key {
                LockKey::Product(product_id) => StoreError::ProductNotFound(product_id.clone()),
                LockKey::Entry(entry_id) => StoreError::EntryNotFound(entry_id),
            })?;

        let entry = row_to_entry(&row)?;
        Ok(PostgresLedgerTransaction {
            tx,
            original_version: entry.version(),
            entry,
            lock_timeout: self.lock_timeout,
        })
    }
}

#[derive(Clone, Copy)]
enum LockKey<'a> {
    Product(&'a ProductId),
    Entry(LedgerEntryId),
}

fn is_lock_timeout(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
    )
}

fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn row_to_entry(row: &PgRow) -> Result<StockLedgerEntry> {
    let entry = StockLedgerEntry::restore(
        LedgerEntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
        ProductId::new(row.try_get::<String, _>("product_id")?),
        to_u32(row.try_get("total_quantity")?, "total_quantity")?,
        to_u32(row.try_get("reserved_quantity")?, "reserved_quantity")?,
        Version::new(row.try_get("version")?),
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
    )?;
    Ok(entry)
}

fn row_to_record(row: &PgRow) -> Result<ReservationRecord> {
    let status: String = row.try_get("status")?;

    Ok(ReservationRecord {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
        ledger_entry_id: LedgerEntryId::from_uuid(row.try_get::<Uuid, _>("ledger_entry_id")?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
        requested_quantity: to_u32(row.try_get("requested_quantity")?, "requested_quantity")?,
        status: status.parse()?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        released_at: row.try_get("released_at")?,
        updated_at: row.try_get("updated_at")?,
        event_published_at: row.try_get("event_published_at")?,
    })
}

/// Unit of work holding a row lock on one `stock_ledger` row.
///
/// Dropping it without committing rolls the database transaction back.
pub struct PostgresLedgerTransaction {
    tx: Transaction<'static, Postgres>,
    original_version: Version,
    entry: StockLedgerEntry,
    lock_timeout: Duration,
}

#[async_trait]
impl LedgerTransaction for PostgresLedgerTransaction {
    fn entry(&self) -> &StockLedgerEntry {
        &self.entry
    }

    fn entry_mut(&mut self) -> &mut StockLedgerEntry {
        &mut self.entry
    }

    async fn find_by_order(&mut self, order_id: &OrderId) -> Result<Option<ReservationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE order_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// A PENDING insert waits on any uncommitted PENDING row for the same
    /// order; that wait is bounded by the session `lock_timeout`.
    async fn insert_reservation(&mut self, record: ReservationRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO reservations ({RESERVATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.ledger_entry_id.as_uuid())
        .bind(record.product_id.as_str())
        .bind(record.order_id.as_str())
        .bind(i64::from(record.requested_quantity))
        .bind(record.status.as_str())
        .bind(&record.failure_reason)
        .bind(record.created_at)
        .bind(record.confirmed_at)
        .bind(record.released_at)
        .bind(record.updated_at)
        .bind(record.event_published_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if violates(&e, "uq_reservations_pending_order") {
                return StoreError::DuplicateReservation(record.order_id.clone());
            }
            if is_lock_timeout(&e) {
                tracing::debug!(
                    order_id = %record.order_id,
                    "pending reservation insert timed out"
                );
                return StoreError::LockTimeout {
                    target: format!("order {}", record.order_id),
                    waited: self.lock_timeout,
                };
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn update_reservation(&mut self, record: ReservationRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = $2, failure_reason = $3, confirmed_at = $4, released_at = $5,
                updated_at = $6, event_published_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(&record.failure_reason)
        .bind(record.confirmed_at)
        .bind(record.released_at)
        .bind(record.updated_at)
        .bind(record.event_published_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ReservationNotFound(record.id));
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<StockLedgerEntry> {
        if self.entry.version() != self.original_version {
            let result = sqlx::query(
                r#"
                UPDATE stock_ledger
                SET total_quantity = $3, reserved_quantity = $4, version = $5, updated_at = $6
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(self.entry.id().as_uuid())
            .bind(self.original_version.as_i64())
            .bind(i64::from(self.entry.total_quantity()))
            .bind(i64::from(self.entry.reserved_quantity()))
            .bind(self.entry.version().as_i64())
            .bind(self.entry.updated_at())
            .execute(&mut *self.tx)
            .await?;

            if result.rows_affected() == 0 {
                let actual: i64 =
                    sqlx::query_scalar("SELECT version FROM stock_ledger WHERE id = $1")
                        .bind(self.entry.id().as_uuid())
                        .fetch_one(&mut *self.tx)
                        .await?;
                return Err(StoreError::VersionConflict {
                    entry_id: self.entry.id(),
                    expected: self.original_version,
                    actual: Version::new(actual),
                });
            }
        }

        self.tx.commit().await?;
        Ok(self.entry)
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    type Tx = PostgresLedgerTransaction;

    async fn create_entry(&self, entry: StockLedgerEntry) -> Result<StockLedgerEntry> {
        sqlx::query(&format!(
            "INSERT INTO stock_ledger ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(entry.id().as_uuid())
        .bind(entry.product_id().as_str())
        .bind(i64::from(entry.total_quantity()))
        .bind(i64::from(entry.reserved_quantity()))
        .bind(entry.version().as_i64())
        .bind(entry.created_at())
        .bind(entry.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if violates(&e, "uq_stock_ledger_product") {
                return StoreError::ProductAlreadyExists(entry.product_id().clone());
            }
            StoreError::Database(e)
        })?;

        Ok(entry)
    }

    async fn get_entry(&self, product_id: &ProductId) -> Result<Option<StockLedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM stock_ledger WHERE product_id = $1"
        ))
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn lock_product(&self, product_id: &ProductId) -> Result<Self::Tx> {
        self.acquire(LockKey::Product(product_id)).await
    }

    async fn lock_entry(&self, entry_id: LedgerEntryId) -> Result<Self::Tx> {
        self.acquire(LockKey::Entry(entry_id)).await
    }

    async fn find_by_order(&self, order_id: &OrderId) -> Result<Option<ReservationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE order_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn reservations_for_entry(
        &self,
        entry_id: LedgerEntryId,
    ) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE ledger_entry_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(entry_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn unpublished_reservations(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE event_published_at IS NULL AND status <> 'CONFIRMED' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn mark_published(
        &self,
        id: ReservationId,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE reservations SET event_published_at = $3 WHERE id = $1 AND status = $2",
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM reservations WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(StoreError::ReservationNotFound(id));
        }
        Ok(false)
    }
}

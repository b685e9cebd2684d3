//! Transfer record persistence
//!
//! All status transitions go through [`TransferStore::compare_and_set`], which
//! only applies when the stored `(status, attempt_count)` still matches what the
//! caller read. That is what keeps two workers (or two relayer processes) from
//! both acting on the same transfer.

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::error;

use crate::types::{Status, StatusCounts, TransferRecord};

pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::TransferRow;

use models::TRANSFER_COLUMNS;

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Create or fully overwrite the record for `record.nonce()`
    async fn upsert(&self, record: &TransferRecord) -> Result<()>;

    /// Insert unless a record with the same nonce exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool>;

    async fn get_by_nonce(&self, nonce: U256) -> Result<Option<TransferRecord>>;

    /// Records in `status`, oldest source position first
    async fn list_by_status(&self, status: Status, limit: i64) -> Result<Vec<TransferRecord>>;

    async fn list_pending(&self, limit: i64) -> Result<Vec<TransferRecord>> {
        self.list_by_status(Status::Pending, limit).await
    }

    /// Replace `current` with `next` if the stored record still has the status and
    /// attempt count of `current`. Returns false when another writer got there first.
    async fn compare_and_set(&self, current: &TransferRecord, next: &TransferRecord)
        -> Result<bool>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    async fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>>;

    /// Never moves an existing cursor backwards
    async fn save_cursor(&self, chain_id: u64, last_processed_block: u64) -> Result<()>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransferStore for PgStore {
    async fn upsert(&self, record: &TransferRecord) -> Result<()> {
        let row = TransferRow::from(record);
        sqlx::query(
            r#"
            INSERT INTO transfers (nonce, source_chain_id, block_number, log_index, source_tx_hash,
                from_address, to_address, amount, event_timestamp, signature, status,
                destination_tx_hash, attempt_count, last_attempt_at, last_error, account_nonce,
                gas_price, submitted_at, created_at, updated_at)
            VALUES ($1::NUMERIC, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, $11, $12, $13, $14,
                $15, $16, $17::NUMERIC, $18, $19, $20)
            ON CONFLICT (nonce) DO UPDATE SET
                source_chain_id = EXCLUDED.source_chain_id,
                block_number = EXCLUDED.block_number,
                log_index = EXCLUDED.log_index,
                source_tx_hash = EXCLUDED.source_tx_hash,
                from_address = EXCLUDED.from_address,
                to_address = EXCLUDED.to_address,
                amount = EXCLUDED.amount,
                event_timestamp = EXCLUDED.event_timestamp,
                signature = EXCLUDED.signature,
                status = EXCLUDED.status,
                destination_tx_hash = EXCLUDED.destination_tx_hash,
                attempt_count = EXCLUDED.attempt_count,
                last_attempt_at = EXCLUDED.last_attempt_at,
                last_error = EXCLUDED.last_error,
                account_nonce = EXCLUDED.account_nonce,
                gas_price = EXCLUDED.gas_price,
                submitted_at = EXCLUDED.submitted_at,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&row.nonce)
        .bind(row.source_chain_id)
        .bind(row.block_number)
        .bind(row.log_index)
        .bind(&row.source_tx_hash)
        .bind(&row.from_address)
        .bind(&row.to_address)
        .bind(&row.amount)
        .bind(row.event_timestamp)
        .bind(&row.signature)
        .bind(&row.status)
        .bind(&row.destination_tx_hash)
        .bind(row.attempt_count)
        .bind(row.last_attempt_at)
        .bind(&row.last_error)
        .bind(row.account_nonce)
        .bind(&row.gas_price)
        .bind(row.submitted_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to upsert transfer")?;

        Ok(())
    }

    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool> {
        let row = TransferRow::from(record);
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (nonce, source_chain_id, block_number, log_index, source_tx_hash,
                from_address, to_address, amount, event_timestamp, signature, status,
                destination_tx_hash, attempt_count, last_attempt_at, last_error, account_nonce,
                gas_price, submitted_at, created_at, updated_at)
            VALUES ($1::NUMERIC, $2, $3, $4, $5, $6, $7, $8::NUMERIC, $9, $10, $11, $12, $13, $14,
                $15, $16, $17::NUMERIC, $18, $19, $20)
            ON CONFLICT (nonce) DO NOTHING
            "#,
        )
        .bind(&row.nonce)
        .bind(row.source_chain_id)
        .bind(row.block_number)
        .bind(row.log_index)
        .bind(&row.source_tx_hash)
        .bind(&row.from_address)
        .bind(&row.to_address)
        .bind(&row.amount)
        .bind(row.event_timestamp)
        .bind(&row.signature)
        .bind(&row.status)
        .bind(&row.destination_tx_hash)
        .bind(row.attempt_count)
        .bind(row.last_attempt_at)
        .bind(&row.last_error)
        .bind(row.account_nonce)
        .bind(&row.gas_price)
        .bind(row.submitted_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to insert transfer")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_by_nonce(&self, nonce: U256) -> Result<Option<TransferRecord>> {
        let query = format!(
            "SELECT {} FROM transfers WHERE nonce = $1::NUMERIC",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query_as::<_, TransferRow>(&query)
            .bind(nonce.to_string())
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to get transfer by nonce")?;

        row.map(TransferRecord::try_from).transpose()
    }

    async fn list_by_status(&self, status: Status, limit: i64) -> Result<Vec<TransferRecord>> {
        let query = format!(
            "SELECT {} FROM transfers WHERE status = $1 \
             ORDER BY block_number, log_index LIMIT $2",
            TRANSFER_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransferRow>(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error listing {} transfers: {:?}", status, e);
                e
            })
            .wrap_err("Failed to list transfers by status")?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn compare_and_set(
        &self,
        current: &TransferRecord,
        next: &TransferRecord,
    ) -> Result<bool> {
        let row = TransferRow::from(next);
        let result = sqlx::query(
            r#"
            UPDATE transfers SET
                status = $4,
                destination_tx_hash = $5,
                attempt_count = $6,
                last_attempt_at = $7,
                last_error = $8,
                account_nonce = $9,
                gas_price = $10::NUMERIC,
                submitted_at = $11,
                updated_at = $12
            WHERE nonce = $1::NUMERIC AND status = $2 AND attempt_count = $3
            "#,
        )
        .bind(current.nonce().to_string())
        .bind(current.status.as_str())
        .bind(current.attempt_count as i32)
        .bind(&row.status)
        .bind(&row.destination_tx_hash)
        .bind(row.attempt_count)
        .bind(row.last_attempt_at)
        .bind(&row.last_error)
        .bind(row.account_nonce)
        .bind(&row.gas_price)
        .bind(row.submitted_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to update transfer")?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM transfers GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to count transfers")?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            counts.add(status.parse()?, count);
        }
        Ok(counts)
    }

    async fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT last_processed_block FROM scan_cursors WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to load scan cursor")?;

        Ok(row.map(|r| r.get::<i64, _>("last_processed_block") as u64))
    }

    async fn save_cursor(&self, chain_id: u64, last_processed_block: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_cursors (chain_id, last_processed_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id) DO UPDATE SET
                last_processed_block = GREATEST(scan_cursors.last_processed_block, EXCLUDED.last_processed_block),
                updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(last_processed_block as i64)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to save scan cursor")?;

        Ok(())
    }
}

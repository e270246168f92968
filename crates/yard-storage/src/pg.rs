use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;
use yard_core::{StoredVehicle, VehicleRecord};

use crate::store::VehicleStore;

/// PostgreSQL-backed store: one JSONB document per row, unique on
/// `(source_partition, stock_num)`.
#[derive(Debug, Clone)]
pub struct PgVehicleStore {
    pool: PgPool,
}

impl PgVehicleStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres vehicle store")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running vehicle store migrations")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn stored_from_row(row: PgRow) -> Result<StoredVehicle> {
    let row_id: Uuid = row.try_get("row_id")?;
    let first_seen_at: DateTime<Utc> = row.try_get("first_seen_at")?;
    let Json(record): Json<VehicleRecord> = row.try_get("document")?;
    Ok(StoredVehicle {
        row_id,
        first_seen_at,
        record,
    })
}

#[async_trait]
impl VehicleStore for PgVehicleStore {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        let rows = sqlx::query(
            "SELECT row_id, first_seen_at, document FROM vehicles \
             WHERE source_partition = $1 ORDER BY stock_num",
        )
        .bind(partition)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading partition {partition}"))?;
        rows.into_iter().map(stored_from_row).collect()
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        let stored = StoredVehicle::new(record.clone());
        sqlx::query(
            "INSERT INTO vehicles (row_id, source_partition, stock_num, first_seen_at, document) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(stored.row_id)
        .bind(&record.source_partition)
        .bind(&record.stock_num)
        .bind(stored.first_seen_at)
        .bind(Json(record.clone()))
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "inserting ({}, {})",
                record.source_partition, record.stock_num
            )
        })?;
        Ok(stored)
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        let record = &stored.record;
        let result = sqlx::query(
            "UPDATE vehicles SET document = $3 \
             WHERE source_partition = $1 AND stock_num = $2",
        )
        .bind(&record.source_partition)
        .bind(&record.stock_num)
        .bind(Json(record.clone()))
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "updating ({}, {})",
                record.source_partition, record.stock_num
            )
        })?;
        if result.rows_affected() == 0 {
            anyhow::bail!(
                "no document ({}, {}) to replace",
                record.source_partition,
                record.stock_num
            );
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM vehicles WHERE source_partition = $1 AND stock_num = $2")
                .bind(partition)
                .bind(stock_num)
                .execute(&self.pool)
                .await
                .with_context(|| format!("deleting ({partition}, {stock_num})"))?;
        Ok(result.rows_affected() > 0)
    }
}

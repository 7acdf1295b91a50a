//! Postgres-wire-protocol-backed `Warehouse` (§4.5, §6). Redshift
//! speaks the Postgres frontend/backend protocol, so `sqlx`'s
//! Postgres driver is the connectivity layer; statements themselves
//! (`CREATE TABLE`, `COPY ... FROM`, merges) are built by
//! `crate::sync` and handed here as plain strings, since they're
//! generated dynamically from a flattened schema rather than known at
//! compile time.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};

use redshift_core::config::Config;
use redshift_core::error::{Result, TargetError};
use redshift_core::traits::{ColumnInfo, Warehouse};

use crate::retry::retry_transient;

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.dbname);

        let max_connections = (config.max_parallelism as u32).max(1) + 1;
        let pool = retry_transient(&config.dbname, "warehouse_connect", || {
            let options = options.clone();
            async move {
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
                    .map_err(anyhow::Error::from)
            }
        })
        .await?;

        Ok(Self { pool })
    }

    /// Expose the pool so the sync layer can run a merge's
    /// DELETE/INSERT pair inside one transaction.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn execute(&self, sql: &str) -> Result<()> {
        // `raw_sql` runs over the simple query protocol, which
        // (unlike the prepared-statement path `query()` uses) allows
        // a single call to carry multiple `;`-separated statements,
        // needed for the BEGIN/DELETE/INSERT/COMMIT merge sequence.
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| TargetError::Fatal(e.into()))?;
        Ok(())
    }

    async fn copy(&self, sql: &str) -> Result<u64> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| TargetError::Fatal(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TargetError::Fatal(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| ColumnInfo {
                name: row.get::<String, _>("column_name"),
                data_type: row.get::<String, _>("data_type"),
            })
            .collect())
    }

    async fn tables(&self, schema: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TargetError::Fatal(e.into()))?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("table_name")).collect())
    }
}

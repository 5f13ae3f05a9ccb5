//! Relational sink for Postgres/TimescaleDB.
//!
//! Destination table layout:
//!
//! ```sql
//! CREATE TABLE metrics (
//!     time  TIMESTAMPTZ NOT NULL,
//!     label TEXT NOT NULL,
//!     value DOUBLE PRECISION NOT NULL);
//! ```
//!
//! Optionally converted to a hypertable with
//! `SELECT create_hypertable('metrics', 'time');`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::error::{AcqSrvError, Result};
use crate::point::Point;
use crate::sink::{report_drops, BoundedBuffer, Sink};

const DEFAULT_BUFFER_SIZE: usize = 100_000;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(10);

pub struct TimescaleSink {
    buffer: Arc<BoundedBuffer>,
}

impl TimescaleSink {
    pub fn new(
        url: &str,
        table: &str,
        buffer_size: usize,
        batch_size: usize,
        push_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        validate_table_name(table)?;

        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        let push_interval = if push_interval.is_zero() {
            DEFAULT_PUSH_INTERVAL
        } else {
            push_interval
        };

        let buffer = Arc::new(BoundedBuffer::new(buffer_size));
        let writer = TimescaleWriter {
            url: url.to_string(),
            insert_sql: format!("INSERT INTO {table} (time, label, value) VALUES ($1, $2, $3)"),
            pool: None,
            buffer: Arc::clone(&buffer),
            batch_size,
        };
        tokio::spawn(writer.run(push_interval, shutdown));

        Ok(Self { buffer })
    }
}

impl Sink for TimescaleSink {
    fn name(&self) -> &str {
        "timescaledb"
    }

    fn save(&self, points: &[Point]) -> usize {
        let accepted = self.buffer.push(points);
        report_drops(self.name(), accepted, points.len());
        accepted
    }
}

/// The table name is interpolated into the insert statement, so only plain
/// identifiers are allowed.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AcqSrvError::config(format!(
            "invalid table name '{table}'"
        )))
    }
}

struct TimescaleWriter {
    url: String,
    insert_sql: String,
    pool: Option<PgPool>,
    buffer: Arc<BoundedBuffer>,
    batch_size: usize,
}

impl TimescaleWriter {
    async fn run(mut self, push_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let batch = self.buffer.front_batch(self.batch_size);
            if batch.is_empty() {
                continue;
            }

            let Some(pool) = self.healthy_pool().await else {
                continue;
            };

            match write_batch(&pool, &self.insert_sql, &batch).await {
                // only a committed transaction releases the batch
                Ok(()) => self.buffer.release(batch.len()),
                Err(e) => warn!("timescaledb sink: failed to push batch: {e}"),
            }
        }
    }

    /// Connect lazily and ping before use; a failed ping drops the pool so
    /// the next tick reconnects.
    async fn healthy_pool(&mut self) -> Option<PgPool> {
        if self.pool.is_none() {
            match PgPoolOptions::new()
                .max_connections(2)
                .connect(&self.url)
                .await
            {
                Ok(pool) => self.pool = Some(pool),
                Err(e) => {
                    warn!("timescaledb sink: failed to connect: {e}");
                    return None;
                }
            }
        }

        let pool = self.pool.clone()?;
        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
            warn!("timescaledb sink: failed to ping database: {e}");
            self.pool = None;
            return None;
        }
        Some(pool)
    }
}

/// Insert the batch inside a single transaction, committed as a unit.
async fn write_batch(pool: &PgPool, insert_sql: &str, batch: &[Point]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for point in batch {
        sqlx::query(insert_sql)
            .bind(point.timestamp)
            .bind(&point.label)
            .bind(point.value.as_f64())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

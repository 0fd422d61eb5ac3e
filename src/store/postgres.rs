use super::MeasurementStore;
use crate::error::StoreError;
use crate::measurement::{NewPrediction, ProcessingContext, RawFragmentRow};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

pub async fn build_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    late_data_tolerance: ChronoDuration,
    dedup_tolerance_secs: f64,
}

impl PgStore {
    pub fn new(pool: PgPool, late_data_tolerance: Duration, dedup_tolerance: Duration) -> Self {
        let late_data_tolerance = ChronoDuration::from_std(late_data_tolerance)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        Self {
            pool,
            late_data_tolerance,
            dedup_tolerance_secs: dedup_tolerance.as_secs_f64(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id bigserial primary key,
                prediction_time timestamptz not null default now(),
                sensor_id bigint not null,
                device_id bigint not null,
                measurement_time timestamptz null,
                param_a double precision not null,
                param_b double precision not null,
                result double precision not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        // tables created before predictions recorded their measurement
        sqlx::query(
            "ALTER TABLE predictions ADD COLUMN IF NOT EXISTS measurement_time timestamptz null",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                id bigserial primary key,
                sensor_id bigint not null,
                device_id bigint not null,
                measurement_time timestamptz not null,
                series_count int null,
                data text not null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("ALTER TABLE measurements ADD COLUMN IF NOT EXISTS series_count int null")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS measurements_sensor_device_time_idx
                ON measurements (sensor_id, device_id, measurement_time)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn max_prediction_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let max: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(prediction_time) FROM predictions")
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }
}

fn fragment_row(row: &PgRow) -> Result<RawFragmentRow, StoreError> {
    let series_count_hint = row
        .try_get::<Option<i32>, _>("series_count")?
        .map(|count| {
            u32::try_from(count)
                .map_err(|_| StoreError::Invalid(format!("negative series_count {count}")))
        })
        .transpose()?;
    Ok(RawFragmentRow {
        sensor_id: row.try_get("sensor_id")?,
        device_id: row.try_get("device_id")?,
        measurement_time: row.try_get("measurement_time")?,
        series_count_hint,
        payload: row.try_get("data")?,
    })
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn last_prediction(&self) -> Result<Option<ProcessingContext>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT prediction_time, sensor_id, device_id, param_a, param_b, result
            FROM predictions
            ORDER BY prediction_time DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ProcessingContext {
            prediction_time: row.try_get("prediction_time")?,
            sensor_id: row.try_get("sensor_id")?,
            device_id: row.try_get("device_id")?,
            param_a: row.try_get("param_a")?,
            param_b: row.try_get("param_b")?,
            result: row.try_get("result")?,
        }))
    }

    async fn unprocessed_measurements(&self) -> Result<Vec<RawFragmentRow>, StoreError> {
        let Some(max_time) = self.max_prediction_time().await? else {
            tracing::info!("no prediction_time found; nothing to window against");
            return Ok(Vec::new());
        };
        let min_time = max_time - self.late_data_tolerance;

        let rows = sqlx::query(
            r#"
            SELECT m.sensor_id, m.device_id, m.measurement_time, m.series_count, m.data
            FROM measurements m
            WHERE m.measurement_time BETWEEN $1 AND $2
              AND NOT EXISTS (
                  SELECT 1
                  FROM predictions p
                  WHERE p.sensor_id = m.sensor_id
                    AND p.device_id = m.device_id
                    AND ABS(EXTRACT(EPOCH FROM (
                        COALESCE(p.measurement_time, p.prediction_time) - m.measurement_time
                    ))) < $3
              )
            ORDER BY m.measurement_time, m.id
            "#,
        )
        .bind(min_time)
        .bind(max_time)
        .bind(self.dedup_tolerance_secs)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            rows = rows.len(),
            window_start = %min_time,
            window_end = %max_time,
            "fetched unprocessed fragment rows"
        );
        rows.iter().map(fragment_row).collect()
    }

    async fn last_measurement_before(
        &self,
        sensor_id: i64,
        device_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawFragmentRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, device_id, measurement_time, series_count, data
            FROM measurements
            WHERE sensor_id = $1
              AND device_id = $2
              AND measurement_time = (
                  SELECT MAX(measurement_time)
                  FROM measurements
                  WHERE sensor_id = $1
                    AND device_id = $2
                    AND measurement_time < $3
              )
            ORDER BY id
            "#,
        )
        .bind(sensor_id)
        .bind(device_id)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(fragment_row).collect()
    }

    async fn insert_prediction(&self, prediction: &NewPrediction) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO predictions
                (prediction_time, sensor_id, device_id, measurement_time, param_a, param_b, result)
            VALUES (now(), $1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(prediction.sensor_id)
        .bind(prediction.device_id)
        .bind(prediction.measurement_time)
        .bind(prediction.param_a)
        .bind(prediction.param_b)
        .bind(prediction.result)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                tracing::debug!(
                    sensor_id = prediction.sensor_id,
                    device_id = prediction.device_id,
                    "inserted prediction"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed insert failed");
                }
                Err(err.into())
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database pool closed");
    }
}

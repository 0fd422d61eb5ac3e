mod postgres;
mod retrying;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::{build_pool, PgStore};
pub use retrying::RetryingStore;

use crate::error::StoreError;
use crate::measurement::{NewPrediction, ProcessingContext, RawFragmentRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Point and range queries the reconciliation cycle needs from storage.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Most recent committed prediction, if any.
    async fn last_prediction(&self) -> Result<Option<ProcessingContext>, StoreError>;

    /// Fragment rows inside `[max_prediction_time - tolerance, max_prediction_time]`
    /// with no prediction for the same sensor and device within the dedup
    /// tolerance, ordered by `measurement_time`. Empty when no prediction exists.
    async fn unprocessed_measurements(&self) -> Result<Vec<RawFragmentRow>, StoreError>;

    /// Fragment rows of the latest measurement taken by `sensor_id` on
    /// `device_id` strictly before `before`.
    async fn last_measurement_before(
        &self,
        sensor_id: i64,
        device_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawFragmentRow>, StoreError>;

    /// Appends a prediction stamped with the store's current time.
    async fn insert_prediction(&self, prediction: &NewPrediction) -> Result<(), StoreError>;

    /// Releases connections; further calls fail.
    async fn close(&self);
}

use super::MeasurementStore;
use crate::error::StoreError;
use crate::measurement::{NewPrediction, ProcessingContext, RawFragmentRow};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub(crate) struct StoredPrediction {
    pub(crate) prediction_time: DateTime<Utc>,
    pub(crate) record: NewPrediction,
}

#[derive(Debug)]
struct MemoryState {
    predictions: Vec<StoredPrediction>,
    measurements: Vec<RawFragmentRow>,
    clock: DateTime<Utc>,
    failing_devices: Vec<i64>,
    transient_failures: u32,
    fail_after: Option<u32>,
    calls: HashMap<&'static str, u32>,
    closed: bool,
}

/// Window, dedup and "latest before" semantics of the Postgres store, held in
/// memory. Inserts are stamped with a settable clock.
#[derive(Debug)]
pub(crate) struct MemoryStore {
    state: Mutex<MemoryState>,
    late_data_tolerance: ChronoDuration,
    dedup_tolerance: ChronoDuration,
}

impl MemoryStore {
    pub(crate) fn new(clock: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                predictions: Vec::new(),
                measurements: Vec::new(),
                clock,
                failing_devices: Vec::new(),
                transient_failures: 0,
                fail_after: None,
                calls: HashMap::new(),
                closed: false,
            }),
            late_data_tolerance: ChronoDuration::hours(24),
            dedup_tolerance: ChronoDuration::seconds(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn seed_prediction(
        &self,
        prediction_time: DateTime<Utc>,
        sensor_id: i64,
        device_id: i64,
        param_a: f64,
        param_b: f64,
    ) {
        self.lock().predictions.push(StoredPrediction {
            prediction_time,
            record: NewPrediction {
                sensor_id,
                device_id,
                measurement_time: prediction_time,
                param_a,
                param_b,
                result: 0.5,
            },
        });
    }

    pub(crate) fn add_rows(&self, rows: Vec<RawFragmentRow>) {
        self.lock().measurements.extend(rows);
    }

    /// Inserts for these devices fail with a non-retryable error.
    pub(crate) fn fail_inserts_for(&self, device_id: i64) {
        self.lock().failing_devices.push(device_id);
    }

    /// The next `n` calls of any kind fail with a transient error.
    pub(crate) fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Lets `n` calls through, then fails the next one with a transient error.
    pub(crate) fn fail_after(&self, n: u32) {
        self.lock().fail_after = Some(n);
    }

    pub(crate) fn reopen(&self) {
        self.lock().closed = false;
    }

    pub(crate) fn predictions(&self) -> Vec<StoredPrediction> {
        self.lock().predictions.clone()
    }

    pub(crate) fn calls(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn enter(&self, operation: &'static str) -> Result<(), StoreError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.closed {
            return Err(StoreError::Unavailable("store closed".into()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                Err(StoreError::Unavailable("connection reset".into()))
            }
            Some(remaining) => {
                state.fail_after = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn last_prediction(&self) -> Result<Option<ProcessingContext>, StoreError> {
        self.enter("last_prediction")?;
        let state = self.lock();
        // max_by_key keeps the last maximum, so later inserts win ties
        let latest = state.predictions.iter().max_by_key(|p| p.prediction_time);
        Ok(latest.map(|p| ProcessingContext {
            sensor_id: p.record.sensor_id,
            device_id: p.record.device_id,
            prediction_time: p.prediction_time,
            param_a: p.record.param_a,
            param_b: p.record.param_b,
            result: p.record.result,
        }))
    }

    async fn unprocessed_measurements(&self) -> Result<Vec<RawFragmentRow>, StoreError> {
        self.enter("unprocessed_measurements")?;
        let state = self.lock();
        let Some(max_time) = state.predictions.iter().map(|p| p.prediction_time).max() else {
            return Ok(Vec::new());
        };
        let min_time = max_time - self.late_data_tolerance;

        let mut rows: Vec<RawFragmentRow> = state
            .measurements
            .iter()
            .filter(|row| row.measurement_time >= min_time && row.measurement_time <= max_time)
            .filter(|row| {
                !state.predictions.iter().any(|p| {
                    p.record.sensor_id == row.sensor_id
                        && p.record.device_id == row.device_id
                        && (p.record.measurement_time - row.measurement_time)
                            .num_milliseconds()
                            .abs()
                            < self.dedup_tolerance.num_milliseconds()
                })
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.measurement_time);
        Ok(rows)
    }

    async fn last_measurement_before(
        &self,
        sensor_id: i64,
        device_id: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<RawFragmentRow>, StoreError> {
        self.enter("last_measurement_before")?;
        let state = self.lock();
        let candidates = state.measurements.iter().filter(|row| {
            row.sensor_id == sensor_id && row.device_id == device_id && row.measurement_time < before
        });
        let Some(latest) = candidates.clone().map(|row| row.measurement_time).max() else {
            return Ok(Vec::new());
        };
        Ok(candidates
            .filter(|row| row.measurement_time == latest)
            .cloned()
            .collect())
    }

    async fn insert_prediction(&self, prediction: &NewPrediction) -> Result<(), StoreError> {
        self.enter("insert_prediction")?;
        let mut state = self.lock();
        if state.failing_devices.contains(&prediction.device_id) {
            return Err(StoreError::Invalid(format!(
                "insert rejected for device {}",
                prediction.device_id
            )));
        }
        let prediction_time = state.clock;
        state.predictions.push(StoredPrediction {
            prediction_time,
            record: prediction.clone(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

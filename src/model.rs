//! Preprocessing and the prediction contract.
//!
//! The pipeline only needs `predict` to be a pure function from a
//! preprocessed, calibrated measurement to one finite scalar.

use crate::error::{PredictionError, ProcessError};
use crate::measurement::{CalibrationParameters, Fragment, Measurement};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Mutex;

/// Model input for one measurement. Borrows the series from the measurement.
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessedMeasurement<'a> {
    pub sensor_id: i64,
    pub device_id: i64,
    pub measurement_time: DateTime<Utc>,
    pub calibration: CalibrationParameters,
    pub series_count: usize,
    pub total_length: usize,
    pub series: &'a [Fragment],
}

pub fn preprocess(measurement: &Measurement) -> Result<PreprocessedMeasurement<'_>, ProcessError> {
    let calibration = measurement
        .calibration()
        .ok_or(ProcessError::MissingCalibration)?;
    Ok(PreprocessedMeasurement {
        sensor_id: measurement.sensor_id,
        device_id: measurement.device_id,
        measurement_time: measurement.measurement_time,
        calibration,
        series_count: measurement.series.len(),
        total_length: measurement.total_length(),
        series: &measurement.series,
    })
}

pub trait Predictor: Send + Sync {
    fn predict(&self, input: &PreprocessedMeasurement<'_>) -> Result<f64, PredictionError>;
}

/// Placeholder model: a uniform draw from `[0.1, 0.9)` rounded to four places.
pub struct StubPredictor {
    rng: Mutex<StdRng>,
}

impl StubPredictor {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for StubPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl Predictor for StubPredictor {
    fn predict(&self, _input: &PreprocessedMeasurement<'_>) -> Result<f64, PredictionError> {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let value: f64 = rng.gen_range(0.1..0.9);
        Ok((value * 10_000.0).round() / 10_000.0)
    }
}

/// Rejects NaN and infinite model output before it reaches the store.
pub fn checked_prediction(value: f64) -> Result<f64, PredictionError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PredictionError::NonFinite)
    }
}

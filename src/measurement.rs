use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_SERIES: usize = 3;
pub const MAX_SERIES: usize = 10;
pub const MIN_SERIES_LEN: usize = 3000;
pub const MAX_SERIES_LEN: usize = 8000;

/// One delivered fragment row, as read from the `measurements` table.
///
/// The payload stays serialized until the assembler decodes it; a row is
/// validated once there and never re-inspected downstream.
#[derive(Debug, Clone)]
pub struct RawFragmentRow {
    pub sensor_id: i64,
    pub device_id: i64,
    pub measurement_time: DateTime<Utc>,
    pub series_count_hint: Option<u32>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(alias = "ts")]
    pub timestamps: Vec<f64>,
    #[serde(default, alias = "feat1")]
    pub feature_a: Vec<f64>,
    #[serde(default, alias = "feat2")]
    pub feature_b: Vec<f64>,
}

impl Fragment {
    pub fn decode(payload: &str) -> Result<Self, simd_json::Error> {
        let mut bytes = payload.as_bytes().to_vec();
        simd_json::serde::from_slice(&mut bytes)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    fn is_consistent(&self) -> bool {
        self.feature_a.len() == self.timestamps.len()
            && self.feature_b.len() == self.timestamps.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationParameters {
    pub param_a: f64,
    pub param_b: f64,
}

impl CalibrationParameters {
    pub fn new(param_a: f64, param_b: f64) -> Self {
        Self { param_a, param_b }
    }
}

/// Last committed prediction; anchors the current sensor and the fetch window.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub sensor_id: i64,
    pub device_id: i64,
    pub prediction_time: DateTime<Utc>,
    pub param_a: f64,
    pub param_b: f64,
    pub result: f64,
}

impl ProcessingContext {
    pub fn calibration(&self) -> CalibrationParameters {
        CalibrationParameters::new(self.param_a, self.param_b)
    }
}

/// Prediction record minus `prediction_time`, which the store assigns on insert.
/// `measurement_time` names the source measurement so later windows skip it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrediction {
    pub sensor_id: i64,
    pub device_id: i64,
    pub measurement_time: DateTime<Utc>,
    pub param_a: f64,
    pub param_b: f64,
    pub result: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeViolation {
    #[error("incomplete: {present} of {expected} series present")]
    Incomplete { present: usize, expected: usize },
    #[error("series count {0} outside 3..=10")]
    SeriesCount(usize),
    #[error("series {index} has length {len}, outside 3000..=8000")]
    SeriesLength { index: usize, len: usize },
    #[error("series {index} has mismatched feature lengths")]
    InconsistentSeries { index: usize },
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub sensor_id: i64,
    pub device_id: i64,
    pub measurement_time: DateTime<Utc>,
    pub expected_series_count: usize,
    pub series: Vec<Fragment>,
    calibration: Option<CalibrationParameters>,
}

impl Measurement {
    pub fn new(
        sensor_id: i64,
        device_id: i64,
        measurement_time: DateTime<Utc>,
        expected_series_count: usize,
    ) -> Self {
        Self {
            sensor_id,
            device_id,
            measurement_time,
            expected_series_count,
            series: Vec::with_capacity(expected_series_count),
            calibration: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.series.len() == self.expected_series_count
    }

    pub fn validate(&self) -> Result<(), ShapeViolation> {
        if !self.is_complete() {
            return Err(ShapeViolation::Incomplete {
                present: self.series.len(),
                expected: self.expected_series_count,
            });
        }
        if !(MIN_SERIES..=MAX_SERIES).contains(&self.series.len()) {
            return Err(ShapeViolation::SeriesCount(self.series.len()));
        }
        for (index, fragment) in self.series.iter().enumerate() {
            let len = fragment.len();
            if !(MIN_SERIES_LEN..=MAX_SERIES_LEN).contains(&len) {
                return Err(ShapeViolation::SeriesLength { index, len });
            }
            if !fragment.is_consistent() {
                return Err(ShapeViolation::InconsistentSeries { index });
            }
        }
        Ok(())
    }

    pub fn total_length(&self) -> usize {
        self.series.iter().map(Fragment::len).sum()
    }

    pub fn calibration(&self) -> Option<CalibrationParameters> {
        self.calibration
    }

    /// Calibration is write-once; a second assignment is refused.
    pub fn assign_calibration(
        &mut self,
        params: CalibrationParameters,
    ) -> Result<(), CalibrationParameters> {
        match self.calibration {
            Some(existing) => Err(existing),
            None => {
                self.calibration = Some(params);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    pub(crate) fn fragment(len: usize) -> Fragment {
        Fragment {
            timestamps: (0..len).map(|i| i as f64).collect(),
            feature_a: vec![0.1; len],
            feature_b: vec![0.2; len],
        }
    }

    pub(crate) fn payload(len: usize) -> String {
        serde_json::json!({
            "ts": (0..len).collect::<Vec<_>>(),
            "feat1": vec![0.1; len],
            "feat2": vec![0.2; len],
        })
        .to_string()
    }

    pub(crate) fn measurement(
        sensor_id: i64,
        device_id: i64,
        minute: u32,
        lens: &[usize],
    ) -> Measurement {
        let mut m = Measurement::new(sensor_id, device_id, at(minute), lens.len());
        m.series = lens.iter().map(|len| fragment(*len)).collect();
        m
    }

    pub(crate) fn rows(
        sensor_id: i64,
        device_id: i64,
        minute: u32,
        lens: &[usize],
    ) -> Vec<RawFragmentRow> {
        lens.iter()
            .map(|len| RawFragmentRow {
                sensor_id,
                device_id,
                measurement_time: at(minute),
                series_count_hint: None,
                payload: payload(*len),
            })
            .collect()
    }
}

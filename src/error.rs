use crate::measurement::CalibrationParameters;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Failure families the retry wrapper may be configured to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    Connection,
    Timeout,
    Contention,
}

impl RetryClass {
    pub const ALL: [RetryClass; 3] = [
        RetryClass::Connection,
        RetryClass::Timeout,
        RetryClass::Contention,
    ];
}

impl fmt::Display for RetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryClass::Connection => "connection",
            RetryClass::Timeout => "timeout",
            RetryClass::Contention => "contention",
        };
        f.write_str(name)
    }
}

impl FromStr for RetryClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connection" => Ok(RetryClass::Connection),
            "timeout" => Ok(RetryClass::Timeout),
            "contention" => Ok(RetryClass::Contention),
            other => Err(format!("unknown retry class '{other}'")),
        }
    }
}

/// Anything the retry wrapper can classify.
pub trait Retryable {
    fn retry_class(&self) -> Option<RetryClass>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored data: {0}")]
    Invalid(String),
}

impl Retryable for StoreError {
    fn retry_class(&self) -> Option<RetryClass> {
        match self {
            StoreError::Database(err) => classify_sqlx(err),
            StoreError::Timeout { .. } => Some(RetryClass::Timeout),
            StoreError::Unavailable(_) => Some(RetryClass::Connection),
            StoreError::Invalid(_) => None,
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> Option<RetryClass> {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
            Some(RetryClass::Connection)
        }
        sqlx::Error::PoolTimedOut => Some(RetryClass::Timeout),
        sqlx::Error::Database(db) => {
            let code = db.code()?;
            match code.as_ref() {
                "40001" | "40P01" => Some(RetryClass::Contention), // serialization_failure, deadlock
                "57014" => Some(RetryClass::Timeout),             // query_canceled
                c if c.starts_with("08") || c.starts_with("57P") => Some(RetryClass::Connection),
                _ => None,
            }
        }
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("insufficient calibration data: {found} device(s) on new sensor {sensor_id}, need {required}")]
    InsufficientDevices {
        sensor_id: i64,
        found: usize,
        required: usize,
    },
    #[error("insufficient calibration data: {found} common device(s) with sensor {sensor_id}, need {required}")]
    InsufficientPairs {
        sensor_id: i64,
        found: usize,
        required: usize,
    },
    #[error("baseline measurement for device {device_id} has zero length")]
    ZeroLengthBaseline { device_id: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction model failed: {0}")]
    Model(String),
    #[error("prediction produced a non-finite result")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("calibration already assigned ({0:?})")]
    AlreadyCalibrated(CalibrationParameters),
    #[error("measurement has no calibration parameters")]
    MissingCalibration,
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

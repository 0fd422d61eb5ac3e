use crate::error::RetryClass;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_RETRY_BACKOFF: f64 = 2.0;
/// Largest accepted multiplier between retry sleeps.
pub const MAX_RETRY_BACKOFF: f64 = 10.0;

fn setup_config_path() -> Option<PathBuf> {
    env::var("RECAL_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    late_data_tolerance_seconds: Option<u64>,
    #[serde(default)]
    min_calibration_devices: Option<usize>,
    #[serde(default)]
    retry_attempts: Option<u32>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    retry_backoff: Option<f64>,
    #[serde(default)]
    run_interval_seconds: Option<u64>,
}

/// Setup-file problem found while loading config. Tracing is not up yet
/// at that point, so these are handed back and logged by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupWarning {
    pub path: PathBuf,
    pub reason: String,
}

fn load_setup_config_overrides(warnings: &mut Vec<SetupWarning>) -> Option<SetupConfigOverrides> {
    load_setup_config_from(&setup_config_path()?, warnings)
}

fn load_setup_config_from(
    path: &Path,
    warnings: &mut Vec<SetupWarning>,
) -> Option<SetupConfigOverrides> {
    let mut warn = |reason: String| {
        warnings.push(SetupWarning {
            path: path.to_path_buf(),
            reason,
        })
    };
    if !path.exists() {
        warn("setup config not found".to_string());
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn(format!("failed to read setup config: {err}"));
            return None;
        }
    };
    let overrides = parse_setup_overrides(contents);
    if overrides.is_none() {
        warn("failed to parse setup config".to_string());
    }
    overrides
}

fn parse_setup_overrides(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn valid_backoff(value: f64) -> bool {
    value.is_finite() && (1.0..=MAX_RETRY_BACKOFF).contains(&value)
}

fn parse_backoff(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| valid_backoff(*v))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// File values only fill in settings whose env var is absent.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if !env_is_set("RECAL_DB_POOL_SIZE") {
        if let Some(value) = overrides.db_pool_size.filter(|v| *v != 0) {
            config.db_pool_size = value;
        }
    }
    if !env_is_set("RECAL_LATE_DATA_TOLERANCE_SECS") {
        if let Some(value) = overrides.late_data_tolerance_seconds.filter(|v| *v != 0) {
            config.late_data_tolerance_secs = value;
        }
    }
    if !env_is_set("RECAL_MIN_CALIBRATION_DEVICES") {
        if let Some(value) = overrides.min_calibration_devices.filter(|v| *v != 0) {
            config.min_calibration_devices = value;
        }
    }
    if !env_is_set("RECAL_RETRY_ATTEMPTS") {
        if let Some(value) = overrides.retry_attempts.filter(|v| *v != 0) {
            config.retry_attempts = value;
        }
    }
    if !env_is_set("RECAL_RETRY_DELAY_MS") {
        if let Some(value) = overrides.retry_delay_ms {
            config.retry_delay_ms = value;
        }
    }
    if !env_is_set("RECAL_RETRY_BACKOFF") {
        if let Some(value) = overrides.retry_backoff.filter(|v| valid_backoff(*v)) {
            config.retry_backoff = value;
        }
    }
    if !env_is_set("RECAL_RUN_INTERVAL_SECS") {
        if let Some(value) = overrides.run_interval_seconds.filter(|v| *v != 0) {
            config.run_interval_secs = Some(value);
        }
    }
}

fn parse_retry_classes(raw: &str) -> Result<Vec<RetryClass>> {
    let mut classes = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let class = part
            .parse::<RetryClass>()
            .map_err(anyhow::Error::msg)
            .context("RECAL_RETRY_ON")?;
        if !classes.contains(&class) {
            classes.push(class);
        }
    }
    Ok(classes)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub db_acquire_timeout_ms: u64,
    pub store_call_timeout_ms: u64,
    pub late_data_tolerance_secs: u64,
    pub dedup_tolerance_ms: u64,
    pub min_calibration_devices: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub retry_on: Vec<RetryClass>,
    pub run_interval_secs: Option<u64>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Reads `.env`, the environment and the optional setup file. Problems
    /// with the setup file do not fail startup; they come back alongside
    /// the config.
    pub fn from_env() -> Result<(Self, Vec<SetupWarning>)> {
        dotenv().ok();

        let mut warnings = Vec::new();
        let setup_overrides = load_setup_config_overrides(&mut warnings);

        let database_url = env::var("RECAL_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("RECAL_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let retry_on = match env::var("RECAL_RETRY_ON") {
            Ok(raw) => parse_retry_classes(&raw)?,
            Err(_) => RetryClass::ALL.to_vec(),
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("RECAL_DB_POOL_SIZE").unwrap_or(5),
            db_acquire_timeout_ms: env_parse("RECAL_DB_ACQUIRE_TIMEOUT_MS").unwrap_or(5_000),
            store_call_timeout_ms: env_parse("RECAL_STORE_CALL_TIMEOUT_MS").unwrap_or(30_000),
            late_data_tolerance_secs: env_parse("RECAL_LATE_DATA_TOLERANCE_SECS")
                .unwrap_or(86_400),
            dedup_tolerance_ms: env_parse("RECAL_DEDUP_TOLERANCE_MS").unwrap_or(1_000),
            min_calibration_devices: env_parse("RECAL_MIN_CALIBRATION_DEVICES").unwrap_or(2),
            retry_attempts: env_parse("RECAL_RETRY_ATTEMPTS").unwrap_or(3),
            retry_delay_ms: env_parse("RECAL_RETRY_DELAY_MS").unwrap_or(1_000),
            retry_backoff: env::var("RECAL_RETRY_BACKOFF")
                .ok()
                .and_then(|raw| parse_backoff(&raw))
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
            retry_on,
            run_interval_secs: env_parse::<u64>("RECAL_RUN_INTERVAL_SECS").filter(|v| *v != 0),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        Ok((config, warnings))
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_millis(self.store_call_timeout_ms)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.db_acquire_timeout_ms)
    }

    pub fn late_data_tolerance(&self) -> Duration {
        Duration::from_secs(self.late_data_tolerance_secs)
    }

    pub fn dedup_tolerance(&self) -> Duration {
        Duration::from_millis(self.dedup_tolerance_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn run_interval(&self) -> Option<Duration> {
        self.run_interval_secs.map(Duration::from_secs)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some((scheme, rest)) = url.split_once("://") {
        if scheme.starts_with("postgresql+") || scheme.starts_with("postgres+") {
            return format!("postgresql://{rest}");
        }
    }
    url
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgresql://localhost/recal".to_string(),
        db_pool_size: 5,
        db_acquire_timeout_ms: 5_000,
        store_call_timeout_ms: 30_000,
        late_data_tolerance_secs: 86_400,
        dedup_tolerance_ms: 1_000,
        min_calibration_devices: 2,
        retry_attempts: 3,
        retry_delay_ms: 10,
        retry_backoff: DEFAULT_RETRY_BACKOFF,
        retry_on: RetryClass::ALL.to_vec(),
        run_interval_secs: None,
        otlp_endpoint: None,
    }
}

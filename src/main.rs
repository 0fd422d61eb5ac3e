mod assembler;
mod calibration;
mod config;
mod error;
mod measurement;
mod model;
mod partition;
mod pipeline;
mod processor;
mod retry;
mod store;

use crate::config::Config;
use crate::error::StoreError;
use crate::model::StubPredictor;
use crate::pipeline::{CycleOutcome, Pipeline};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{build_pool, MeasurementStore, PgStore, RetryingStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_recalibrator=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-recalibrator"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

/// Connects, runs one cycle over a fresh pool and closes it again.
async fn run_cycle(
    config: &Config,
    policy: &RetryPolicy,
    predictor: Arc<StubPredictor>,
) -> Result<CycleOutcome, StoreError> {
    let pool = build_pool(
        &config.database_url,
        config.db_pool_size,
        config.db_acquire_timeout(),
    )
    .await?;
    let store = PgStore::new(pool, config.late_data_tolerance(), config.dedup_tolerance());
    if let Err(err) = store.ensure_schema().await {
        store.close().await;
        return Err(err);
    }

    let store = Arc::new(RetryingStore::new(
        store,
        policy.clone(),
        config.store_call_timeout(),
    ));
    Pipeline::new(store, predictor, config.min_calibration_devices)
        .run()
        .await
}

async fn run_once(
    config: &Config,
    policy: &RetryPolicy,
    predictor: &Arc<StubPredictor>,
) -> Result<CycleOutcome> {
    let outcome = with_retry(policy, "reconciliation_cycle", || {
        run_cycle(config, policy, predictor.clone())
    })
    .await
    .context("reconciliation cycle failed")?;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, setup_warnings) = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &setup_warnings {
        tracing::warn!(
            path = %warning.path.display(),
            reason = %warning.reason,
            "ignoring setup config; using env defaults"
        );
    }

    let policy = RetryPolicy::from_config(&config);
    let predictor = Arc::new(StubPredictor::new());

    let Some(interval) = config.run_interval() else {
        run_once(&config, &policy, &predictor).await?;
        return Ok(());
    };

    tracing::info!(interval_secs = interval.as_secs(), "running on an interval");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = run_once(&config, &policy, &predictor).await {
                    tracing::error!(error = ?err, "cycle failed; waiting for the next tick");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

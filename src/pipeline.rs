use crate::assembler::assemble_with_stats;
use crate::calibration::CalibrationService;
use crate::error::{CalibrationError, StoreError};
use crate::measurement::{CalibrationParameters, ProcessingContext};
use crate::model::Predictor;
use crate::partition::{partition, SensorPartition};
use crate::processor::BatchProcessor;
use crate::store::MeasurementStore;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub fetched_rows: usize,
    pub assembled: usize,
    pub dropped: usize,
    pub pre_processed: usize,
    pub post_processed: usize,
    pub post_skipped: usize,
    pub recalibrated: Option<CalibrationParameters>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No prediction has ever been committed.
    NoContext,
    /// Nothing inside the window is left to predict.
    NoMeasurements,
    Completed(CycleReport),
}

/// One reconciliation cycle over a store: context, window, partition,
/// optional recalibration, then prediction for each partition.
pub struct Pipeline<S, P> {
    store: Arc<S>,
    calibration: CalibrationService<S>,
    processor: BatchProcessor<S, P>,
}

impl<S, P> Pipeline<S, P>
where
    S: MeasurementStore,
    P: Predictor,
{
    pub fn new(store: Arc<S>, predictor: Arc<P>, min_calibration_devices: usize) -> Self {
        Self {
            calibration: CalibrationService::new(store.clone(), min_calibration_devices),
            processor: BatchProcessor::new(store.clone(), predictor),
            store,
        }
    }

    /// Runs one cycle and closes the store whatever the result.
    pub async fn run(&self) -> Result<CycleOutcome, StoreError> {
        let outcome = self.cycle().await;
        self.store.close().await;
        outcome
    }

    async fn cycle(&self) -> Result<CycleOutcome, StoreError> {
        let Some(context) = self.store.last_prediction().await? else {
            tracing::info!("no prediction recorded yet; nothing to anchor against");
            return Ok(CycleOutcome::NoContext);
        };
        tracing::info!(
            sensor_id = context.sensor_id,
            device_id = context.device_id,
            prediction_time = %context.prediction_time,
            last_result = context.result,
            "loaded processing context"
        );

        let rows = self.store.unprocessed_measurements().await?;
        let (measurements, stats) = assemble_with_stats(rows);
        tracing::debug!(
            rows = stats.rows,
            assembled = stats.assembled,
            dropped_fragments = stats.dropped_fragments,
            dropped_measurements = stats.dropped_measurements,
            "assembled fetched rows"
        );
        if measurements.is_empty() {
            tracing::info!(
                rows = stats.rows,
                dropped = stats.dropped_measurements,
                "no new measurements to process"
            );
            return Ok(CycleOutcome::NoMeasurements);
        }

        let mut report = CycleReport {
            fetched_rows: stats.rows,
            assembled: stats.assembled,
            dropped: stats.dropped_measurements,
            ..CycleReport::default()
        };

        let mut parts = partition(context.sensor_id, measurements);
        let pre = std::mem::take(&mut parts.pre);
        if !pre.is_empty() {
            report.pre_processed = self.processor.process(pre, context.calibration()).await;
        }
        if !parts.post.is_empty() {
            self.process_post_change(&context, parts, &mut report).await?;
        }

        tracing::info!(
            rows = report.fetched_rows,
            assembled = report.assembled,
            dropped = report.dropped,
            pre_processed = report.pre_processed,
            post_processed = report.post_processed,
            post_skipped = report.post_skipped,
            recalibrated = report.recalibrated.is_some(),
            "cycle complete"
        );
        Ok(CycleOutcome::Completed(report))
    }

    async fn process_post_change(
        &self,
        context: &ProcessingContext,
        parts: SensorPartition,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let Some(new_sensor_id) = parts.new_sensor_id() else {
            return Ok(());
        };
        if parts.post_sensor_count() > 1 {
            tracing::warn!(
                new_sensor_id,
                sensors = parts.post_sensor_count(),
                "batch spans more than one sensor change; later changes share this calibration"
            );
        }

        let post = parts.post;
        match self
            .calibration
            .recalibrate(context.sensor_id, new_sensor_id, &post, context)
            .await
        {
            Ok(params) => {
                report.recalibrated = Some(params);
                report.post_processed = self.processor.process(post, params).await;
            }
            Err(CalibrationError::Store(err)) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    old_sensor_id = context.sensor_id,
                    new_sensor_id,
                    skipped = post.len(),
                    error = %err,
                    "calibration failed; skipping post-change measurements this cycle"
                );
                report.post_skipped = post.len();
            }
        }
        Ok(())
    }
}

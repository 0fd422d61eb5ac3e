use crate::error::ProcessError;
use crate::measurement::{CalibrationParameters, Measurement, NewPrediction};
use crate::model::{checked_prediction, preprocess, Predictor};
use crate::store::MeasurementStore;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Calibrates, predicts and persists measurements one at a time. A failure
/// is logged against the measurement that caused it and the batch moves on.
pub struct BatchProcessor<S, P> {
    store: Arc<S>,
    predictor: Arc<P>,
}

impl<S, P> BatchProcessor<S, P>
where
    S: MeasurementStore,
    P: Predictor,
{
    pub fn new(store: Arc<S>, predictor: Arc<P>) -> Self {
        Self { store, predictor }
    }

    /// Returns how many measurements reached the store.
    pub async fn process(&self, measurements: Vec<Measurement>, params: CalibrationParameters) -> usize {
        self.process_with_summary(measurements, params).await.succeeded
    }

    pub async fn process_with_summary(
        &self,
        measurements: Vec<Measurement>,
        params: CalibrationParameters,
    ) -> BatchSummary {
        let mut summary = BatchSummary {
            total: measurements.len(),
            ..BatchSummary::default()
        };

        for mut measurement in measurements {
            match self.process_one(&mut measurement, params).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(
                        sensor_id = measurement.sensor_id,
                        device_id = measurement.device_id,
                        measurement_time = %measurement.measurement_time,
                        error = %err,
                        "measurement processing failed"
                    );
                }
            }
        }

        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            param_a = params.param_a,
            param_b = params.param_b,
            "batch processed"
        );
        summary
    }

    async fn process_one(
        &self,
        measurement: &mut Measurement,
        params: CalibrationParameters,
    ) -> Result<(), ProcessError> {
        measurement
            .assign_calibration(params)
            .map_err(ProcessError::AlreadyCalibrated)?;

        let input = preprocess(measurement)?;
        let result = checked_prediction(self.predictor.predict(&input)?)?;
        let record = NewPrediction {
            sensor_id: input.sensor_id,
            device_id: input.device_id,
            measurement_time: input.measurement_time,
            param_a: input.calibration.param_a,
            param_b: input.calibration.param_b,
            result,
        };
        self.store.insert_prediction(&record).await?;
        Ok(())
    }
}

use crate::assembler::assemble;
use crate::error::CalibrationError;
use crate::measurement::{CalibrationParameters, Measurement, ProcessingContext};
use crate::store::MeasurementStore;
use std::collections::BTreeMap;
use std::sync::Arc;

const PARAM_A_FACTOR: f64 = 1.5;
const PARAM_B_FACTOR: f64 = 2.0;

/// Total timestamp counts of one device, before and after the sensor change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevicePair {
    pub device_id: i64,
    pub old_len: usize,
    pub new_len: usize,
}

impl DevicePair {
    fn relative_shift(&self) -> Result<f64, CalibrationError> {
        if self.old_len == 0 {
            return Err(CalibrationError::ZeroLengthBaseline {
                device_id: self.device_id,
            });
        }
        let old = self.old_len as f64;
        Ok((self.new_len as f64 - old).abs() / old)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Averages the relative length shift over `pairs` (already in device order)
/// and scales it into calibration parameters.
pub fn shift_parameters(pairs: &[DevicePair]) -> Result<CalibrationParameters, CalibrationError> {
    if pairs.is_empty() {
        return Err(CalibrationError::InsufficientPairs {
            sensor_id: 0,
            found: 0,
            required: 1,
        });
    }
    let mut total = 0.0;
    for pair in pairs {
        total += pair.relative_shift()?;
    }
    let avg_shift = total / pairs.len() as f64;
    Ok(CalibrationParameters::new(
        round4(avg_shift * PARAM_A_FACTOR),
        round4(avg_shift * PARAM_B_FACTOR),
    ))
}

pub struct CalibrationService<S> {
    store: Arc<S>,
    min_devices: usize,
}

impl<S: MeasurementStore> CalibrationService<S> {
    pub fn new(store: Arc<S>, min_devices: usize) -> Self {
        Self {
            store,
            min_devices: min_devices.max(1),
        }
    }

    /// Pairs each device seen by `new_sensor_id` in `post` with that device's
    /// last measurement by `old_sensor_id` before the context's prediction,
    /// and derives fresh parameters from the pairs in device-id order.
    pub async fn recalibrate(
        &self,
        old_sensor_id: i64,
        new_sensor_id: i64,
        post: &[Measurement],
        context: &ProcessingContext,
    ) -> Result<CalibrationParameters, CalibrationError> {
        let mut newest: BTreeMap<i64, &Measurement> = BTreeMap::new();
        for m in post.iter().filter(|m| m.sensor_id == new_sensor_id) {
            newest.entry(m.device_id).or_insert(m);
        }
        if newest.len() < self.min_devices {
            return Err(CalibrationError::InsufficientDevices {
                sensor_id: new_sensor_id,
                found: newest.len(),
                required: self.min_devices,
            });
        }

        let mut pairs = Vec::with_capacity(newest.len());
        for (device_id, new) in &newest {
            let rows = self
                .store
                .last_measurement_before(old_sensor_id, *device_id, context.prediction_time)
                .await?;
            let Some(old) = assemble(rows).into_iter().next() else {
                tracing::debug!(
                    device_id,
                    old_sensor_id,
                    "no usable baseline measurement for device"
                );
                continue;
            };
            pairs.push(DevicePair {
                device_id: *device_id,
                old_len: old.total_length(),
                new_len: new.total_length(),
            });
        }
        if pairs.len() < self.min_devices {
            return Err(CalibrationError::InsufficientPairs {
                sensor_id: old_sensor_id,
                found: pairs.len(),
                required: self.min_devices,
            });
        }

        let params = shift_parameters(&pairs)?;
        tracing::info!(
            old_sensor_id,
            new_sensor_id,
            pairs = pairs.len(),
            param_a = params.param_a,
            param_b = params.param_b,
            "recalibrated after sensor change"
        );
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::measurement::fixtures::{at, measurement, rows};
    use crate::store::memory::MemoryStore;

    fn context() -> ProcessingContext {
        ProcessingContext {
            sensor_id: 1,
            device_id: 10,
            prediction_time: at(30),
            param_a: 0.3,
            param_b: 0.4,
            result: 0.5,
        }
    }

    fn store_with_baselines(baselines: &[(i64, &[usize])]) -> Arc<MemoryStore> {
        let store = MemoryStore::new(at(59));
        for (device, lens) in baselines {
            store.add_rows(rows(1, *device, 20, lens));
        }
        Arc::new(store)
    }

    #[test]
    fn one_pair_growing_by_half_gives_three_quarters_and_one() {
        let params = shift_parameters(&[DevicePair {
            device_id: 1,
            old_len: 3000,
            new_len: 4500,
        }])
        .unwrap();
        assert_eq!(params, CalibrationParameters::new(0.75, 1.0));
    }

    #[test]
    fn shrinking_measurements_shift_by_absolute_difference() {
        let params = shift_parameters(&[
            DevicePair {
                device_id: 1,
                old_len: 4000,
                new_len: 3000,
            },
            DevicePair {
                device_id: 2,
                old_len: 3000,
                new_len: 3000,
            },
        ])
        .unwrap();
        // mean(0.25, 0.0) = 0.125
        assert_eq!(params, CalibrationParameters::new(0.1875, 0.25));
    }

    #[test]
    fn zero_length_baseline_is_rejected() {
        let err = shift_parameters(&[DevicePair {
            device_id: 4,
            old_len: 0,
            new_len: 3000,
        }])
        .unwrap_err();
        assert!(matches!(err, CalibrationError::ZeroLengthBaseline { device_id: 4 }));
    }

    #[test]
    fn parameters_are_rounded_to_four_places() {
        let params = shift_parameters(&[DevicePair {
            device_id: 1,
            old_len: 3000,
            new_len: 3001,
        }])
        .unwrap();
        assert_eq!(params.param_a, 0.0005);
        assert_eq!(params.param_b, 0.0007);
    }

    #[tokio::test]
    async fn pairs_devices_across_the_sensor_change() {
        let store = store_with_baselines(&[(10, &[3000, 3000, 3000]), (11, &[4000, 4000, 4000])]);
        let service = CalibrationService::new(store, 2);
        let post = vec![
            measurement(2, 11, 40, &[4000, 4000, 4000]),
            measurement(2, 10, 41, &[4500, 4500, 4500]),
        ];

        let params = service.recalibrate(1, 2, &post, &context()).await.unwrap();
        // device 10 shifts by 0.5, device 11 by 0.0
        assert_eq!(params, CalibrationParameters::new(0.375, 0.5));
    }

    #[tokio::test]
    async fn result_does_not_depend_on_arrival_order() {
        let store = store_with_baselines(&[
            (10, &[3000, 3000, 3000]),
            (11, &[4000, 4000, 4000]),
            (12, &[5000, 5000, 5000]),
        ]);
        let service = CalibrationService::new(store, 2);
        let mut post = vec![
            measurement(2, 10, 40, &[3300, 3300, 3300]),
            measurement(2, 11, 41, &[5000, 5000, 5000]),
            measurement(2, 12, 42, &[4000, 4000, 4000]),
        ];

        let forward = service.recalibrate(1, 2, &post, &context()).await.unwrap();
        post.reverse();
        let backward = service.recalibrate(1, 2, &post, &context()).await.unwrap();
        assert_eq!(forward, backward);
    }

    #[tokio::test]
    async fn first_seen_measurement_per_device_is_used() {
        let store = store_with_baselines(&[(10, &[3000, 3000, 3000]), (11, &[3000, 3000, 3000])]);
        let service = CalibrationService::new(store, 2);
        let post = vec![
            measurement(2, 10, 40, &[3000, 3000, 3000]),
            measurement(2, 11, 41, &[3000, 3000, 3000]),
            measurement(2, 10, 42, &[6000, 6000, 6000]),
        ];

        let params = service.recalibrate(1, 2, &post, &context()).await.unwrap();
        assert_eq!(params, CalibrationParameters::new(0.0, 0.0));
    }

    #[tokio::test]
    async fn measurements_of_other_sensors_are_not_paired() {
        let store = store_with_baselines(&[(10, &[3000, 3000, 3000]), (11, &[3000, 3000, 3000])]);
        let service = CalibrationService::new(store, 2);
        let post = vec![
            measurement(2, 10, 40, &[3000, 3000, 3000]),
            measurement(3, 11, 41, &[3000, 3000, 3000]),
        ];

        let err = service.recalibrate(1, 2, &post, &context()).await.unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientDevices {
                sensor_id: 2,
                found: 1,
                required: 2
            }
        ));
    }

    #[tokio::test]
    async fn devices_without_baseline_are_excluded() {
        let store = store_with_baselines(&[(10, &[3000, 3000, 3000])]);
        let service = CalibrationService::new(store, 2);
        let post = vec![
            measurement(2, 10, 40, &[3000, 3000, 3000]),
            measurement(2, 11, 41, &[3000, 3000, 3000]),
        ];

        let err = service.recalibrate(1, 2, &post, &context()).await.unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientPairs { found: 1, required: 2, .. }
        ));
    }

    #[tokio::test]
    async fn baselines_after_the_context_are_ignored() {
        let store = MemoryStore::new(at(59));
        store.add_rows(rows(1, 10, 20, &[3000, 3000, 3000]));
        store.add_rows(rows(1, 11, 35, &[3000, 3000, 3000]));
        let service = CalibrationService::new(Arc::new(store), 2);
        let post = vec![
            measurement(2, 10, 40, &[3000, 3000, 3000]),
            measurement(2, 11, 41, &[3000, 3000, 3000]),
        ];

        let err = service.recalibrate(1, 2, &post, &context()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientPairs { found: 1, .. }));
    }

    #[tokio::test]
    async fn store_failures_propagate() {
        let store = store_with_baselines(&[(10, &[3000, 3000, 3000]), (11, &[3000, 3000, 3000])]);
        store.fail_next(1);
        let service = CalibrationService::new(store, 2);
        let post = vec![
            measurement(2, 10, 40, &[3000, 3000, 3000]),
            measurement(2, 11, 41, &[3000, 3000, 3000]),
        ];

        let err = service.recalibrate(1, 2, &post, &context()).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Store(StoreError::Unavailable(_))));
    }
}

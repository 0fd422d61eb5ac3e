use crate::measurement::Measurement;

#[derive(Debug, Default)]
pub struct SensorPartition {
    /// Leading measurements still taken by the current sensor.
    pub pre: Vec<Measurement>,
    /// Everything from the first foreign sensor onward, further changes included.
    pub post: Vec<Measurement>,
}

impl SensorPartition {
    /// Sensor that took over, if the batch changed sensors.
    pub fn new_sensor_id(&self) -> Option<i64> {
        self.post.first().map(|m| m.sensor_id)
    }

    pub fn post_sensor_count(&self) -> usize {
        let mut seen: Vec<i64> = Vec::new();
        for m in &self.post {
            if !seen.contains(&m.sensor_id) {
                seen.push(m.sensor_id);
            }
        }
        seen.len()
    }
}

/// Splits a time-ordered batch at the first measurement whose sensor differs
/// from `current_sensor_id`.
pub fn partition(current_sensor_id: i64, mut measurements: Vec<Measurement>) -> SensorPartition {
    match measurements
        .iter()
        .position(|m| m.sensor_id != current_sensor_id)
    {
        None => SensorPartition {
            pre: measurements,
            post: Vec::new(),
        },
        Some(split) => {
            let post = measurements.split_off(split);
            tracing::info!(
                split,
                old_sensor_id = current_sensor_id,
                new_sensor_id = post[0].sensor_id,
                "sensor change detected"
            );
            SensorPartition {
                pre: measurements,
                post,
            }
        }
    }
}

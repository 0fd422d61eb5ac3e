//! Groups delivered fragment rows into complete, validated measurements.
//!
//! Rows sharing `(measurement_time, sensor_id, device_id)` form one
//! measurement. Unless every row of a key carries an authoritative
//! `series_count`, the expected count is the number of rows that arrived for
//! the key. Fragments that fail to decode are dropped, which leaves the
//! measurement incomplete and therefore excluded.

use crate::measurement::{Fragment, Measurement, RawFragmentRow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

type GroupKey = (DateTime<Utc>, i64, i64);

#[derive(Debug)]
struct Group {
    measurement: Measurement,
    arrived: usize,
    hints: Vec<Option<u32>>,
}

impl Group {
    fn expected_series_count(&self) -> usize {
        match self.hints.first().copied().flatten() {
            Some(hint) if self.hints.iter().all(|h| *h == Some(hint)) => hint as usize,
            _ => self.arrived,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyStats {
    pub rows: usize,
    pub dropped_fragments: usize,
    pub dropped_measurements: usize,
    pub assembled: usize,
}

/// Assembles rows into measurements ordered by `measurement_time`. Ties keep
/// the order in which their first row arrived.
pub fn assemble<I>(rows: I) -> Vec<Measurement>
where
    I: IntoIterator<Item = RawFragmentRow>,
{
    assemble_with_stats(rows).0
}

pub fn assemble_with_stats<I>(rows: I) -> (Vec<Measurement>, AssemblyStats)
where
    I: IntoIterator<Item = RawFragmentRow>,
{
    let mut stats = AssemblyStats::default();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for row in rows {
        stats.rows += 1;
        let key = (row.measurement_time, row.sensor_id, row.device_id);
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Group {
                measurement: Measurement::new(
                    row.sensor_id,
                    row.device_id,
                    row.measurement_time,
                    0,
                ),
                arrived: 0,
                hints: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.arrived += 1;
        group.hints.push(row.series_count_hint);

        match Fragment::decode(&row.payload) {
            Ok(fragment) => group.measurement.series.push(fragment),
            Err(err) => {
                stats.dropped_fragments += 1;
                tracing::warn!(
                    sensor_id = row.sensor_id,
                    device_id = row.device_id,
                    measurement_time = %row.measurement_time,
                    error = %err,
                    "dropping undecodable fragment"
                );
            }
        }
    }

    let mut measurements = Vec::with_capacity(groups.len());
    for group in groups {
        let expected = group.expected_series_count();
        let mut measurement = group.measurement;
        measurement.expected_series_count = expected;
        match measurement.validate() {
            Ok(()) => measurements.push(measurement),
            Err(violation) => {
                stats.dropped_measurements += 1;
                tracing::warn!(
                    sensor_id = measurement.sensor_id,
                    device_id = measurement.device_id,
                    measurement_time = %measurement.measurement_time,
                    present = measurement.series.len(),
                    expected,
                    reason = %violation,
                    "dropping invalid measurement"
                );
            }
        }
    }

    // stable: equal times keep first-arrival order
    measurements.sort_by_key(|m| m.measurement_time);
    stats.assembled = measurements.len();
    (measurements, stats)
}

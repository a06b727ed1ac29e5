//! Occupancy correction and seed-series construction.
//!
//! Raw Wi-Fi client counts are bucketed to the hour (max per hour), scaled by a
//! per-location correction factor and reindexed onto a contiguous hourly range
//! before they reach the rollout engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};

use crate::db::Observation;
use crate::error::{ForecastError, Result};
use crate::ml::profile::LocationProfile;

/// Corrected occupancy for one raw signal count, rounded and non-negative.
pub fn correct_occupancy(raw: i64, correction_factor: f64) -> i64 {
    (raw as f64 * correction_factor).round().max(0.0) as i64
}

/// Truncate a timestamp to the start of its hour.
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

/// Max raw signal per hour, corrected.
pub fn hourly_corrected(
    observations: &[Observation],
    correction_factor: f64,
) -> BTreeMap<DateTime<Utc>, i64> {
    let mut buckets: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();
    for obs in observations {
        let hour = floor_to_hour(obs.ts);
        let raw = i64::from(obs.wifi_clients);
        buckets
            .entry(hour)
            .and_modify(|v| *v = (*v).max(raw))
            .or_insert(raw);
    }
    buckets
        .into_iter()
        .map(|(ts, raw)| (ts, correct_occupancy(raw, correction_factor)))
        .collect()
}

/// How hours without an observation are filled when reindexing.
#[derive(Debug, Clone, Copy)]
pub enum GapFill<'a> {
    Zero,
    Profile(&'a LocationProfile),
}

impl GapFill<'_> {
    fn value_at(&self, ts: &DateTime<Utc>) -> f64 {
        match self {
            GapFill::Zero => 0.0,
            GapFill::Profile(profile) => profile.lookup(ts) as f64,
        }
    }
}

/// Contiguous, strictly hourly (timestamp, corrected occupancy) series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedSeries {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<f64>,
}

impl SeedSeries {
    /// Validate and wrap parallel timestamp/value vectors.
    pub fn new(timestamps: Vec<DateTime<Utc>>, values: Vec<f64>) -> Result<Self> {
        if timestamps.len() != values.len() {
            return Err(ForecastError::InvalidSeed(format!(
                "{} timestamps for {} values",
                timestamps.len(),
                values.len()
            )));
        }
        for pair in timestamps.windows(2) {
            if pair[1] - pair[0] != Duration::hours(1) {
                return Err(ForecastError::InvalidSeed(format!(
                    "expected 1h spacing between {} and {}",
                    pair[0], pair[1]
                )));
            }
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(ForecastError::InvalidSeed(format!(
                "occupancy must be finite and non-negative, got {bad}"
            )));
        }
        Ok(Self { timestamps, values })
    }

    /// Hourly series ending at `end` whose first hour is `start`.
    pub fn from_hourly(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hourly: &BTreeMap<DateTime<Utc>, i64>,
        fill: GapFill<'_>,
    ) -> Result<Self> {
        let start = floor_to_hour(start);
        let end = floor_to_hour(end);
        if end < start {
            return Err(ForecastError::InvalidSeed(format!(
                "range end {end} precedes start {start}"
            )));
        }

        let hours = (end - start).num_hours() as usize + 1;
        let mut timestamps = Vec::with_capacity(hours);
        let mut values = Vec::with_capacity(hours);
        let mut filled = 0usize;
        for i in 0..hours {
            let ts = start + Duration::hours(i as i64);
            let value = match hourly.get(&ts) {
                Some(v) => *v as f64,
                None => {
                    filled += 1;
                    fill.value_at(&ts)
                }
            };
            timestamps.push(ts);
            values.push(value);
        }
        if filled > 0 {
            tracing::debug!(filled, hours, "Filled missing hours in seed series");
        }

        Self::new(timestamps, values)
    }

    /// Reindex raw observations onto `[start, end]` hourly.
    pub fn from_observations(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        observations: &[Observation],
        correction_factor: f64,
        fill: GapFill<'_>,
    ) -> Result<Self> {
        let hourly = hourly_corrected(observations, correction_factor);
        Self::from_hourly(start, end, &hourly, fill)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    /// Last `n` entries (or all of them if shorter).
    pub fn tail(&self, n: usize) -> (&[DateTime<Utc>], &[f64]) {
        let from = self.len().saturating_sub(n);
        (&self.timestamps[from..], &self.values[from..])
    }
}

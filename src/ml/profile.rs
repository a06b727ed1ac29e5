//! Historical (day-of-week, hour) occupancy profile.
//!
//! Used when the rollout engine cannot run: too little history, or a target
//! too far beyond the last observation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::db::Observation;
use crate::series::hourly_corrected;

/// One (day-of-week, hour) slot of a profile, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProfileSlot {
    /// Monday = 0.
    pub day_of_week: u32,
    pub hour: u32,
    pub mean_occupancy: i64,
}

/// Mean corrected occupancy keyed by local (day-of-week, hour).
#[derive(Debug, Clone, PartialEq)]
pub struct LocationProfile {
    location: String,
    offset: FixedOffset,
    slots: HashMap<(u32, u32), i64>,
}

impl LocationProfile {
    pub fn empty(location: impl Into<String>, offset: FixedOffset) -> Self {
        Self {
            location: location.into(),
            offset,
            slots: HashMap::new(),
        }
    }

    /// Build from hourly corrected values.
    pub fn from_hourly(
        location: impl Into<String>,
        hourly: &BTreeMap<DateTime<Utc>, i64>,
        offset: FixedOffset,
    ) -> Self {
        let mut sums: HashMap<(u32, u32), (i64, i64)> = HashMap::new();
        for (ts, value) in hourly {
            let local = ts.with_timezone(&offset);
            let key = (local.weekday().num_days_from_monday(), local.hour());
            let entry = sums.entry(key).or_default();
            entry.0 += value;
            entry.1 += 1;
        }

        let slots = sums
            .into_iter()
            .map(|(key, (sum, count))| (key, (sum as f64 / count as f64).round() as i64))
            .collect();

        Self {
            location: location.into(),
            offset,
            slots,
        }
    }

    /// Build from raw observations (bucketed to the hour and corrected).
    pub fn from_observations(
        location: impl Into<String>,
        observations: &[Observation],
        correction_factor: f64,
        offset: FixedOffset,
    ) -> Self {
        let hourly = hourly_corrected(observations, correction_factor);
        Self::from_hourly(location, &hourly, offset)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, day_of_week: u32, hour: u32) -> Option<i64> {
        self.slots.get(&(day_of_week, hour)).copied()
    }

    /// Profile mean for the local slot of `ts`; 0 when the slot is absent.
    pub fn lookup(&self, ts: &DateTime<Utc>) -> i64 {
        let local = ts.with_timezone(&self.offset);
        self.get(local.weekday().num_days_from_monday(), local.hour())
            .unwrap_or(0)
            .max(0)
    }

    /// Slots sorted by (day-of-week, hour).
    pub fn slots(&self) -> Vec<ProfileSlot> {
        let mut slots: Vec<_> = self
            .slots
            .iter()
            .map(|(&(day_of_week, hour), &mean_occupancy)| ProfileSlot {
                day_of_week,
                hour,
                mean_occupancy,
            })
            .collect();
        slots.sort_by_key(|s| (s.day_of_week, s.hour));
        slots
    }
}

/// Per-location profile cache; each location is built at most once until
/// invalidated.
#[derive(Debug, Default)]
pub struct ProfileCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<LocationProfile>>>>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, location: &str) -> Arc<OnceCell<Arc<LocationProfile>>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(location.to_string()).or_default())
    }

    /// Cached profile for `location`, running `build` on first use.
    pub async fn get_or_build<F, Fut, E>(
        &self,
        location: &str,
        build: F,
    ) -> Result<Arc<LocationProfile>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LocationProfile, E>>,
    {
        let cell = self.cell(location);
        cell.get_or_try_init(|| async move { build().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Drop a cached profile so the next request rebuilds it.
    pub fn invalidate(&self, location: &str) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location);
    }
}

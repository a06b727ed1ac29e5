//! Abstractions for time and observation access to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for deterministic testing
//! - `ObservationStore`: Abstracting where raw Wi-Fi signals come from

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::db::Observation;

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// This allows injecting mock clocks during testing to create
/// deterministic, reproducible tests for time-dependent logic.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Set the mock clock to a new time.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.utc_time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ==================== Observation Store Trait ====================

/// Source of raw hourly-aligned Wi-Fi signal observations.
#[allow(async_fn_in_trait)]
pub trait ObservationStore {
    /// Observations for `location` with `start <= ts <= end`, ascending.
    async fn observations(
        &self,
        location: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;

    /// Timestamp of the newest observation for `location`.
    async fn latest_timestamp(&self, location: &str) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory store keyed by (location, timestamp); inserts upsert.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<BTreeMap<(String, DateTime<Utc>), i32>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: &str, ts: DateTime<Utc>, wifi_clients: i32) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((location.to_string(), ts), wifi_clients);
    }

    pub fn extend(&self, location: &str, rows: impl IntoIterator<Item = (DateTime<Utc>, i32)>) {
        for (ts, clients) in rows {
            self.insert(location, ts, clients);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObservationStore for MemoryStore {
    async fn observations(
        &self,
        location: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        if end < start {
            return Ok(Vec::new());
        }
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .range((location.to_string(), start)..=(location.to_string(), end))
            .map(|((loc, ts), clients)| Observation {
                location: loc.clone(),
                ts: *ts,
                wifi_clients: *clients,
            })
            .collect())
    }

    async fn latest_timestamp(&self, location: &str) -> Result<Option<DateTime<Utc>>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .keys()
            .filter(|(loc, _)| loc == location)
            .map(|(_, ts)| *ts)
            .next_back())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    // ==================== Clock Tests ====================

    #[test]
    fn test_system_clock_returns_current_time() {
        let clock = SystemClock;
        let before = Utc::now();
        let now = clock.now_utc();
        let after = Utc::now();
        assert!(now >= before && now <= after);
    }

    #[test]
    fn test_mock_clock_fixed_time() {
        let fixed = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let clock = MockClock::new(fixed);
        assert_eq!(clock.now_utc(), fixed);
        assert_eq!(clock.now_utc(), fixed);
    }

    #[test]
    fn test_mock_clock_set_and_advance() {
        let start = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let clock = MockClock::new(start);

        clock.advance(Duration::hours(3));
        assert_eq!(clock.now_utc(), start + Duration::hours(3));

        let later = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        clock.set_time(later);
        assert_eq!(clock.now_utc(), later);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let start = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let clock = MockClock::new(start);
        let other = clock.clone();
        clock.advance(Duration::hours(1));
        assert_eq!(other.now_utc(), start + Duration::hours(1));
    }

    // ==================== MemoryStore Tests ====================

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    #[tokio::test]
    async fn test_memory_store_range_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        store.extend("a", [(hour(3), 3), (hour(1), 1), (hour(2), 2), (hour(5), 5)]);
        store.insert("b", hour(2), 99);

        let rows = store.observations("a", hour(1), hour(3)).await.unwrap();
        let ts: Vec<_> = rows.iter().map(|o| o.ts).collect();
        assert_eq!(ts, vec![hour(1), hour(2), hour(3)]);
        assert!(rows.iter().all(|o| o.location == "a"));
    }

    #[tokio::test]
    async fn test_memory_store_upserts() {
        let store = MemoryStore::new();
        store.insert("a", hour(1), 4);
        store.insert("a", hour(1), 7);

        assert_eq!(store.len(), 1);
        let rows = store.observations("a", hour(0), hour(2)).await.unwrap();
        assert_eq!(rows[0].wifi_clients, 7);
    }

    #[tokio::test]
    async fn test_memory_store_latest() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_timestamp("a").await.unwrap(), None);

        store.extend("a", [(hour(1), 1), (hour(9), 1)]);
        store.insert("z", hour(20), 1);
        assert_eq!(store.latest_timestamp("a").await.unwrap(), Some(hour(9)));
    }

    #[tokio::test]
    async fn test_memory_store_reversed_range_is_empty() {
        let store = MemoryStore::new();
        store.insert("a", hour(1), 1);
        assert!(store.observations("a", hour(2), hour(0)).await.unwrap().is_empty());
    }
}

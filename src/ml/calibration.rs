//! Post-hoc calibration of scaled model outputs into physical occupancy.
//!
//! Each location maps to a [`CalibrationPolicy`] record. Policies are applied
//! in a fixed order: scale, general clamp, first matching window override,
//! peak-hour multiplier, final clamp, floor at zero.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::preprocessing::OccupancyScaler;
use crate::config::LocationConfig;

/// Capacity assumed for locations missing from the capacity table.
pub const DEFAULT_CAPACITY: f64 = 100.0;

const SATURDAY: u32 = 5;
const SUNDAY: u32 = 6;

/// How a scaled output is turned into a head count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// `scaled x capacity`.
    #[default]
    Capacity,
    /// Inverse of the learned occupancy scaler, or `scaled x fallback_scale`.
    InverseScaler,
}

/// Upper clamp applied at one stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapRule {
    Unbounded,
    /// Fraction of the effective capacity.
    Fraction(f64),
    Absolute(f64),
}

impl CapRule {
    pub fn limit(&self, capacity: f64) -> Option<f64> {
        match self {
            CapRule::Unbounded => None,
            CapRule::Fraction(f) => Some(f * capacity),
            CapRule::Absolute(v) => Some(*v),
        }
    }
}

/// Multiplier applied inside a half-open local hour window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourMultiplier {
    pub start_hour: u32,
    pub end_hour: u32,
    pub factor: f64,
}

impl HourMultiplier {
    pub const fn new(start_hour: u32, end_hour: u32, factor: f64) -> Self {
        Self {
            start_hour,
            end_hour,
            factor,
        }
    }
}

/// Peak-hour multipliers by day type. First matching window wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakMultiplierTable {
    pub weekday: Vec<HourMultiplier>,
    pub saturday: Vec<HourMultiplier>,
    pub sunday: Vec<HourMultiplier>,
}

impl PeakMultiplierTable {
    /// Weekday 8-11 x1.3, 13-16 x1.4, 18-20 x1.2; Saturday 9-12 x1.1.
    pub fn standard() -> Self {
        Self {
            weekday: vec![
                HourMultiplier::new(8, 11, 1.3),
                HourMultiplier::new(13, 16, 1.4),
                HourMultiplier::new(18, 20, 1.2),
            ],
            saturday: vec![HourMultiplier::new(9, 12, 1.1)],
            sunday: Vec::new(),
        }
    }

    pub fn factor(&self, day_of_week: u32, hour: u32) -> f64 {
        let windows = match day_of_week {
            SATURDAY => &self.saturday,
            SUNDAY => &self.sunday,
            _ => &self.weekday,
        };
        windows
            .iter()
            .find(|m| in_window(m.start_hour, m.end_hour, hour))
            .map_or(1.0, |m| m.factor)
    }
}

impl Default for PeakMultiplierTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Tight ceiling forced on a low-traffic window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOverride {
    /// Days (Monday = 0) the override applies to; empty means every day.
    #[serde(default)]
    pub days: Vec<u32>,
    pub start_hour: u32,
    /// Exclusive. A window with `end_hour <= start_hour` wraps past midnight.
    pub end_hour: u32,
    pub cap: f64,
}

impl WindowOverride {
    pub fn matches(&self, day_of_week: u32, hour: u32) -> bool {
        (self.days.is_empty() || self.days.contains(&day_of_week))
            && in_window(self.start_hour, self.end_hour, hour)
    }
}

fn in_window(start: u32, end: u32, hour: u32) -> bool {
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPolicy {
    pub mode: ScalingMode,
    /// Replaces the nominal capacity for scaling and fractional caps.
    pub effective_capacity: Option<f64>,
    /// Multiplier used by [`ScalingMode::InverseScaler`] without a scaler.
    pub fallback_scale: f64,
    pub general_cap: CapRule,
    pub final_cap: CapRule,
    pub peak_multipliers: PeakMultiplierTable,
    pub overrides: Vec<WindowOverride>,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            mode: ScalingMode::Capacity,
            effective_capacity: None,
            fallback_scale: 100.0,
            general_cap: CapRule::Fraction(0.8),
            final_cap: CapRule::Fraction(0.9),
            peak_multipliers: PeakMultiplierTable::standard(),
            overrides: Vec::new(),
        }
    }
}

/// Location-keyed calibration table.
#[derive(Debug, Clone)]
pub struct Calibrator {
    capacities: HashMap<String, f64>,
    policies: HashMap<String, CalibrationPolicy>,
    default_policy: CalibrationPolicy,
    offset: FixedOffset,
}

impl Calibrator {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            capacities: HashMap::new(),
            policies: HashMap::new(),
            default_policy: CalibrationPolicy::default(),
            offset,
        }
    }

    pub fn from_locations(locations: &HashMap<String, LocationConfig>, offset: FixedOffset) -> Self {
        locations
            .iter()
            .fold(Self::new(offset), |cal, (id, loc)| {
                cal.with_location(id, f64::from(loc.capacity), loc.calibration.clone())
            })
    }

    pub fn with_location(
        mut self,
        location: impl Into<String>,
        capacity: f64,
        policy: CalibrationPolicy,
    ) -> Self {
        let location = location.into();
        self.capacities.insert(location.clone(), capacity);
        self.policies.insert(location, policy);
        self
    }

    pub fn policy(&self, location: &str) -> &CalibrationPolicy {
        self.policies.get(location).unwrap_or(&self.default_policy)
    }

    pub fn nominal_capacity(&self, location: &str) -> Option<f64> {
        self.capacities.get(location).copied()
    }

    /// Capacity used for scaling and fractional caps.
    pub fn effective_capacity(&self, location: &str) -> f64 {
        self.policy(location)
            .effective_capacity
            .or_else(|| self.nominal_capacity(location))
            .unwrap_or(DEFAULT_CAPACITY)
    }

    /// Upper bound on any calibrated value, if the policy has one.
    pub fn ceiling(&self, location: &str) -> Option<f64> {
        self.policy(location)
            .final_cap
            .limit(self.effective_capacity(location))
            .map(|c| c.max(0.0))
    }

    /// Map one scaled predictor output to a physical head count.
    ///
    /// `ts` is the hour being predicted; without it the override and
    /// multiplier stages are skipped.
    pub fn calibrate(
        &self,
        scaled: f64,
        location: &str,
        ts: Option<DateTime<Utc>>,
        scaler: Option<&OccupancyScaler>,
    ) -> f64 {
        let policy = self.policy(location);
        let capacity = self.effective_capacity(location);

        let mut y = match (policy.mode, scaler) {
            (ScalingMode::Capacity, _) => scaled * capacity,
            (ScalingMode::InverseScaler, Some(s)) => s.inverse_transform(scaled),
            (ScalingMode::InverseScaler, None) => scaled * policy.fallback_scale,
        };

        if let Some(cap) = policy.general_cap.limit(capacity) {
            y = y.min(cap);
        }
        y = y.max(0.0);

        if let Some(ts) = ts {
            let local = ts.with_timezone(&self.offset);
            let dow = local.weekday().num_days_from_monday();
            let hour = local.hour();

            if let Some(o) = policy.overrides.iter().find(|o| o.matches(dow, hour)) {
                y = y.min(o.cap).max(0.0);
            }
            y *= policy.peak_multipliers.factor(dow, hour);
        }

        if let Some(cap) = policy.final_cap.limit(capacity) {
            y = y.min(cap);
        }
        y.max(0.0)
    }
}

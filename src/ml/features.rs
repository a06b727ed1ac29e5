//! Feature row assembly for hybrid predictors.
//!
//! Rows are built by name, not by position: every entry of the bundle's
//! `feature_order` is looked up in the union of the schedule features, the
//! capacity-scaled occupancy and the one-hot calendar block. Names that cannot
//! be resolved are filled with zero and reported.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::preprocessing::OneHotEncoder;
use crate::schedule::{LibrarySchedule, ScheduleFeatures};

/// Name of the occupancy column in hybrid feature rows.
pub const OCCUPANCY_FEATURE: &str = "occupancy_scaled";

/// Divisor used when a location has no known capacity.
pub const FALLBACK_DIVISOR: f64 = 100.0;

/// Capacity-aware occupancy normalization.
pub fn capacity_scale(occupancy: f64, capacity: Option<f64>) -> f64 {
    let divisor = capacity.filter(|c| *c > 0.0).unwrap_or(FALLBACK_DIVISOR);
    occupancy / divisor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeatureSource {
    Occupancy,
    Schedule(usize),
    Categorical(usize),
    Missing,
}

/// Name-to-source mapping for one `feature_order`, resolved once per rollout.
#[derive(Debug, Clone)]
pub struct RowLayout {
    sources: Vec<FeatureSource>,
    missing: Vec<String>,
    encoder: Option<OneHotEncoder>,
}

impl RowLayout {
    pub fn new(feature_order: &[String], encoder: Option<&OneHotEncoder>) -> Self {
        let categorical = encoder.map(OneHotEncoder::feature_names_out).unwrap_or_default();

        let mut missing = Vec::new();
        let sources = feature_order
            .iter()
            .map(|name| {
                if name == OCCUPANCY_FEATURE {
                    FeatureSource::Occupancy
                } else if let Some(i) = ScheduleFeatures::index_of(name) {
                    FeatureSource::Schedule(i)
                } else if let Some(i) = categorical.iter().position(|c| c == name) {
                    FeatureSource::Categorical(i)
                } else {
                    missing.push(name.clone());
                    FeatureSource::Missing
                }
            })
            .collect();

        Self {
            sources,
            missing,
            encoder: encoder.cloned(),
        }
    }

    pub fn width(&self) -> usize {
        self.sources.len()
    }

    /// Names that resolve to no known feature and are zero-filled.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn is_aligned(&self) -> bool {
        self.missing.is_empty()
    }
}

/// One assembled row plus the names that were defaulted to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRow {
    pub values: Vec<f64>,
    pub defaulted: Vec<String>,
}

/// Per-name count of zero-filled features over a rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentReport {
    defaulted_features: BTreeMap<String, usize>,
}

impl AlignmentReport {
    pub fn record(&mut self, names: &[String]) {
        for name in names {
            *self.defaulted_features.entry(name.clone()).or_default() += 1;
        }
    }

    /// True when no feature was ever defaulted.
    pub fn is_clean(&self) -> bool {
        self.defaulted_features.is_empty()
    }

    /// Total number of defaulted cells.
    pub fn total(&self) -> usize {
        self.defaulted_features.values().sum()
    }

    pub fn defaulted_features(&self) -> &BTreeMap<String, usize> {
        &self.defaulted_features
    }

    pub fn missing_names(&self) -> Vec<String> {
        self.defaulted_features.keys().cloned().collect()
    }
}

/// Builds hybrid predictor rows from (timestamp, occupancy) pairs.
#[derive(Debug, Clone)]
pub struct FeatureRowAssembler {
    schedule: LibrarySchedule,
}

impl FeatureRowAssembler {
    pub fn new(schedule: LibrarySchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &LibrarySchedule {
        &self.schedule
    }

    /// Fill `row` (length `layout.width()`) for one timestamp.
    pub fn fill_row(
        &self,
        layout: &RowLayout,
        ts: &DateTime<Utc>,
        occupancy: f64,
        capacity: Option<f64>,
        row: &mut [f64],
    ) {
        let sched = self.schedule.derive_utc(ts);
        let numeric = sched.values();
        let categorical = layout
            .encoder
            .as_ref()
            .map(|enc| enc.encode(sched.hour, sched.day_of_week))
            .unwrap_or_default();
        let occupancy_scaled = capacity_scale(occupancy, capacity);

        for (cell, source) in row.iter_mut().zip(&layout.sources) {
            *cell = match source {
                FeatureSource::Occupancy => occupancy_scaled,
                FeatureSource::Schedule(i) => numeric[*i],
                FeatureSource::Categorical(i) => categorical.get(*i).copied().unwrap_or(0.0),
                FeatureSource::Missing => 0.0,
            };
        }
    }

    /// Assemble a single row in `feature_order`.
    pub fn assemble(
        &self,
        ts: &DateTime<Utc>,
        occupancy: f64,
        encoder: Option<&OneHotEncoder>,
        feature_order: &[String],
        capacity: Option<f64>,
    ) -> AssembledRow {
        let layout = RowLayout::new(feature_order, encoder);
        let mut values = vec![0.0; layout.width()];
        self.fill_row(&layout, ts, occupancy, capacity, &mut values);
        if !layout.is_aligned() {
            tracing::warn!(missing = ?layout.missing(), "Defaulted features to zero");
        }
        AssembledRow {
            values,
            defaulted: layout.missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::config::ScheduleConfig;

    fn assembler() -> FeatureRowAssembler {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        FeatureRowAssembler::new(LibrarySchedule::new(&ScheduleConfig::default(), offset))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // Monday 2025-03-03 08:00 Manila
    fn monday_eight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap()
    }

    // ==================== Scaling Tests ====================

    #[test]
    fn test_capacity_scale() {
        assert_relative_eq!(capacity_scale(50.0, Some(250.0)), 0.2);
        assert_relative_eq!(capacity_scale(50.0, None), 0.5);
        assert_relative_eq!(capacity_scale(50.0, Some(0.0)), 0.5);
    }

    // ==================== Assembly Tests ====================

    #[test]
    fn test_assemble_follows_feature_order() {
        let enc = OneHotEncoder::hour_and_day();
        let order = names(&[
            "hour_8",
            OCCUPANCY_FEATURE,
            "morning_peak",
            "day_of_week_0",
            "day_of_week_1",
            "hour_cos",
        ]);
        let row = assembler().assemble(&monday_eight(), 25.0, Some(&enc), &order, Some(100.0));

        assert!(row.defaulted.is_empty());
        assert_eq!(row.values.len(), 6);
        assert_eq!(row.values[0], 1.0);
        assert_relative_eq!(row.values[1], 0.25);
        assert_eq!(row.values[2], 1.0);
        assert_eq!(row.values[3], 1.0);
        assert_eq!(row.values[4], 0.0);
        assert_relative_eq!(row.values[5], (2.0 * std::f64::consts::PI * 8.0 / 24.0).cos());
    }

    #[test]
    fn test_unknown_feature_defaults_to_zero() {
        let enc = OneHotEncoder::hour_and_day();
        let order = names(&[OCCUPANCY_FEATURE, "temperature_c", "library_open"]);
        let row = assembler().assemble(&monday_eight(), 10.0, Some(&enc), &order, Some(100.0));

        assert_eq!(row.values.len(), order.len());
        assert_eq!(row.values[1], 0.0);
        assert_eq!(row.values[2], 1.0);
        assert_eq!(row.defaulted, vec!["temperature_c".to_string()]);
    }

    #[test]
    fn test_without_encoder_categorical_names_are_missing() {
        let order = names(&[OCCUPANCY_FEATURE, "hour_8"]);
        let row = assembler().assemble(&monday_eight(), 10.0, None, &order, None);
        assert_relative_eq!(row.values[0], 0.1);
        assert_eq!(row.values[1], 0.0);
        assert_eq!(row.defaulted, vec!["hour_8".to_string()]);
    }

    #[test]
    fn test_layout_resolves_once() {
        let enc = OneHotEncoder::hour_and_day();
        let layout = RowLayout::new(&names(&["hour_3", "nope", "dow_sin"]), Some(&enc));
        assert_eq!(layout.width(), 3);
        assert_eq!(layout.missing(), &["nope".to_string()]);
        assert!(!layout.is_aligned());
    }

    // ==================== Report Tests ====================

    #[test]
    fn test_alignment_report_counts() {
        let mut report = AlignmentReport::default();
        assert!(report.is_clean());

        report.record(&names(&["a", "b"]));
        report.record(&names(&["a"]));

        assert!(!report.is_clean());
        assert_eq!(report.total(), 3);
        assert_eq!(report.defaulted_features()["a"], 2);
        assert_eq!(report.missing_names(), names(&["a", "b"]));
    }
}

//! Recursive multi-step rollout.
//!
//! Each step predicts one hour ahead from the last `window_size` buffer
//! entries, calibrates the output and appends it to the buffer as if it had
//! been observed. The path (hybrid feature rows or classic occupancy-only
//! input) is chosen once per call.

use chrono::{DateTime, Duration, Utc};
use ndarray::ArrayView2;

use super::calibration::Calibrator;
use super::features::{AlignmentReport, FeatureRowAssembler, RowLayout};
use super::model::{ArtifactBundle, PredictorError};
use crate::error::{ForecastError, Result};
use crate::series::SeedSeries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutPath {
    /// Full feature rows (schedule, calendar one-hot, scaled occupancy).
    Hybrid,
    /// Occupancy-only autoregression.
    Classic,
}

/// Working state of one rollout: seed tail plus every accepted prediction.
#[derive(Debug, Clone)]
pub struct RolloutBuffer {
    values: Vec<f64>,
    timestamps: Option<Vec<DateTime<Utc>>>,
}

impl RolloutBuffer {
    fn new(values: &[f64], timestamps: Option<&[DateTime<Utc>]>, capacity: usize) -> Self {
        let mut buf_values = Vec::with_capacity(capacity);
        buf_values.extend_from_slice(values);
        let buf_timestamps = timestamps.map(|ts| {
            let mut v = Vec::with_capacity(capacity);
            v.extend_from_slice(ts);
            v
        });
        Self {
            values: buf_values,
            timestamps: buf_timestamps,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Last `n` values and, when tracked, their timestamps.
    pub fn window(&self, n: usize) -> (&[f64], Option<&[DateTime<Utc>]>) {
        let from = self.values.len().saturating_sub(n);
        (
            &self.values[from..],
            self.timestamps.as_deref().map(|ts| &ts[from..]),
        )
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.as_ref().and_then(|ts| ts.last().copied())
    }

    fn next_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp().map(|ts| ts + Duration::hours(1))
    }

    fn push(&mut self, value: f64, ts: Option<DateTime<Utc>>) {
        self.values.push(value);
        if let (Some(timestamps), Some(ts)) = (self.timestamps.as_mut(), ts) {
            timestamps.push(ts);
        }
    }
}

/// Progress of a rollout after one accepted step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepProgress {
    /// 1-based step number.
    pub step: usize,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub buffer_len: usize,
    pub output_len: usize,
}

/// Output of one rollout call.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollout {
    pub path: RolloutPath,
    /// One calibrated, non-negative value per step.
    pub values: Vec<f64>,
    /// Hour of each value, when the seed carried timestamps.
    pub timestamps: Option<Vec<DateTime<Utc>>>,
    pub report: AlignmentReport,
}

impl Rollout {
    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.as_ref().and_then(|ts| ts.last().copied())
    }
}

#[derive(Debug, Clone)]
pub struct RolloutEngine {
    assembler: FeatureRowAssembler,
    calibrator: Calibrator,
    strict: bool,
}

impl RolloutEngine {
    pub fn new(assembler: FeatureRowAssembler, calibrator: Calibrator) -> Self {
        Self {
            assembler,
            calibrator,
            strict: false,
        }
    }

    /// Fail with [`ForecastError::FeatureAlignment`] instead of zero-filling.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn assembler(&self) -> &FeatureRowAssembler {
        &self.assembler
    }

    pub fn select_path(bundle: &ArtifactBundle, has_timestamps: bool) -> RolloutPath {
        if bundle.supports_hybrid() && has_timestamps {
            RolloutPath::Hybrid
        } else {
            RolloutPath::Classic
        }
    }

    pub fn rollout(
        &self,
        bundle: &ArtifactBundle,
        location: &str,
        seed_values: &[f64],
        seed_timestamps: Option<&[DateTime<Utc>]>,
        steps: usize,
    ) -> Result<Rollout> {
        self.rollout_with(bundle, location, seed_values, seed_timestamps, steps, |_| {})
    }

    /// Roll out from a validated hourly seed.
    pub fn rollout_seed(
        &self,
        bundle: &ArtifactBundle,
        location: &str,
        seed: &SeedSeries,
        steps: usize,
    ) -> Result<Rollout> {
        self.rollout(
            bundle,
            location,
            seed.values(),
            Some(seed.timestamps()),
            steps,
        )
    }

    /// Like [`Self::rollout`], reporting progress after every step.
    pub fn rollout_with(
        &self,
        bundle: &ArtifactBundle,
        location: &str,
        seed_values: &[f64],
        seed_timestamps: Option<&[DateTime<Utc>]>,
        steps: usize,
        mut on_step: impl FnMut(&StepProgress),
    ) -> Result<Rollout> {
        let window = bundle.window_size;
        if seed_values.len() < window {
            return Err(ForecastError::InsufficientData {
                needed: window,
                got: seed_values.len(),
            });
        }
        if let Some(ts) = seed_timestamps {
            validate_timestamps(ts, seed_values.len())?;
        }

        let path = Self::select_path(bundle, seed_timestamps.is_some());
        let from = seed_values.len() - window;
        let mut buffer = RolloutBuffer::new(
            &seed_values[from..],
            seed_timestamps.map(|ts| &ts[from..]),
            window + steps,
        );

        let layout = match path {
            RolloutPath::Hybrid => {
                let layout = RowLayout::new(&bundle.feature_order, bundle.encoder.as_ref());
                if !layout.is_aligned() {
                    if self.strict {
                        return Err(ForecastError::FeatureAlignment {
                            missing: layout.missing().to_vec(),
                        });
                    }
                    tracing::warn!(
                        location,
                        missing = ?layout.missing(),
                        "Feature order names unknown features; defaulting them to zero"
                    );
                }
                Some(layout)
            }
            RolloutPath::Classic => None,
        };
        let width = layout.as_ref().map_or(1, RowLayout::width);
        let capacity = self.calibrator.nominal_capacity(location);

        tracing::info!(
            location,
            ?path,
            window,
            steps,
            family = %bundle.metadata.family,
            "Starting rollout"
        );

        let mut report = AlignmentReport::default();
        let mut values = Vec::with_capacity(steps);
        let mut input = vec![0.0; window * width];

        for step in 1..=steps {
            let (win_values, win_timestamps) = buffer.window(window);

            match (&layout, win_timestamps) {
                (Some(layout), Some(win_timestamps)) => {
                    for ((row, ts), value) in input
                        .chunks_mut(width)
                        .zip(win_timestamps)
                        .zip(win_values)
                    {
                        self.assembler.fill_row(layout, ts, *value, capacity, row);
                        report.record(layout.missing());
                    }
                }
                _ => {
                    for (cell, value) in input.iter_mut().zip(win_values) {
                        *cell = bundle.scaler.as_ref().map_or(*value, |s| s.transform(*value));
                    }
                }
            }

            let view = ArrayView2::from_shape((window, width), &input).map_err(|_| {
                PredictorError::ShapeMismatch {
                    expected: (window, width),
                    got: (input.len(), 1),
                }
            })?;
            let scaled = bundle.predictor.predict(view)?;
            if !scaled.is_finite() {
                tracing::error!(location, step, scaled, "Predictor returned a non-finite value");
                return Err(PredictorError::NonFinite.into());
            }

            let next_ts = buffer.next_timestamp();
            let value = self
                .calibrator
                .calibrate(scaled, location, next_ts, bundle.scaler.as_ref())
                .max(0.0);

            buffer.push(value, next_ts);
            values.push(value);

            tracing::debug!(location, step, scaled, value, "Rollout step");
            on_step(&StepProgress {
                step,
                value,
                timestamp: next_ts,
                buffer_len: buffer.len(),
                output_len: values.len(),
            });
        }

        let timestamps = buffer
            .timestamps
            .map(|ts| ts[ts.len() - values.len()..].to_vec());

        Ok(Rollout {
            path,
            values,
            timestamps,
            report,
        })
    }
}

fn validate_timestamps(ts: &[DateTime<Utc>], n_values: usize) -> Result<()> {
    if ts.len() != n_values {
        return Err(ForecastError::InvalidSeed(format!(
            "{} timestamps for {} values",
            ts.len(),
            n_values
        )));
    }
    if let Some(pair) = ts.windows(2).find(|p| p[1] - p[0] != Duration::hours(1)) {
        return Err(ForecastError::InvalidSeed(format!(
            "expected 1h spacing between {} and {}",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::config::ScheduleConfig;
    use crate::ml::calibration::CalibrationPolicy;
    use crate::ml::model::{LinearPredictor, ModelFamily, ModelMetadata, Predictor};
    use crate::ml::preprocessing::{OccupancyScaler, OneHotEncoder};
    use crate::schedule::LibrarySchedule;

    fn manila() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn engine() -> RolloutEngine {
        let schedule = LibrarySchedule::new(&ScheduleConfig::default(), manila());
        let calibrator = Calibrator::new(manila()).with_location(
            "american_corner",
            80.0,
            CalibrationPolicy::default(),
        );
        RolloutEngine::new(FeatureRowAssembler::new(schedule), calibrator)
    }

    fn metadata() -> ModelMetadata {
        ModelMetadata {
            model_version: "v1".to_string(),
            family: ModelFamily::Lstm,
        }
    }

    fn classic_bundle(window: usize, weight: f64) -> ArtifactBundle {
        ArtifactBundle::new(
            Box::new(LinearPredictor::uniform(window, 1, weight, 0.0)),
            window,
            metadata(),
        )
    }

    fn hybrid_bundle(window: usize, order: &[&str]) -> ArtifactBundle {
        ArtifactBundle::new(
            Box::new(LinearPredictor::uniform(window, order.len(), 0.01, 0.05)),
            window,
            metadata(),
        )
        .with_encoder(OneHotEncoder::hour_and_day())
        .with_feature_order(order.iter().copied())
    }

    fn hours(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::hours(i as i64)).collect()
    }

    /// Predictor that always fails.
    #[derive(Debug)]
    struct Broken;

    impl Predictor for Broken {
        fn predict(&self, _input: ArrayView2<'_, f64>) -> std::result::Result<f64, PredictorError> {
            Err(PredictorError::NonFinite)
        }
    }

    /// Predictor that returns a fixed value without checking it.
    #[derive(Debug)]
    struct Constant(f64);

    impl Predictor for Constant {
        fn predict(&self, _input: ArrayView2<'_, f64>) -> std::result::Result<f64, PredictorError> {
            Ok(self.0)
        }
    }

    // ==================== Path Selection Tests ====================

    #[test]
    fn test_hybrid_needs_timestamps() {
        let bundle = hybrid_bundle(4, &["occupancy_scaled"]);
        assert_eq!(RolloutEngine::select_path(&bundle, true), RolloutPath::Hybrid);
        assert_eq!(RolloutEngine::select_path(&bundle, false), RolloutPath::Classic);
        assert_eq!(
            RolloutEngine::select_path(&classic_bundle(4, 0.1), true),
            RolloutPath::Classic
        );
    }

    // ==================== Classic Path Tests ====================

    #[test]
    fn test_classic_mean_predictor() {
        // Uniform 1/4 weights over scaled values = mean of the window
        let bundle = classic_bundle(4, 0.25).with_scaler(OccupancyScaler::MinMax {
            data_min: 0.0,
            data_max: 80.0,
        });
        let rollout = engine()
            .rollout(&bundle, "american_corner", &[8.0, 8.0, 8.0, 8.0], None, 3)
            .unwrap();

        assert_eq!(rollout.path, RolloutPath::Classic);
        assert_eq!(rollout.values.len(), 3);
        // 0.1 scaled -> x80 capacity, no timestamp so no multipliers
        for v in &rollout.values {
            assert_relative_eq!(*v, 8.0, epsilon = 1e-9);
        }
        assert!(rollout.timestamps.is_none());
    }

    #[test]
    fn test_only_seed_tail_is_used() {
        let bundle = classic_bundle(2, 0.5).with_scaler(OccupancyScaler::MinMax {
            data_min: 0.0,
            data_max: 80.0,
        });
        let rollout = engine()
            .rollout(&bundle, "american_corner", &[64.0, 64.0, 16.0, 16.0], None, 1)
            .unwrap();
        assert_relative_eq!(rollout.values[0], 16.0, epsilon = 1e-9);
    }

    #[test]
    fn test_classic_tracks_timestamps_when_given() {
        let bundle = classic_bundle(3, 0.0);
        let ts = hours(3);
        let rollout = engine()
            .rollout(&bundle, "american_corner", &[1.0, 2.0, 3.0], Some(&ts), 2)
            .unwrap();
        assert_eq!(rollout.path, RolloutPath::Classic);
        assert_eq!(
            rollout.timestamps.unwrap(),
            vec![ts[2] + Duration::hours(1), ts[2] + Duration::hours(2)]
        );
    }

    // ==================== Hybrid Path Tests ====================

    #[test]
    fn test_hybrid_rollout_advances_timestamps() {
        let bundle = hybrid_bundle(6, &["occupancy_scaled", "hour_sin", "hour_8", "library_open"]);
        let ts = hours(8);
        let values = vec![10.0; 8];
        let rollout = engine()
            .rollout(&bundle, "american_corner", &values, Some(&ts), 5)
            .unwrap();

        assert_eq!(rollout.path, RolloutPath::Hybrid);
        assert!(rollout.report.is_clean());
        let out_ts = rollout.timestamps.unwrap();
        assert_eq!(out_ts.len(), 5);
        assert_eq!(out_ts[0], ts[7] + Duration::hours(1));
        assert_eq!(out_ts[4], ts[7] + Duration::hours(5));
    }

    #[test]
    fn test_hybrid_reports_defaulted_features() {
        let bundle = hybrid_bundle(3, &["occupancy_scaled", "rain_mm"]);
        let rollout = engine()
            .rollout(&bundle, "american_corner", &[5.0; 3], Some(&hours(3)), 2)
            .unwrap();

        assert_eq!(rollout.values.len(), 2);
        // 3 rows per step, 2 steps
        assert_eq!(rollout.report.defaulted_features()["rain_mm"], 6);
    }

    #[test]
    fn test_strict_mode_rejects_unknown_features() {
        let bundle = hybrid_bundle(3, &["occupancy_scaled", "rain_mm"]);
        let err = engine()
            .strict(true)
            .rollout(&bundle, "american_corner", &[5.0; 3], Some(&hours(3)), 2)
            .unwrap_err();
        assert!(matches!(err, ForecastError::FeatureAlignment { missing } if missing == vec!["rain_mm".to_string()]));
    }

    // ==================== Error Tests ====================

    #[test]
    fn test_short_seed_is_insufficient_data() {
        let err = engine()
            .rollout(&classic_bundle(24, 0.01), "american_corner", &[1.0; 10], None, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientData { needed: 24, got: 10 }
        ));
    }

    #[test]
    fn test_irregular_timestamps_rejected() {
        let mut ts = hours(3);
        ts[2] += Duration::hours(1);
        let err = engine()
            .rollout(&classic_bundle(3, 0.01), "american_corner", &[1.0; 3], Some(&ts), 1)
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidSeed(_)));
    }

    #[test]
    fn test_predictor_failure_propagates() {
        let bundle = ArtifactBundle::new(Box::new(Broken), 2, metadata());
        let err = engine()
            .rollout(&bundle, "american_corner", &[1.0, 2.0], None, 3)
            .unwrap_err();
        assert!(matches!(err, ForecastError::Predictor(PredictorError::NonFinite)));
    }

    #[test]
    fn test_non_finite_output_is_fatal() {
        for raw in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let bundle = ArtifactBundle::new(Box::new(Constant(raw)), 2, metadata());
            let err = engine()
                .rollout(&bundle, "american_corner", &[1.0, 2.0], Some(&hours(2)), 2)
                .unwrap_err();
            assert!(
                matches!(err, ForecastError::Predictor(PredictorError::NonFinite)),
                "{raw} produced {err:?}"
            );
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_zero_steps_is_empty() {
        let rollout = engine()
            .rollout(&classic_bundle(2, 0.1), "american_corner", &[1.0, 2.0], None, 0)
            .unwrap();
        assert!(rollout.values.is_empty());
    }

    // ==================== Property-Based Tests ====================

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn rollout_returns_steps_non_negative_values(
                seed in prop::collection::vec(0.0f64..300.0, 6..30),
                weight in -1.0f64..1.0,
                intercept in -1.0f64..1.0,
                steps in 0usize..40,
            ) {
                let bundle = ArtifactBundle::new(
                    Box::new(LinearPredictor::uniform(6, 1, weight, intercept)),
                    6,
                    metadata(),
                )
                .with_scaler(OccupancyScaler::MinMax { data_min: 0.0, data_max: 80.0 });
                let ts = hours(seed.len());
                let rollout = engine()
                    .rollout(&bundle, "american_corner", &seed, Some(&ts), steps)
                    .unwrap();
                prop_assert_eq!(rollout.values.len(), steps);
                prop_assert!(rollout.values.iter().all(|v| *v >= 0.0));
            }

            #[test]
            fn buffer_grows_by_one_per_step(steps in 1usize..30) {
                let bundle = hybrid_bundle(4, &["occupancy_scaled", "dow_cos"]);
                let mut progress = Vec::new();
                engine()
                    .rollout_with(&bundle, "american_corner", &[3.0; 4], Some(&hours(4)), steps, |p| {
                        progress.push(*p)
                    })
                    .unwrap();

                prop_assert_eq!(progress.len(), steps);
                for (i, p) in progress.iter().enumerate() {
                    prop_assert_eq!(p.step, i + 1);
                    prop_assert_eq!(p.buffer_len, 4 + i + 1);
                    prop_assert_eq!(p.output_len, i + 1);
                }
            }
        }
    }
}

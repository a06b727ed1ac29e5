//! Machine learning module for occupancy forecasting
//!
//! Trained sequence models are loaded from disk as artifact bundles and rolled
//! out hour by hour from recent observations. When the history is too short or
//! too stale, requests are answered from the location's historical profile.

pub mod cache;
pub mod calibration;
pub mod confidence;
pub mod features;
pub mod model;
pub mod persistence;
pub mod preprocessing;
pub mod profile;
pub mod rollout;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::config::{AppConfig, ForecastConfig, LocationConfig};
use crate::error::{ForecastError, Result};
use crate::schedule::LibrarySchedule;
use crate::series::{GapFill, SeedSeries, floor_to_hour, hourly_corrected};
use crate::traits::{Clock, ObservationStore};

pub use cache::{ArtifactCache, ArtifactKey};
pub use calibration::{CalibrationPolicy, Calibrator};
pub use confidence::{AtForecast, DayForecast, DayHistory, ForecastMode, ForecastPoint, HistoryPoint};
pub use features::{AlignmentReport, FeatureRowAssembler};
pub use model::{ArtifactBundle, LinearPredictor, ModelFamily, Predictor};
pub use persistence::{ArtifactError, ArtifactStore};
pub use profile::{LocationProfile, ProfileCache};
pub use rollout::{Rollout, RolloutEngine, RolloutPath};

/// How a single-hour request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtPlan {
    Profile,
    Rollout {
        /// Last seed hour.
        origin: DateTime<Utc>,
        steps: usize,
        mode: ForecastMode,
    },
}

/// How a local-day request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPlan {
    Profile,
    Rollout {
        origin: DateTime<Utc>,
        steps: usize,
        mode: ForecastMode,
    },
}

/// Decide the seed origin and horizon for `target` (already hour-aligned).
pub fn plan_at(
    target: DateTime<Utc>,
    latest: Option<DateTime<Utc>>,
    settings: &ForecastConfig,
) -> AtPlan {
    let Some(latest) = latest.map(floor_to_hour) else {
        return AtPlan::Profile;
    };

    // A target at or before the newest data is predicted from the hour before it
    let origin = if target > latest {
        latest
    } else {
        target - Duration::hours(1)
    };
    let gap = (target - origin).num_hours();

    if gap > settings.seeded_gap_hours {
        return AtPlan::Profile;
    }

    AtPlan::Rollout {
        origin,
        steps: gap as usize,
        mode: mode_for_gap(gap, settings),
    }
}

/// Decide how to cover the 24 hours starting at `day_start`.
pub fn plan_day(
    day_start: DateTime<Utc>,
    latest: DateTime<Utc>,
    settings: &ForecastConfig,
) -> DayPlan {
    let seed_end = day_start - Duration::hours(1);
    let origin = floor_to_hour(latest).min(seed_end);
    let gap = (seed_end - origin).num_hours();
    let steps = gap as usize + 24;

    if steps > settings.max_rollout_steps {
        return DayPlan::Profile;
    }

    DayPlan::Rollout {
        origin,
        steps,
        mode: mode_for_gap(gap, settings),
    }
}

fn mode_for_gap(gap: i64, settings: &ForecastConfig) -> ForecastMode {
    if gap <= settings.live_gap_hours {
        ForecastMode::Live
    } else {
        ForecastMode::Seeded
    }
}

fn store_error(err: anyhow::Error) -> ForecastError {
    ForecastError::Store(format!("{err:#}"))
}

/// Host service for the rollout engine: owns the caches, the location table,
/// the observation store and the clock.
pub struct ForecastService<S, C> {
    store: S,
    clock: C,
    artifacts: ArtifactCache,
    profiles: ProfileCache,
    engine: RolloutEngine,
    locations: HashMap<String, LocationConfig>,
    settings: ForecastConfig,
    offset: FixedOffset,
}

impl<S: ObservationStore, C: Clock> ForecastService<S, C> {
    pub fn new(config: &AppConfig, artifacts: ArtifactCache, store: S, clock: C) -> anyhow::Result<Self> {
        let offset = config
            .timezone
            .offset()
            .context("timezone.utc_offset_minutes is out of range")?;

        let schedule = LibrarySchedule::new(&config.schedule, offset);
        let calibrator = Calibrator::from_locations(&config.locations, offset);
        let engine = RolloutEngine::new(FeatureRowAssembler::new(schedule), calibrator)
            .strict(config.forecast.strict_feature_alignment);

        Ok(Self {
            store,
            clock,
            artifacts,
            profiles: ProfileCache::new(),
            engine,
            locations: config.locations.clone(),
            settings: config.forecast.clone(),
            offset,
        })
    }

    /// Service reading artifacts from `config.artifacts.root`.
    pub fn from_config(config: &AppConfig, store: S, clock: C) -> anyhow::Result<Self> {
        let artifacts = ArtifactCache::new(ArtifactStore::new(config.artifacts.root.clone()));
        Self::new(config, artifacts, store, clock)
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn engine(&self) -> &RolloutEngine {
        &self.engine
    }

    pub fn settings(&self) -> &ForecastConfig {
        &self.settings
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn location_config(&self, location: &str) -> Result<&LocationConfig> {
        self.locations
            .get(location)
            .ok_or_else(|| ForecastError::UnknownLocation(location.to_string()))
    }

    pub fn bundle(
        &self,
        family: ModelFamily,
        location: &str,
        version: &str,
    ) -> Result<Arc<ArtifactBundle>> {
        let key = ArtifactKey::new(family, location, version);
        Ok(self.artifacts.get_or_load(&key)?)
    }

    fn loaded_bundle(
        &self,
        family: ModelFamily,
        location: &str,
        version: &str,
    ) -> Option<Arc<ArtifactBundle>> {
        self.artifacts
            .get(&ArtifactKey::new(family, location, version))
    }

    /// Cached (day-of-week, hour) profile over the trailing `profile_weeks`.
    pub async fn profile(&self, location: &str) -> Result<Arc<LocationProfile>> {
        let factor = self.location_config(location)?.correction_factor;
        self.profiles
            .get_or_build(location, move || async move {
                let end = self.clock.now_utc();
                let start = end - Duration::weeks(self.settings.profile_weeks);
                let observations = self
                    .store
                    .observations(location, start, end)
                    .await
                    .map_err(store_error)?;

                tracing::info!(
                    location,
                    observations = observations.len(),
                    weeks = self.settings.profile_weeks,
                    "Building occupancy profile"
                );
                Ok(LocationProfile::from_observations(
                    location,
                    &observations,
                    factor,
                    self.offset,
                ))
            })
            .await
    }

    /// Drop the cached profile so the next request rebuilds it.
    pub fn invalidate_profile(&self, location: &str) {
        self.profiles.invalidate(location);
    }

    /// Roll `bundle` out from `seed`, refusing horizons above `max_rollout_steps`.
    pub fn rollout(
        &self,
        bundle: &ArtifactBundle,
        location: &str,
        seed: &SeedSeries,
        steps: usize,
    ) -> Result<Rollout> {
        let max = self.settings.max_rollout_steps;
        if steps > max {
            return Err(ForecastError::HorizonTooLong { steps, max });
        }
        self.engine.rollout_seed(bundle, location, seed, steps)
    }

    async fn latest(&self, location: &str) -> Result<Option<DateTime<Utc>>> {
        self.store
            .latest_timestamp(location)
            .await
            .map_err(store_error)
    }

    /// Seed of `window` hours ending at `origin`.
    ///
    /// Fails with `InsufficientData` when fewer than `window` hours were
    /// observed in the lookback; remaining holes are filled per `mode`.
    async fn build_seed(
        &self,
        location: &str,
        window: usize,
        origin: DateTime<Utc>,
        mode: ForecastMode,
    ) -> Result<SeedSeries> {
        let factor = self.location_config(location)?.correction_factor;
        let lookback = Duration::hours(2 * window as i64 - 1);
        let observations = self
            .store
            .observations(location, origin - lookback, origin)
            .await
            .map_err(store_error)?;

        let hourly = hourly_corrected(&observations, factor);
        if hourly.len() < window {
            return Err(ForecastError::InsufficientData {
                needed: window,
                got: hourly.len(),
            });
        }

        let start = origin - Duration::hours(window as i64 - 1);
        match mode {
            ForecastMode::Live => SeedSeries::from_hourly(start, origin, &hourly, GapFill::Zero),
            _ => {
                let profile = self.profile(location).await?;
                SeedSeries::from_hourly(start, origin, &hourly, GapFill::Profile(&profile))
            }
        }
    }

    /// Occupancy forecast for the hour containing `target`.
    pub async fn forecast_at(
        &self,
        location: &str,
        family: ModelFamily,
        version: &str,
        target: DateTime<Utc>,
    ) -> Result<AtForecast> {
        self.location_config(location)?;
        let target = floor_to_hour(target);
        let latest = self.latest(location).await?;

        let AtPlan::Rollout {
            origin,
            steps,
            mode,
        } = plan_at(target, latest, &self.settings)
        else {
            return self
                .profile_at(location, family, version, target, latest)
                .await;
        };

        let bundle = self.bundle(family, location, version)?;
        let seed = match self
            .build_seed(location, bundle.window_size, origin, mode)
            .await
        {
            Ok(seed) => seed,
            Err(err) if err.is_recoverable() => {
                tracing::info!(location, error = %err, "Falling back to profile");
                return self
                    .profile_at(location, family, version, target, latest)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let rollout = self.rollout(&bundle, location, &seed, steps)?;
        let prediction = rollout.last().unwrap_or(0.0).max(0.0).round() as i64;

        tracing::info!(location, %target, mode = mode.as_str(), steps, prediction, "Forecast ready");

        Ok(AtForecast {
            location: location.to_string(),
            prediction,
            mode,
            stale: mode.is_stale(),
            data_ts_latest: latest,
            model_family: family,
            model_version: Some(bundle.metadata.model_version.clone()),
            requested_utc: target,
            horizon_steps: steps,
            generated_at: self.clock.now_utc(),
        })
    }

    async fn profile_at(
        &self,
        location: &str,
        family: ModelFamily,
        version: &str,
        target: DateTime<Utc>,
        latest: Option<DateTime<Utc>>,
    ) -> Result<AtForecast> {
        let profile = self.profile(location).await?;
        let prediction = profile.lookup(&target);
        let model_version = self
            .loaded_bundle(family, location, version)
            .map(|bundle| bundle.metadata.model_version.clone());
        tracing::info!(location, %target, prediction, "Serving forecast from profile");

        Ok(AtForecast {
            location: location.to_string(),
            prediction,
            mode: ForecastMode::Profile,
            stale: true,
            data_ts_latest: latest,
            model_family: family,
            model_version,
            requested_utc: target,
            horizon_steps: 0,
            generated_at: self.clock.now_utc(),
        })
    }

    /// 24 banded hourly points for the local calendar day `date`.
    pub async fn forecast_day(
        &self,
        location: &str,
        family: ModelFamily,
        version: &str,
        date: NaiveDate,
    ) -> Result<DayForecast> {
        self.location_config(location)?;
        let day_start = self.local_day_start(date);
        let hours: Vec<_> = (0..24).map(|h| day_start + Duration::hours(h)).collect();
        let band = self.settings.band_fraction;

        let Some(latest) = self.latest(location).await? else {
            // Window size is only known once the bundle has been loaded
            let needed = self
                .loaded_bundle(family, location, version)
                .map_or(0, |bundle| bundle.window_size);
            return Err(ForecastError::InsufficientData { needed, got: 0 });
        };

        let (mode, values, model_version) = match plan_day(day_start, latest, &self.settings) {
            DayPlan::Profile => {
                tracing::info!(location, %date, "Day too far ahead; serving from profile");
                let profile = self.profile(location).await?;
                let values: Vec<f64> = hours.iter().map(|ts| profile.lookup(ts) as f64).collect();
                let model_version = self
                    .loaded_bundle(family, location, version)
                    .map(|bundle| bundle.metadata.model_version.clone());
                (ForecastMode::Profile, values, model_version)
            }
            DayPlan::Rollout {
                origin,
                steps,
                mode,
            } => {
                let bundle = self.bundle(family, location, version)?;
                let seed = self
                    .build_seed(location, bundle.window_size, origin, mode)
                    .await?;
                let rollout = self.rollout(&bundle, location, &seed, steps)?;
                let values = rollout.values[rollout.values.len().saturating_sub(24)..].to_vec();
                (mode, values, Some(bundle.metadata.model_version.clone()))
            }
        };

        let points = hours
            .iter()
            .zip(&values)
            .map(|(ts, value)| ForecastPoint::banded(*ts, self.offset, *value, band))
            .collect();

        tracing::info!(location, %date, mode = mode.as_str(), "Day forecast ready");

        Ok(DayForecast {
            location: location.to_string(),
            date_local: date,
            mode,
            points,
            data_ts_latest: Some(latest),
            model_family: family,
            model_version,
            generated_at: self.clock.now_utc(),
        })
    }

    /// Observed hourly counts for the local calendar day `date`.
    pub async fn history_day(&self, location: &str, date: NaiveDate) -> Result<DayHistory> {
        self.location_config(location)?;
        let start = self.local_day_start(date);
        let end = start + Duration::days(1) - Duration::seconds(1);

        let observations = self
            .store
            .observations(location, start, end)
            .await
            .map_err(store_error)?;
        let points = observations
            .into_iter()
            .map(|obs| HistoryPoint {
                time_utc: obs.ts,
                time_local: obs.ts.with_timezone(&self.offset),
                actual: i64::from(obs.wifi_clients),
            })
            .collect::<Vec<_>>();

        tracing::debug!(location, %date, points = points.len(), "Loaded day history");
        Ok(DayHistory {
            location: location.to_string(),
            date_local: date,
            points,
        })
    }

    fn local_day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let local_midnight = date.and_time(NaiveTime::MIN);
        (local_midnight - Duration::seconds(i64::from(self.offset.local_minus_utc()))).and_utc()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn settings() -> ForecastConfig {
        ForecastConfig::default()
    }

    fn at(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    // ==================== Single-Hour Plan Tests ====================

    #[test]
    fn test_plan_at_without_data_is_profile() {
        assert_eq!(plan_at(at(5), None, &settings()), AtPlan::Profile);
    }

    #[test]
    fn test_plan_at_live_gap() {
        let plan = plan_at(at(12), Some(at(10)), &settings());
        assert_eq!(
            plan,
            AtPlan::Rollout {
                origin: at(10),
                steps: 2,
                mode: ForecastMode::Live
            }
        );
    }

    #[test]
    fn test_plan_at_seeded_gap() {
        let plan = plan_at(at(13), Some(at(10)), &settings());
        assert!(matches!(
            plan,
            AtPlan::Rollout {
                steps: 3,
                mode: ForecastMode::Seeded,
                ..
            }
        ));
        assert!(matches!(
            plan_at(at(34), Some(at(10)), &settings()),
            AtPlan::Rollout { steps: 24, .. }
        ));
    }

    #[test]
    fn test_plan_at_beyond_seeded_gap_is_profile() {
        assert_eq!(plan_at(at(35), Some(at(10)), &settings()), AtPlan::Profile);
    }

    #[test]
    fn test_plan_at_past_target_predicts_from_previous_hour() {
        let plan = plan_at(at(4), Some(at(10)), &settings());
        assert_eq!(
            plan,
            AtPlan::Rollout {
                origin: at(3),
                steps: 1,
                mode: ForecastMode::Live
            }
        );
    }

    #[test]
    fn test_plan_at_floors_latest() {
        let latest = at(10) + Duration::minutes(40);
        assert!(matches!(
            plan_at(at(11), Some(latest), &settings()),
            AtPlan::Rollout { origin, steps: 1, .. } if origin == at(10)
        ));
    }

    // ==================== Day Plan Tests ====================

    #[test]
    fn test_plan_day_with_fresh_data() {
        // Data up to the hour before midnight
        let plan = plan_day(at(24), at(23), &settings());
        assert_eq!(
            plan,
            DayPlan::Rollout {
                origin: at(23),
                steps: 24,
                mode: ForecastMode::Live
            }
        );
    }

    #[test]
    fn test_plan_day_past_day_seeds_before_midnight() {
        let plan = plan_day(at(0), at(100), &settings());
        assert_eq!(
            plan,
            DayPlan::Rollout {
                origin: at(-1),
                steps: 24,
                mode: ForecastMode::Live
            }
        );
    }

    #[test]
    fn test_plan_day_stale_data_is_seeded() {
        let plan = plan_day(at(48), at(20), &settings());
        assert_eq!(
            plan,
            DayPlan::Rollout {
                origin: at(20),
                steps: 27 + 24,
                mode: ForecastMode::Seeded
            }
        );
    }

    #[test]
    fn test_plan_day_beyond_max_steps_is_profile() {
        let mut settings = settings();
        settings.max_rollout_steps = 48;
        assert!(matches!(plan_day(at(48), at(20), &settings), DayPlan::Profile));
        assert!(matches!(plan_day(at(24), at(23), &settings), DayPlan::Rollout { .. }));
    }
}

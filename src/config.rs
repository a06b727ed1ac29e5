use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::ml::calibration::CalibrationPolicy;

/// Location table and schedule windows shipped with the binary.
const DEFAULT_TABLES: &str = include_str!("defaults.toml");

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub artifacts: ArtifactsConfig,
    pub forecast: ForecastConfig,
    pub timezone: TimezoneConfig,
    pub schedule: ScheduleConfig,
    pub locations: HashMap<String, LocationConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    pub root: PathBuf,
    pub default_family: String,
    pub default_version: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            default_family: "cnn_lstm_attn".to_string(),
            default_version: "v1".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastConfig {
    /// Largest gap (hours) between the last observation and the target that
    /// still counts as a live rollout.
    pub live_gap_hours: i64,
    /// Largest gap (hours) served by a profile-seeded rollout.
    pub seeded_gap_hours: i64,
    /// Hard ceiling on rollout steps for a single request (90 days hourly).
    pub max_rollout_steps: usize,
    /// Half-width of the lo/hi band around each daily point.
    pub band_fraction: f64,
    /// Trailing window used to build location profiles.
    pub profile_weeks: i64,
    /// Fail instead of zero-filling when a named feature cannot be assembled.
    pub strict_feature_alignment: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            live_gap_hours: 2,
            seeded_gap_hours: 24,
            max_rollout_steps: 24 * 90,
            band_fraction: 0.15,
            profile_weeks: 8,
            strict_feature_alignment: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimezoneConfig {
    /// Fixed offset of the local civil calendar, in minutes east of UTC.
    pub utc_offset_minutes: i32,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 8 * 60,
        }
    }
}

impl TimezoneConfig {
    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    pub weekday: ScheduleHours,
    pub saturday: ScheduleHours,
    pub sunday: ScheduleHours,
    pub class_hours: ScheduleHours,
    pub activity_days: Vec<u32>,
    pub activity_hours: ScheduleHours,
    pub morning_peak: ScheduleHours,
    pub afternoon_peak: ScheduleHours,
    pub evening_peak: ScheduleHours,
    pub saturday_peak: ScheduleHours,
    /// Study-intensity weight per day, Monday first.
    pub day_weights: Vec<f64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            weekday: ScheduleHours::new(7, 20),
            saturday: ScheduleHours::new(7, 12),
            sunday: ScheduleHours::new(0, 0),
            class_hours: ScheduleHours::new(7, 22),
            activity_days: vec![0, 2],
            activity_hours: ScheduleHours::new(15, 18),
            morning_peak: ScheduleHours::new(8, 11),
            afternoon_peak: ScheduleHours::new(13, 16),
            evening_peak: ScheduleHours::new(18, 20),
            saturday_peak: ScheduleHours::new(9, 12),
            day_weights: vec![1.2, 1.0, 1.2, 1.0, 0.8, 0.5, 0.5],
        }
    }
}

/// Half-open hour window `[open_hour, close_hour)`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHours {
    pub open_hour: u32,
    pub close_hour: u32,
}

impl ScheduleHours {
    pub const fn new(open_hour: u32, close_hour: u32) -> Self {
        Self {
            open_hour,
            close_hour,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        (self.open_hour..self.close_hour).contains(&hour)
    }
}

/// Per-location entry of the capacity table.
#[derive(Debug, Deserialize, Clone)]
pub struct LocationConfig {
    /// Nominal physical capacity (people).
    pub capacity: u32,
    /// Multiplier turning raw Wi-Fi client counts into occupancy.
    #[serde(default = "default_correction_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub calibration: CalibrationPolicy,
}

fn default_correction_factor() -> f64 {
    1.0
}

impl LocationConfig {
    pub fn new(capacity: u32, correction_factor: f64) -> Self {
        Self {
            capacity,
            correction_factor,
            calibration: CalibrationPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("occupancy-forecast");

        let mut builder = Config::builder()
            // 1. Built-in defaults
            .set_default("artifacts.root", "artifacts")?
            .set_default("artifacts.default_family", "cnn_lstm_attn")?
            .set_default("artifacts.default_version", "v1")?
            .set_default("forecast.live_gap_hours", 2)?
            .set_default("forecast.seeded_gap_hours", 24)?
            .set_default("forecast.max_rollout_steps", 24 * 90)?
            .set_default("forecast.band_fraction", 0.15)?
            .set_default("forecast.profile_weeks", 8)?
            .set_default("forecast.strict_feature_alignment", false)?
            .set_default("timezone.utc_offset_minutes", 8 * 60)?
            // Schedule windows and the location table
            .add_source(File::from_str(DEFAULT_TABLES, FileFormat::Toml));

        // Database is optional: only the forecasting commands need it
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_default("database.url", url)?;
        }

        let builder = builder
            // 2. Load from local config file (optional)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))
            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            // 4. Environment variables (OCCUPANCY__FORECAST__BAND_FRACTION=...)
            .add_source(Environment::with_prefix("OCCUPANCY").separator("__"));

        let s = builder.build().context("Failed to build configuration")?;
        let config: Self = s
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if config.timezone.offset().is_none() {
            anyhow::bail!(
                "timezone.utc_offset_minutes out of range: {}",
                config.timezone.utc_offset_minutes
            );
        }

        Ok(config)
    }

    /// Database URL, required by commands that read observations.
    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("DATABASE_URL must be set (via .env file or environment variable)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::calibration::{CapRule, ScalingMode};

    // ==================== Default Value Tests ====================

    #[test]
    fn test_forecast_config_defaults() {
        let config = ForecastConfig::default();
        assert_eq!(config.live_gap_hours, 2);
        assert_eq!(config.seeded_gap_hours, 24);
        assert_eq!(config.max_rollout_steps, 2160);
        assert_eq!(config.band_fraction, 0.15);
        assert_eq!(config.profile_weeks, 8);
        assert!(!config.strict_feature_alignment);
    }

    #[test]
    fn test_timezone_defaults_to_plus_eight() {
        let tz = TimezoneConfig::default();
        assert_eq!(tz.offset().unwrap().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn test_timezone_out_of_range() {
        let tz = TimezoneConfig {
            utc_offset_minutes: 25 * 60,
        };
        assert!(tz.offset().is_none());
    }

    #[test]
    fn test_schedule_config_defaults() {
        let config = ScheduleConfig::default();
        assert_eq!(config.weekday, ScheduleHours::new(7, 20));
        assert_eq!(config.saturday, ScheduleHours::new(7, 12));
        assert_eq!(config.sunday, ScheduleHours::new(0, 0));
        assert_eq!(config.activity_days, vec![0, 2]);
        assert_eq!(config.day_weights.len(), 7);
    }

    #[test]
    fn test_schedule_hours_contains_is_half_open() {
        let hours = ScheduleHours::new(7, 20);
        assert!(!hours.contains(6));
        assert!(hours.contains(7));
        assert!(hours.contains(19));
        assert!(!hours.contains(20));
    }

    #[test]
    fn test_empty_window_contains_nothing() {
        let closed = ScheduleHours::new(0, 0);
        assert!((0..24).all(|h| !closed.contains(h)));
    }

    // ==================== Config Loading Tests ====================

    #[test]
    fn test_config_load_with_defaults() {
        let result = AppConfig::load();
        assert!(result.is_ok(), "{:?}", result.err());
    }

    #[test]
    fn test_loaded_config_has_location_table() {
        let config = AppConfig::load().expect("Config should load");

        let second = &config.locations["gisbert_2nd_floor"];
        assert_eq!(second.capacity, 250);
        assert_eq!(second.correction_factor, 8.0);
        assert_eq!(second.calibration, CalibrationPolicy::default());

        let miguel = &config.locations["miguel_pro"];
        assert_eq!(miguel.capacity, 500);
        assert_eq!(miguel.calibration.effective_capacity, Some(80.0));
        assert_eq!(miguel.calibration.general_cap, CapRule::Absolute(150.0));
        assert_eq!(miguel.calibration.final_cap, CapRule::Absolute(120.0));
        assert_eq!(miguel.calibration.overrides.len(), 2);

        let third = &config.locations["gisbert_3rd_floor"];
        assert_eq!(third.calibration.mode, ScalingMode::InverseScaler);
        assert_eq!(third.calibration.final_cap, CapRule::Unbounded);
    }

    #[test]
    fn test_loaded_schedule_matches_defaults() {
        let config = AppConfig::load().expect("Config should load");
        let defaults = ScheduleConfig::default();

        assert_eq!(config.schedule.weekday, defaults.weekday);
        assert_eq!(config.schedule.class_hours, defaults.class_hours);
        assert_eq!(config.schedule.day_weights, defaults.day_weights);
    }

    #[test]
    fn test_database_url_missing_is_an_error() {
        let config = AppConfig {
            database: DatabaseConfig { url: None },
            artifacts: ArtifactsConfig::default(),
            forecast: ForecastConfig::default(),
            timezone: TimezoneConfig::default(),
            schedule: ScheduleConfig::default(),
            locations: HashMap::new(),
        };
        assert!(config.database_url().is_err());
    }

    // ==================== Environment Variable Override Tests ====================

    /// Helper to set and remove an environment variable around a closure.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        // SAFETY: Test environment, variables are unique per test
        unsafe {
            std::env::set_var(key, value);
        }
        let result = f();
        unsafe {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_env_var_overrides_band_fraction() {
        let config = with_env_var("OCCUPANCY__FORECAST__BAND_FRACTION", "0.25", || {
            AppConfig::load().expect("Config should load")
        });

        assert_eq!(config.forecast.band_fraction, 0.25);
    }

    #[test]
    fn test_env_var_overrides_artifact_family() {
        let config = with_env_var("OCCUPANCY__ARTIFACTS__DEFAULT_FAMILY", "lstm", || {
            AppConfig::load().expect("Config should load")
        });

        assert_eq!(config.artifacts.default_family, "lstm");
    }
}

//! Forecast result types and fixed-percentage bands

use std::io;
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use super::model::ModelFamily;

/// How stale the seed was when a forecast was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMode {
    /// Rollout seeded from recent observations (small gaps zero-filled)
    Live,
    /// Rollout seeded from observations with gaps filled from the profile
    Seeded,
    /// Historical (day-of-week, hour) mean, no model involved
    Profile,
}

impl ForecastMode {
    pub fn is_stale(&self) -> bool {
        !matches!(self, ForecastMode::Live)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastMode::Live => "live",
            ForecastMode::Seeded => "seeded",
            ForecastMode::Profile => "profile",
        }
    }
}

/// One hourly point of a day forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub time_utc: DateTime<Utc>,
    pub time_local: DateTime<FixedOffset>,
    pub predicted: i64,
    pub lo: i64,
    pub hi: i64,
}

impl ForecastPoint {
    /// Point with `lo = max(0, round((1 - band) x))`, `hi = round((1 + band) x)`.
    pub fn banded(time_utc: DateTime<Utc>, offset: FixedOffset, value: f64, band: f64) -> Self {
        let value = value.max(0.0);
        Self {
            time_utc,
            time_local: time_utc.with_timezone(&offset),
            predicted: value.round() as i64,
            lo: (value * (1.0 - band)).round().max(0.0) as i64,
            hi: (value * (1.0 + band)).round() as i64,
        }
    }

    pub fn interval_width(&self) -> i64 {
        self.hi - self.lo
    }
}

/// Result of a single-hour forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtForecast {
    pub location: String,
    pub prediction: i64,
    pub mode: ForecastMode,
    pub stale: bool,
    pub data_ts_latest: Option<DateTime<Utc>>,
    pub model_family: ModelFamily,
    /// Version from the bundle's metadata; absent for profile answers
    /// served before any bundle was loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub requested_utc: DateTime<Utc>,
    /// Rollout steps taken (0 for profile answers)
    pub horizon_steps: usize,
    pub generated_at: DateTime<Utc>,
}

/// Result of a 24-hour local-day forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayForecast {
    pub location: String,
    pub date_local: NaiveDate,
    pub mode: ForecastMode,
    pub points: Vec<ForecastPoint>,
    pub data_ts_latest: Option<DateTime<Utc>>,
    pub model_family: ModelFamily,
    /// Version from the bundle's metadata; absent for profile answers
    /// served before any bundle was loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Observed count for one hour, for overlaying on a forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub time_utc: DateTime<Utc>,
    pub time_local: DateTime<FixedOffset>,
    pub actual: i64,
}

/// Raw observations for one local day, oldest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayHistory {
    pub location: String,
    pub date_local: NaiveDate,
    pub points: Vec<HistoryPoint>,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    location: &'a str,
    time_local: String,
    time_utc: String,
    predicted: i64,
    lo: i64,
    hi: i64,
    mode: &'static str,
}

impl DayForecast {
    /// Peak predicted point of the day
    pub fn peak(&self) -> Option<&ForecastPoint> {
        self.points.iter().max_by_key(|p| p.predicted)
    }

    /// Write points as CSV rows.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        for point in &self.points {
            wtr.serialize(CsvRow {
                location: &self.location,
                time_local: point.time_local.to_rfc3339(),
                time_utc: point.time_utc.to_rfc3339(),
                predicted: point.predicted,
                lo: point.lo,
                hi: point.hi,
                mode: self.mode.as_str(),
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<(), csv::Error> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)
    }
}

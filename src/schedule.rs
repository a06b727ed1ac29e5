//! Deterministic calendar and operating-schedule features.
//!
//! Every feature depends only on the local hour-of-day and day-of-week, so the
//! deriver is a pure function of the timestamp.

use std::f64::consts::PI;

use anyhow::{Context, Result};
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};

use crate::config::{ScheduleConfig, ScheduleHours};

const SATURDAY: u32 = 5;
const SUNDAY: u32 = 6;

/// Schedule features for one local hour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleFeatures {
    pub hour: u32,
    /// Monday = 0.
    pub day_of_week: u32,
    pub is_weekend: f64,
    pub is_sunday: f64,
    pub library_open: f64,
    pub class_hours: f64,
    pub activity_period: f64,
    pub morning_peak: f64,
    pub afternoon_peak: f64,
    pub evening_peak: f64,
    // Reserved in the model schema; no academic calendar is wired in yet.
    pub is_holiday: f64,
    pub is_preliminary: f64,
    pub study_intensity: f64,
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub dow_sin: f64,
    pub dow_cos: f64,
}

impl ScheduleFeatures {
    /// Number of numeric features exposed by [`Self::values`].
    pub const NUM_FEATURES: usize = 15;

    /// Feature names, in the order of [`Self::values`].
    pub const NAMES: [&'static str; Self::NUM_FEATURES] = [
        "is_weekend",
        "is_sunday",
        "library_open",
        "class_hours",
        "activity_period",
        "morning_peak",
        "afternoon_peak",
        "evening_peak",
        "is_holiday",
        "is_preliminary",
        "study_intensity",
        "hour_sin",
        "hour_cos",
        "dow_sin",
        "dow_cos",
    ];

    pub fn values(&self) -> [f64; Self::NUM_FEATURES] {
        [
            self.is_weekend,
            self.is_sunday,
            self.library_open,
            self.class_hours,
            self.activity_period,
            self.morning_peak,
            self.afternoon_peak,
            self.evening_peak,
            self.is_holiday,
            self.is_preliminary,
            self.study_intensity,
            self.hour_sin,
            self.hour_cos,
            self.dow_sin,
            self.dow_cos,
        ]
    }

    /// Numeric features keyed by the names the models were trained with.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        Self::NAMES.into_iter().zip(self.values())
    }

    /// Position of a named feature in [`Self::values`].
    pub fn index_of(name: &str) -> Option<usize> {
        Self::NAMES.iter().position(|n| *n == name)
    }
}

/// Library operating schedule in a fixed local timezone.
#[derive(Debug, Clone)]
pub struct LibrarySchedule {
    config: ScheduleConfig,
    offset: FixedOffset,
}

impl LibrarySchedule {
    pub fn new(config: &ScheduleConfig, offset: FixedOffset) -> Self {
        Self {
            config: config.clone(),
            offset,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn to_local(&self, ts: &DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset)
    }

    fn open_hours(&self, dow: u32) -> ScheduleHours {
        match dow {
            SATURDAY => self.config.saturday,
            SUNDAY => self.config.sunday,
            _ => self.config.weekday,
        }
    }

    /// Check if the library is open at the given local time.
    pub fn is_open(&self, time: &DateTime<FixedOffset>) -> bool {
        let dow = time.weekday().num_days_from_monday();
        self.open_hours(dow).contains(time.hour())
    }

    /// Derive schedule features for a local timestamp.
    pub fn derive(&self, time: &DateTime<FixedOffset>) -> ScheduleFeatures {
        let hour = time.hour();
        let dow = time.weekday().num_days_from_monday();
        let weekday = dow < SATURDAY;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let library_open = flag(self.open_hours(dow).contains(hour));
        let class_hours = flag(weekday && self.config.class_hours.contains(hour));
        let activity_period = flag(
            self.config.activity_days.contains(&dow) && self.config.activity_hours.contains(hour),
        );

        let (morning_peak, afternoon_peak, evening_peak) = if weekday {
            (
                flag(self.config.morning_peak.contains(hour)),
                flag(self.config.afternoon_peak.contains(hour)),
                flag(self.config.evening_peak.contains(hour)),
            )
        } else if dow == SATURDAY {
            (flag(self.config.saturday_peak.contains(hour)), 0.0, 0.0)
        } else {
            (0.0, 0.0, 0.0)
        };

        let is_holiday = 0.0;
        let is_preliminary = 0.0;
        let day_weight = self
            .config
            .day_weights
            .get(dow as usize)
            .copied()
            .unwrap_or(1.0);
        let study_intensity = library_open
            * (class_hours + activity_period + (1.0 - is_holiday) + (1.0 - is_preliminary))
            * day_weight;

        let (hour_sin, hour_cos) = cyclical_encode(hour as f64, 24.0);
        let (dow_sin, dow_cos) = cyclical_encode(dow as f64, 7.0);

        ScheduleFeatures {
            hour,
            day_of_week: dow,
            is_weekend: flag(!weekday),
            is_sunday: flag(dow == SUNDAY),
            library_open,
            class_hours,
            activity_period,
            morning_peak,
            afternoon_peak,
            evening_peak,
            is_holiday,
            is_preliminary,
            study_intensity,
            hour_sin,
            hour_cos,
            dow_sin,
            dow_cos,
        }
    }

    /// Derive schedule features for a UTC timestamp.
    pub fn derive_utc(&self, ts: &DateTime<Utc>) -> ScheduleFeatures {
        self.derive(&self.to_local(ts))
    }

    /// UTC instant of local midnight starting `date`.
    pub fn local_midnight_utc(&self, date: NaiveDate) -> Result<DateTime<Utc>> {
        let naive = date.and_hms_opt(0, 0, 0).context("invalid midnight")?;
        self.local_to_utc(naive)
    }

    /// Interpret a naive local datetime in the schedule's timezone.
    pub fn local_to_utc(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("Local time {naive} is not representable"))
    }
}

/// Encode a cyclical value as (sin, cos).
pub fn cyclical_encode(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

/// Parse `YYYY-MM-DDTHH:MM` (or with seconds) as a naive local datetime.
pub fn parse_local_datetime(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .with_context(|| format!("Invalid local datetime '{s}', expected YYYY-MM-DDTHH:MM"))
}

pub fn parse_local_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}', expected YYYY-MM-DD"))
}

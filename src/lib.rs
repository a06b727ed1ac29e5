//! Occupancy Forecast Library
//!
//! Recursive multi-step occupancy forecasting for library floors: schedule
//! features, artifact loading, calibrated rollouts and the profile fallback.

pub mod config;
pub mod db;
pub mod error;
pub mod ml;
pub mod schedule;
pub mod series;
pub mod traits;

// Re-export commonly used types
pub use config::{AppConfig, ForecastConfig, LocationConfig, ScheduleConfig};
pub use db::{Database, Observation};
pub use error::{ForecastError, Result};
pub use ml::{
    ArtifactBundle, ArtifactCache, ArtifactKey, ArtifactStore, AtForecast, DayForecast,
    DayHistory, ForecastMode, ForecastPoint, ForecastService, ModelFamily, Rollout, RolloutEngine,
    RolloutPath,
};
pub use schedule::{LibrarySchedule, ScheduleFeatures};
pub use series::{GapFill, SeedSeries};
pub use traits::{Clock, MemoryStore, MockClock, ObservationStore, SystemClock};

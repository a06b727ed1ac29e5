//! Occupancy scaler and categorical encoder shipped with each artifact bundle.

use serde::{Deserialize, Serialize};

/// Learned affine scaler for the occupancy column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OccupancyScaler {
    MinMax { data_min: f64, data_max: f64 },
    Standard { mean: f64, std_dev: f64 },
}

impl OccupancyScaler {
    fn span(&self) -> f64 {
        let span = match self {
            OccupancyScaler::MinMax { data_min, data_max } => data_max - data_min,
            OccupancyScaler::Standard { std_dev, .. } => *std_dev,
        };
        // A constant training column collapses to zero span; treat it as unit
        if span.abs() < f64::EPSILON { 1.0 } else { span }
    }

    fn center(&self) -> f64 {
        match self {
            OccupancyScaler::MinMax { data_min, .. } => *data_min,
            OccupancyScaler::Standard { mean, .. } => *mean,
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.center()) / self.span()
    }

    pub fn inverse_transform(&self, scaled: f64) -> f64 {
        scaled * self.span() + self.center()
    }
}

/// One-hot encoder over integer calendar inputs (hour, day of week).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    /// Names of the encoder's input columns, in order.
    #[serde(default)]
    pub input_names: Vec<String>,
    /// Known categories for each input column.
    pub categories: Vec<Vec<i64>>,
}

/// Calendar input an encoder column is fed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CalendarInput {
    Hour,
    DayOfWeek,
    Unknown,
}

impl CalendarInput {
    fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "hour" | "hr" => CalendarInput::Hour,
            "day_of_week" | "dow" | "weekday" => CalendarInput::DayOfWeek,
            _ => CalendarInput::Unknown,
        }
    }
}

impl OneHotEncoder {
    pub fn new(input_names: Vec<String>, categories: Vec<Vec<i64>>) -> Self {
        Self {
            input_names,
            categories,
        }
    }

    /// Encoder over hours 0..24 and days 0..7, the usual training layout.
    pub fn hour_and_day() -> Self {
        Self::new(
            vec!["hour".to_string(), "day_of_week".to_string()],
            vec![(0..24).collect(), (0..7).collect()],
        )
    }

    /// Input names, falling back to `hour`/`day_of_week` when none were saved.
    pub fn inputs(&self) -> Vec<String> {
        if self.input_names.is_empty() {
            vec!["hour".to_string(), "day_of_week".to_string()]
        } else {
            self.input_names.clone()
        }
    }

    /// Number of output columns.
    pub fn width(&self) -> usize {
        self.categories.iter().map(Vec::len).sum()
    }

    /// Output column names, `<input>_<category>`.
    pub fn feature_names_out(&self) -> Vec<String> {
        self.inputs()
            .iter()
            .zip(&self.categories)
            .flat_map(|(name, cats)| cats.iter().map(move |c| format!("{name}_{c}")))
            .collect()
    }

    /// One-hot encode raw input values. Categories not seen in training
    /// produce an all-zero block for that input.
    pub fn transform(&self, values: &[i64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.width());
        for (i, cats) in self.categories.iter().enumerate() {
            let value = values.get(i).copied();
            out.extend(cats.iter().map(|c| if Some(*c) == value { 1.0 } else { 0.0 }));
        }
        out
    }

    /// Encode a local (hour, day-of-week) pair. Inputs whose name is not a
    /// recognised calendar field are fed 0.
    pub fn encode(&self, hour: u32, day_of_week: u32) -> Vec<f64> {
        let values: Vec<i64> = self
            .inputs()
            .iter()
            .map(|name| match CalendarInput::from_name(name) {
                CalendarInput::Hour => i64::from(hour),
                CalendarInput::DayOfWeek => i64::from(day_of_week),
                CalendarInput::Unknown => 0,
            })
            .collect();
        self.transform(&values)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    // ==================== Scaler Tests ====================

    #[test]
    fn test_minmax_round_trip() {
        let scaler = OccupancyScaler::MinMax {
            data_min: 0.0,
            data_max: 200.0,
        };
        assert_relative_eq!(scaler.transform(50.0), 0.25);
        assert_relative_eq!(scaler.inverse_transform(0.25), 50.0);
    }

    #[test]
    fn test_standard_inverse() {
        let scaler = OccupancyScaler::Standard {
            mean: 30.0,
            std_dev: 10.0,
        };
        assert_relative_eq!(scaler.inverse_transform(1.5), 45.0);
        assert_relative_eq!(scaler.transform(20.0), -1.0);
    }

    #[test]
    fn test_degenerate_scaler_does_not_divide_by_zero() {
        let scaler = OccupancyScaler::MinMax {
            data_min: 5.0,
            data_max: 5.0,
        };
        assert!(scaler.transform(10.0).is_finite());
    }

    #[test]
    fn test_scaler_json_is_tagged() {
        let scaler: OccupancyScaler =
            serde_json::from_str(r#"{"kind":"min_max","data_min":0.0,"data_max":80.0}"#).unwrap();
        assert_eq!(
            scaler,
            OccupancyScaler::MinMax {
                data_min: 0.0,
                data_max: 80.0
            }
        );
    }

    // ==================== Encoder Tests ====================

    #[test]
    fn test_feature_names_out() {
        let enc = OneHotEncoder::new(
            vec!["hour".to_string(), "day_of_week".to_string()],
            vec![vec![7, 8], vec![0, 1, 2]],
        );
        assert_eq!(
            enc.feature_names_out(),
            vec![
                "hour_7",
                "hour_8",
                "day_of_week_0",
                "day_of_week_1",
                "day_of_week_2"
            ]
        );
    }

    #[test]
    fn test_encode_sets_matching_columns() {
        let enc = OneHotEncoder::hour_and_day();
        let row = enc.encode(8, 2);
        assert_eq!(row.len(), 31);
        assert_eq!(row[8], 1.0);
        assert_eq!(row[24 + 2], 1.0);
        assert_eq!(row.iter().sum::<f64>(), 2.0);
    }

    #[test]
    fn test_encode_accepts_aliases() {
        let enc = OneHotEncoder::new(
            vec!["HR".to_string(), "weekday".to_string()],
            vec![(0..24).collect(), (0..7).collect()],
        );
        let row = enc.encode(23, 6);
        assert_eq!(row[23], 1.0);
        assert_eq!(row[24 + 6], 1.0);
    }

    #[test]
    fn test_unknown_input_is_fed_zero() {
        let enc = OneHotEncoder::new(
            vec!["hour".to_string(), "term_week".to_string()],
            vec![(0..24).collect(), vec![0, 1]],
        );
        let row = enc.encode(5, 3);
        assert_eq!(row[5], 1.0);
        // term_week receives 0, which is a known category
        assert_eq!(&row[24..], &[1.0, 0.0]);
    }

    #[test]
    fn test_unseen_category_is_all_zero() {
        let enc = OneHotEncoder::new(vec!["hour".to_string()], vec![vec![8, 9, 10]]);
        assert_eq!(enc.encode(3, 0), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_input_names_default_to_calendar() {
        let enc = OneHotEncoder::new(vec![], vec![vec![0, 1], vec![0, 1]]);
        assert_eq!(enc.feature_names_out()[2], "day_of_week_0");
        assert_eq!(enc.encode(1, 0), vec![0.0, 1.0, 1.0, 0.0]);
    }
}

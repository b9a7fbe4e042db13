//! Economic time-series payloads and consumer-side processing.
//!
//! The realtime channel delivers series payloads untouched, including
//! observations whose value is missing (`"."` in FRED data) or not a number.
//! Filtering, ordering and smoothing happen here, on the consumer side.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Date format used by observation dates.
pub const OBSERVATION_DATE_FORMAT: &str = "%Y-%m-%d";

/// Window of the dashboard's moving average.
pub const DEFAULT_MOVING_AVERAGE_WINDOW: usize = 5;

// ============================================================================
// Observations
// ============================================================================

/// A single raw observation as sent by the server.
///
/// `value` is usually a string but numbers are tolerated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Observation {
    pub fn new(date: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            value: serde_json::Value::String(value.into()),
        }
    }

    /// Returns the value as a finite number, if it is one.
    pub fn numeric_value(&self) -> Option<f64> {
        let value = match &self.value {
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
            serde_json::Value::Number(n) => n.as_f64()?,
            _ => return None,
        };
        value.is_finite().then_some(value)
    }

    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date.trim(), OBSERVATION_DATE_FORMAT).ok()
    }
}

/// A validated, plottable data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

// ============================================================================
// Series Data
// ============================================================================

/// Payload of a `series_data` frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    pub observations: Vec<Observation>,
    /// Server-side explanation when no usable data exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SeriesData {
    /// Valid numeric points ordered by date, oldest first.
    ///
    /// Observations with an unparseable date or value are skipped.
    pub fn points(&self) -> Vec<SeriesPoint> {
        let mut points: Vec<SeriesPoint> = self
            .observations
            .iter()
            .filter_map(|obs| {
                Some(SeriesPoint {
                    date: obs.parsed_date()?,
                    value: obs.numeric_value()?,
                })
            })
            .collect();
        points.sort_by_key(|p| p.date);
        points
    }

    /// Number of observations that did not yield a point.
    pub fn skipped_count(&self) -> usize {
        self.observations.len().saturating_sub(self.points().len())
    }
}

/// Keeps points no older than `days` before `today`.
///
/// Points dated after `today` are kept.
pub fn within_days(points: &[SeriesPoint], days: u32, today: NaiveDate) -> Vec<SeriesPoint> {
    points
        .iter()
        .filter(|p| (today - p.date).num_days() <= i64::from(days))
        .copied()
        .collect()
}

/// Moving average over `window` points, one value per input point.
///
/// The window for point `i` starts at `i - window / 2` and is clamped to the
/// series bounds, so values near the end average fewer points.
pub fn moving_average(points: &[SeriesPoint], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let len = points.len();

    (0..len)
        .map(|index| {
            let start = index.saturating_sub(window / 2);
            let end = len.min(start + window);
            let slice = points.get(start..end).unwrap_or_default();
            if slice.is_empty() {
                return 0.0;
            }
            slice.iter().map(|p| p.value).sum::<f64>() / slice.len() as f64
        })
        .collect()
}

// ============================================================================
// Search Results
// ============================================================================

/// One series returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesSummary {
    pub id: String,
    pub title: String,
    pub frequency: String,
}

/// Payload of a `search_results` frame.
///
/// Servers send either a bare list or FRED's `{count, series}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResults {
    List(Vec<SeriesSummary>),
    Paged {
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        series: Vec<SeriesSummary>,
    },
}

impl SearchResults {
    pub fn series(&self) -> &[SeriesSummary] {
        match self {
            Self::List(series) | Self::Paged { series, .. } => series,
        }
    }

    /// Total matches reported by the server, or the number returned.
    pub fn total(&self) -> u64 {
        match self {
            Self::Paged {
                count: Some(count), ..
            } => *count,
            _ => self.series().len() as u64,
        }
    }
}

impl Default for SearchResults {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

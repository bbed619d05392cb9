//! `homewatch-types` – shared vocabulary of the homewatch stack.
//!
//! Value types exchanged between the bus, the sensor layer and the series
//! store, the error taxonomy every crate reports through, and the [`Clock`]
//! seam used wherever "now" matters.

pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BusError, HalError, PointError, SeriesError, StoreError};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physical sensors wired to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Motion,
    Light,
    Sound,
    Temperature,
    Humidity,
}

impl SensorKind {
    /// Every sensor kind, in a stable order.
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Motion,
        SensorKind::Light,
        SensorKind::Sound,
        SensorKind::Temperature,
        SensorKind::Humidity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Motion => "motion",
            SensorKind::Light => "light",
            SensorKind::Sound => "sound",
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = HalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| HalError::InvalidValue(format!("unknown sensor type '{s}'")))
    }
}

/// One value delivered to a sensor consumer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    /// Delivery time, epoch milliseconds.
    pub ts: i64,
}

/// Dense, fixed-step window read back from a time series.
///
/// `points[i]` is the value of bucket `min + i * step`; `None` marks an
/// unobserved bucket when the series has no configured empty value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesWindow {
    pub min: i64,
    pub max: i64,
    pub count: usize,
    pub step: i64,
    pub series_min: i64,
    pub series_max: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub points: Vec<Option<i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_kind_serializes_lowercase() {
        let json = serde_json::to_string(&SensorKind::Temperature).unwrap();
        assert_eq!(json, "\"temperature\"");
        let back: SensorKind = serde_json::from_str("\"sound\"").unwrap();
        assert_eq!(back, SensorKind::Sound);
    }

    #[test]
    fn sensor_kind_from_str_rejects_unknown() {
        assert_eq!("light".parse::<SensorKind>().unwrap(), SensorKind::Light);
        let err = "pressure".parse::<SensorKind>().unwrap_err();
        assert!(err.to_string().contains("pressure"));
    }

    #[test]
    fn series_window_uses_type_field_name() {
        let window = SeriesWindow {
            min: 1000,
            max: 3000,
            count: 3,
            step: 1000,
            series_min: 0,
            series_max: 1024,
            kind: "light".to_string(),
            points: vec![Some(5), None, Some(7)],
        };
        let json = serde_json::to_value(&window).unwrap();
        assert_eq!(json["type"], "light");
        assert_eq!(json["points"], serde_json::json!([5, null, 7]));
    }
}

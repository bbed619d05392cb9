//! The built-in series, opened lazily and shared.
//!
//! | Series        | Interval | Empty value | `get_latest(None)` span |
//! |---------------|----------|-------------|-------------------------|
//! | `sound`       | 50 ms    | `0`         | 10 min                  |
//! | `light`       | 60 s     | none        | 1 day                   |
//! | `temperature` | 60 s     | none        | 1 day                   |
//! | `humidity`    | 60 s     | none        | 1 day                   |
//!
//! Every series keeps one day of points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homewatch_middleware::Bus;
use homewatch_types::{Clock, SensorKind, SeriesError};
use tokio::sync::Mutex;

use crate::time_series::{SeriesOptions, TimeSeries};

/// Options of the built-in series for `kind`, if it is recorded at all.
pub fn series_options(kind: SensorKind) -> Option<SeriesOptions> {
    match kind {
        SensorKind::Sound => Some(SeriesOptions {
            empty_value: Some(0),
            default_range: Duration::from_secs(10 * 60),
            ..SeriesOptions::with_interval(Duration::from_millis(50))
        }),
        SensorKind::Light | SensorKind::Temperature | SensorKind::Humidity => {
            Some(SeriesOptions::with_interval(Duration::from_secs(60)))
        }
        SensorKind::Motion => None,
    }
}

fn recorded_kind(name: &str) -> Option<SensorKind> {
    name.parse::<SensorKind>()
        .ok()
        .filter(|kind| series_options(*kind).is_some())
}

pub struct SeriesRegistry {
    bus: Bus,
    clock: Arc<dyn Clock>,
    open: Mutex<HashMap<SensorKind, Arc<TimeSeries>>>,
}

impl SeriesRegistry {
    pub fn new(bus: Bus, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            clock,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn has(name: &str) -> bool {
        recorded_kind(name).is_some()
    }

    /// The series called `name`, opening it on first use.
    pub async fn get(&self, name: &str) -> Result<Arc<TimeSeries>, SeriesError> {
        let (kind, options) = recorded_kind(name)
            .and_then(|kind| series_options(kind).map(|options| (kind, options)))
            .ok_or_else(|| SeriesError::UnknownSeries(name.to_string()))?;

        let mut open = self.open.lock().await;
        if let Some(series) = open.get(&kind) {
            return Ok(Arc::clone(series));
        }
        let series = Arc::new(
            TimeSeries::open(kind.as_str(), options, self.bus.clone(), Arc::clone(&self.clock))
                .await?,
        );
        open.insert(kind, Arc::clone(&series));
        Ok(series)
    }
}

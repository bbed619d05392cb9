//! Feeds sensor readings into their time series.
//!
//! One task per recorded sensor subscribes to the sensor at the series
//! interval and appends every reading, rounded to an integer.

use std::sync::Arc;

use homewatch_hal::{PollSubscription, SensorSet};
use homewatch_memory::{SeriesRegistry, TimeSeries};
use homewatch_types::{SensorKind, SeriesError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SeriesRecorder {
    tasks: Vec<(SensorKind, JoinHandle<()>)>,
}

impl SeriesRecorder {
    /// Start recording each of `kinds`.  Fails on a kind with no series or
    /// no sensor.
    pub async fn start(
        sensors: &SensorSet,
        registry: &SeriesRegistry,
        kinds: &[SensorKind],
    ) -> Result<Self, SeriesError> {
        let mut tasks = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let series = registry.get(kind.as_str()).await?;
            let feed = sensors
                .feed(kind)
                .ok_or_else(|| SeriesError::UnknownSeries(kind.to_string()))?;
            let readings = feed.subscribe(series.options().interval);
            info!(
                series = %kind,
                interval_ms = series.interval(),
                "recording sensor"
            );
            tasks.push((kind, tokio::spawn(record(series, readings))));
        }
        Ok(Self { tasks })
    }

    pub fn recording(&self) -> Vec<SensorKind> {
        self.tasks.iter().map(|(kind, _)| *kind).collect()
    }

    /// Stop every recording task.
    pub fn stop(self) {
        info!(feeds = self.tasks.len(), "stopping series recorder");
    }
}

impl Drop for SeriesRecorder {
    fn drop(&mut self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }
}

async fn record(series: Arc<TimeSeries>, mut readings: PollSubscription) {
    while let Some(reading) = readings.recv().await {
        let value = reading.value.is_finite().then(|| reading.value.round() as i64);
        match series.add(reading.ts, value).await {
            Ok(true) => {}
            Ok(false) => debug!(series = %series.name(), ts = reading.ts, "reading shares a recorded bucket"),
            Err(e) => warn!(series = %series.name(), error = %e, "failed to record reading"),
        }
    }
    info!(series = %series.name(), "sensor feed ended, recording stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_middleware::{Bus, MemoryStore, Store};
    use homewatch_types::ManualClock;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn readings_land_in_their_series() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(120_000));
        let sensors = SensorSet::simulated(clock.clone());
        let registry = SeriesRegistry::new(Bus::new(Arc::new(store.clone())), clock.clone());

        let recorder = SeriesRecorder::start(&sensors, &registry, &[SensorKind::Light]).await?;
        assert_eq!(recorder.recording(), vec![SensorKind::Light]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = store.lrange("light_series", 0, -1).await?;
        assert_eq!(first.len(), 1);
        assert!(first[0].starts_with("120000:"));

        clock.advance(60_000);
        tokio::time::sleep(Duration::from_secs(121)).await;
        let points = store.lrange("light_series", 0, -1).await?;
        assert_eq!(points.len(), 2);
        assert!(points[0].starts_with("180000:"));

        recorder.stop();
        Ok(())
    }

    #[tokio::test]
    async fn unrecorded_kind_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let sensors = SensorSet::simulated(clock.clone());
        let registry = SeriesRegistry::new(Bus::new(Arc::new(MemoryStore::new())), clock);

        let result = SeriesRecorder::start(&sensors, &registry, &[SensorKind::Motion]).await;
        assert!(matches!(result, Err(SeriesError::UnknownSeries(_))));
    }
}

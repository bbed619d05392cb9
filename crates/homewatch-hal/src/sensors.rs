//! The household sensor set.
//!
//! | Kind          | Source                 | Raw sample   | Reduction      |
//! |---------------|------------------------|--------------|----------------|
//! | `sound`       | ADC channel 0          | burst summary| spread         |
//! | `light`       | ADC channel 1          | burst summary| mean           |
//! | `temperature` | DHT (shared)           | °C           | newest         |
//! | `humidity`    | DHT (shared)           | %RH          | newest         |
//! | `motion`      | PIR edge               | edge         | event-driven   |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homewatch_types::{Clock, SensorKind};

use crate::adc::{self, AdcChannel, AdcSensor, SimAdc};
use crate::dht::{DhtDriver, DhtFeed, DhtQuantity, DhtSensor, SimDht};
use crate::motion::MotionSensor;
use crate::poller::{AdaptivePoller, PollSubscription, latest};

/// A sensor that consumers can subscribe to at their own period.
pub trait SensorFeed: Send + Sync {
    fn kind(&self) -> SensorKind;

    /// Event-driven feeds ignore `period`.
    fn subscribe(&self, period: Duration) -> PollSubscription;
}

struct PolledFeed<T> {
    kind: SensorKind,
    poller: AdaptivePoller<T>,
}

impl<T: Clone + Send + Sync + 'static> SensorFeed for PolledFeed<T> {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn subscribe(&self, period: Duration) -> PollSubscription {
        self.poller.subscribe(period)
    }
}

impl SensorFeed for MotionSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Motion
    }

    fn subscribe(&self, _period: Duration) -> PollSubscription {
        MotionSensor::subscribe(self)
    }
}

pub struct SensorSet {
    feeds: HashMap<SensorKind, Arc<dyn SensorFeed>>,
    motion: Arc<MotionSensor>,
}

impl SensorSet {
    pub fn new(adc: Arc<dyn AdcChannel>, dht: Arc<dyn DhtDriver>, clock: Arc<dyn Clock>) -> Self {
        let dht = Arc::new(DhtSensor::new(dht));
        let motion = Arc::new(MotionSensor::new(Arc::clone(&clock)));

        let sound: Arc<dyn SensorFeed> = Arc::new(PolledFeed {
            kind: SensorKind::Sound,
            poller: AdaptivePoller::new(
                "sound",
                AdcSensor::new(Arc::clone(&adc), adc::SOUND_CHANNEL),
                adc::spread_reducer(),
                Arc::clone(&clock),
            ),
        });
        let light: Arc<dyn SensorFeed> = Arc::new(PolledFeed {
            kind: SensorKind::Light,
            poller: AdaptivePoller::new(
                "light",
                AdcSensor::new(adc, adc::LIGHT_CHANNEL),
                adc::mean_reducer(),
                Arc::clone(&clock),
            ),
        });
        let temperature: Arc<dyn SensorFeed> = Arc::new(PolledFeed {
            kind: SensorKind::Temperature,
            poller: AdaptivePoller::new(
                "temperature",
                DhtFeed::new(Arc::clone(&dht), DhtQuantity::Temperature),
                latest::<f64>(),
                Arc::clone(&clock),
            ),
        });
        let humidity: Arc<dyn SensorFeed> = Arc::new(PolledFeed {
            kind: SensorKind::Humidity,
            poller: AdaptivePoller::new(
                "humidity",
                DhtFeed::new(dht, DhtQuantity::Humidity),
                latest::<f64>(),
                clock,
            ),
        });

        let feeds = HashMap::from([
            (SensorKind::Sound, sound),
            (SensorKind::Light, light),
            (SensorKind::Temperature, temperature),
            (SensorKind::Humidity, humidity),
            (SensorKind::Motion, Arc::clone(&motion) as Arc<dyn SensorFeed>),
        ]);
        Self { feeds, motion }
    }

    /// Sensor set backed by the deterministic stand-in drivers.
    pub fn simulated(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(SimAdc::new()), Arc::new(SimDht::default()), clock)
    }

    pub fn feed(&self, kind: SensorKind) -> Option<Arc<dyn SensorFeed>> {
        self.feeds.get(&kind).cloned()
    }

    pub fn motion(&self) -> &Arc<MotionSensor> {
        &self.motion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_types::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn every_kind_has_a_feed() -> Result<(), Box<dyn std::error::Error>> {
        let set = SensorSet::simulated(Arc::new(ManualClock::new(1_000)));
        for kind in SensorKind::ALL {
            let feed = set.feed(kind).ok_or("missing feed")?;
            assert_eq!(feed.kind(), kind);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn light_reading_is_within_adc_range() -> Result<(), Box<dyn std::error::Error>> {
        let set = SensorSet::simulated(Arc::new(ManualClock::new(1_000)));
        let mut light = set.feed(SensorKind::Light).ok_or("missing feed")?.subscribe(Duration::from_secs(1));
        let reading = light.recv().await.ok_or("closed")?;
        assert!((0.0..=f64::from(adc::ADC_MAX)).contains(&reading.value));
        assert_eq!(reading.ts, 1_000);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_and_humidity_share_one_read() -> Result<(), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(0));
        let driver = Arc::new(SimDht::new(Duration::from_millis(800)));
        let set = SensorSet::new(Arc::new(SimAdc::new()), driver.clone(), clock);

        let mut t = set.feed(SensorKind::Temperature).ok_or("missing feed")?.subscribe(Duration::from_secs(60));
        let mut h = set.feed(SensorKind::Humidity).ok_or("missing feed")?.subscribe(Duration::from_secs(60));
        assert_eq!(t.recv().await.ok_or("closed")?.value, 20.0);
        assert_eq!(h.recv().await.ok_or("closed")?.value, 40.0);
        assert_eq!(driver.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn motion_feed_is_event_driven() -> Result<(), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(5_000));
        let set = SensorSet::simulated(clock);
        let mut sub = set.feed(SensorKind::Motion).ok_or("missing feed")?.subscribe(Duration::ZERO);
        assert!(sub.try_recv().is_none());
        set.motion().motion_detected();
        assert_eq!(sub.recv().await.ok_or("closed")?.value, 5_000.0);
        Ok(())
    }
}

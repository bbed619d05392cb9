//! Combined temperature/humidity sensor.
//!
//! The physical part answers slowly and must not be queried more often than
//! every [`DHT_MIN_READ_GAP`].  Temperature and humidity are two feeds over one
//! [`DhtSensor`]: a read within the gap returns the cached pair, and a read
//! while another is in flight waits for that one instead of starting its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use homewatch_types::HalError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::poller::SampleSource;
use crate::reading::Reading;

pub const DHT_MIN_READ_GAP: Duration = Duration::from_secs(5);

/// Attempts per read before the feed gives up.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtValues {
    pub temperature: f64,
    pub humidity: f64,
}

/// Driver boundary for the sensor.
#[async_trait]
pub trait DhtDriver: Send + Sync {
    async fn read(&self) -> Result<DhtValues, HalError>;
}

/// Deterministic stand-in: answers after `latency` with slowly drifting
/// values.
#[derive(Debug)]
pub struct SimDht {
    latency: Duration,
    calls: AtomicU64,
}

impl SimDht {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for SimDht {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl DhtDriver for SimDht {
    async fn read(&self) -> Result<DhtValues, HalError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        Ok(DhtValues {
            temperature: 20.0 + (call % 10) as f64,
            humidity: 40.0 + (call % 30) as f64,
        })
    }
}

/// Coalescing front for a [`DhtDriver`].
pub struct DhtSensor {
    driver: Arc<dyn DhtDriver>,
    cache: Mutex<Option<(DhtValues, Instant)>>,
}

impl DhtSensor {
    pub fn new(driver: Arc<dyn DhtDriver>) -> Self {
        Self {
            driver,
            cache: Mutex::new(None),
        }
    }

    pub async fn read_values(&self) -> Result<DhtValues, HalError> {
        // Held across the driver call: concurrent callers queue here and
        // find the fresh pair in the cache.
        let mut cache = self.cache.lock().await;
        if let Some((values, at)) = *cache {
            if at.elapsed() < DHT_MIN_READ_GAP {
                return Ok(values);
            }
        }

        let mut attempt = 1;
        let values = loop {
            match self.driver.read().await {
                Ok(values) => break values,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "dht read failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        *cache = Some((values, Instant::now()));
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtQuantity {
    Temperature,
    Humidity,
}

/// One quantity of a shared [`DhtSensor`] as a [`SampleSource`].
pub struct DhtFeed {
    sensor: Arc<DhtSensor>,
    quantity: DhtQuantity,
}

impl DhtFeed {
    pub fn new(sensor: Arc<DhtSensor>, quantity: DhtQuantity) -> Self {
        Self { sensor, quantity }
    }
}

impl SampleSource<f64> for DhtFeed {
    fn read(&self) -> Reading<f64> {
        let sensor = Arc::clone(&self.sensor);
        let quantity = self.quantity;
        Reading::deferred(async move {
            match sensor.read_values().await {
                Ok(values) => Reading::Ready(match quantity {
                    DhtQuantity::Temperature => values.temperature,
                    DhtQuantity::Humidity => values.humidity,
                }),
                Err(e) => {
                    error!(?quantity, error = %e, "dht unavailable, ending feed");
                    Reading::EndOfStream
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_driver_call() -> Result<(), HalError> {
        let driver = Arc::new(SimDht::new(Duration::from_millis(800)));
        let sensor = Arc::new(DhtSensor::new(driver.clone()));

        let temperature = DhtFeed::new(sensor.clone(), DhtQuantity::Temperature);
        let humidity = DhtFeed::new(sensor.clone(), DhtQuantity::Humidity);
        let (t, h) = tokio::join!(temperature.read().resolve(), humidity.read().resolve());

        assert_eq!(t, Some(20.0));
        assert_eq!(h, Some(40.0));
        assert_eq!(driver.calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires_after_min_gap() -> Result<(), HalError> {
        let driver = Arc::new(SimDht::new(Duration::from_millis(10)));
        let sensor = DhtSensor::new(driver.clone());

        sensor.read_values().await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        sensor.read_values().await?;
        assert_eq!(driver.calls(), 1);

        tokio::time::sleep(DHT_MIN_READ_GAP).await;
        let fresh = sensor.read_values().await?;
        assert_eq!(driver.calls(), 2);
        assert_eq!(fresh.temperature, 21.0);
        Ok(())
    }

    struct Flaky {
        failures: AtomicU64,
    }

    #[async_trait]
    impl DhtDriver for Flaky {
        async fn read(&self) -> Result<DhtValues, HalError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(HalError::Driver {
                    component: "dht".to_string(),
                    details: "checksum mismatch".to_string(),
                });
            }
            Ok(DhtValues {
                temperature: 18.5,
                humidity: 61.0,
            })
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() -> Result<(), HalError> {
        let sensor = DhtSensor::new(Arc::new(Flaky {
            failures: AtomicU64::new(2),
        }));
        assert_eq!(sensor.read_values().await?.humidity, 61.0);
        Ok(())
    }

    #[tokio::test]
    async fn persistent_failure_ends_the_feed() {
        let sensor = Arc::new(DhtSensor::new(Arc::new(Flaky {
            failures: AtomicU64::new(100),
        })));
        let feed = DhtFeed::new(sensor, DhtQuantity::Temperature);
        assert!(feed.read().resolve().await.is_none());
    }
}

//! Analog channels (sound and light) behind a sampling ADC.
//!
//! One raw read collects a burst of conversions over a short window and
//! summarises it as an [`AdcSample`].  The sound feed reports the spread of
//! the burst (peak-to-peak amplitude); the light feed reports its mean.
//!
//! A burst blocks for [`SAMPLE_WINDOW`], so [`AdcSensor`] runs it on the
//! blocking pool and hands the poller a deferred reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use homewatch_types::HalError;
use tracing::error;

use crate::poller::{Reducer, SampleSource};
use crate::reading::Reading;

pub const SOUND_CHANNEL: u8 = 0;
pub const LIGHT_CHANNEL: u8 = 1;

/// Length of one conversion burst.
pub const SAMPLE_WINDOW: Duration = Duration::from_millis(50);

/// Largest value a 10-bit conversion can produce.
pub const ADC_MAX: u16 = 1023;

/// Summary of one conversion burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcSample {
    pub sum: u64,
    pub count: u32,
    pub min: u16,
    pub max: u16,
}

impl AdcSample {
    pub fn from_conversions(values: &[u16]) -> Option<Self> {
        let (&first, _) = values.split_first()?;
        Some(values.iter().fold(
            AdcSample {
                sum: 0,
                count: 0,
                min: first,
                max: first,
            },
            |acc, &v| AdcSample {
                sum: acc.sum + u64::from(v),
                count: acc.count + 1,
                min: acc.min.min(v),
                max: acc.max.max(v),
            },
        ))
    }
}

/// Peak-to-peak amplitude across all bursts.
pub fn spread(samples: &[AdcSample]) -> f64 {
    let min = samples.iter().map(|s| s.min).min();
    let max = samples.iter().map(|s| s.max).max();
    match (min, max) {
        (Some(min), Some(max)) => f64::from(max - min),
        _ => f64::NAN,
    }
}

/// Mean of every conversion across all bursts.
pub fn mean(samples: &[AdcSample]) -> f64 {
    let (sum, count) = samples
        .iter()
        .fold((0u64, 0u64), |(sum, count), s| (sum + s.sum, count + u64::from(s.count)));
    if count == 0 {
        f64::NAN
    } else {
        sum as f64 / count as f64
    }
}

pub fn spread_reducer() -> Reducer<AdcSample> {
    Arc::new(spread)
}

pub fn mean_reducer() -> Reducer<AdcSample> {
    Arc::new(mean)
}

/// Driver boundary for the converter.
pub trait AdcChannel: Send + Sync {
    /// Run conversions on `channel` for `window` and return the raw values.
    fn sample(&self, channel: u8, window: Duration) -> Result<Vec<u16>, HalError>;
}

/// Deterministic stand-in for the converter.
///
/// Each call produces a burst whose centre and amplitude drift with the call
/// count, so consecutive readings differ but tests can predict them.
#[derive(Debug, Default)]
pub struct SimAdc {
    calls: AtomicU64,
}

impl SimAdc {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdcChannel for SimAdc {
    fn sample(&self, channel: u8, _window: Duration) -> Result<Vec<u16>, HalError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let centre = (call * 37 + u64::from(channel) * 101) % 800 + 100;
        let amplitude = (call * 13) % 90 + 10;
        Ok((0..8u64)
            .map(|i| {
                let offset = (i * amplitude / 7) as i64 - (amplitude / 2) as i64;
                (centre as i64 + offset).clamp(0, i64::from(ADC_MAX)) as u16
            })
            .collect())
    }
}

/// [`SampleSource`] reading one ADC channel.
pub struct AdcSensor {
    adc: Arc<dyn AdcChannel>,
    channel: u8,
}

impl AdcSensor {
    pub fn new(adc: Arc<dyn AdcChannel>, channel: u8) -> Self {
        Self { adc, channel }
    }
}

impl SampleSource<AdcSample> for AdcSensor {
    fn read(&self) -> Reading<AdcSample> {
        let adc = Arc::clone(&self.adc);
        let channel = self.channel;
        Reading::deferred(async move {
            let burst = tokio::task::spawn_blocking(move || adc.sample(channel, SAMPLE_WINDOW));
            match burst.await {
                Ok(Ok(values)) => match AdcSample::from_conversions(&values) {
                    Some(sample) => Reading::Ready(sample),
                    None => {
                        error!(channel, "adc returned an empty burst, ending feed");
                        Reading::EndOfStream
                    }
                },
                Ok(Err(e)) => {
                    error!(channel, error = %e, "adc read failed, ending feed");
                    Reading::EndOfStream
                }
                Err(e) => {
                    error!(channel, error = %e, "adc sampling task failed, ending feed");
                    Reading::EndOfStream
                }
            }
        })
    }
}

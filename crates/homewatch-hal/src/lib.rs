//! `homewatch-hal` – sensors and actuators.
//!
//! Drivers sit behind small traits ([`AdcChannel`], [`DhtDriver`],
//! [`SpiCommandWriter`]) with deterministic stand-ins for headless runs.
//! Polled sensors share one [`AdaptivePoller`] per device so that any number
//! of consumers, each with its own period, cost a single read schedule.

pub mod adc;
pub mod dht;
pub mod motion;
pub mod poller;
pub mod reading;
pub mod sensors;
pub mod spi;

pub use adc::{AdcChannel, AdcSample, SimAdc};
pub use dht::{DhtDriver, DhtSensor, DhtValues, SimDht};
pub use motion::MotionSensor;
pub use poller::{
    AdaptivePoller, DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL, PollSubscription, SampleSource,
    common_divisor, poll_interval,
};
pub use reading::Reading;
pub use sensors::{SensorFeed, SensorSet};
pub use spi::{SimSpi, SpiCommandWriter, clamp_percent};

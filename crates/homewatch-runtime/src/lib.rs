//! `homewatch-runtime` – the services that run on the device.
//!
//! # Modules
//!
//! - [`recorder`] – [`SeriesRecorder`]: subscribes each recorded sensor at
//!   its series interval and appends the readings.
//! - [`peripherals`] – [`PeripheralService`]: answers camera commands
//!   arriving through `ack_on` by driving the SPI command bus.
//! - [`camera`] – [`CameraControl`]: issues camera commands with
//!   `ack_publish` and persists acknowledged settings.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber, with optional OTLP span export tagged with the
//!   homewatch service namespace and host.

pub mod camera;
pub mod peripherals;
pub mod recorder;
pub mod telemetry;

pub use camera::{CameraControl, CameraSettings};
pub use peripherals::{CameraAxis, PeripheralService};
pub use recorder::SeriesRecorder;

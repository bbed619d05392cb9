//! `homewatch-memory` – persisted sensor history.
//!
//! # Modules
//!
//! - [`point`] – the `"ts:value"` point codec.
//! - [`time_series`] – [`TimeSeries`], a bucketed, capped series with reads
//!   that stay consistent while points are being appended.
//! - [`registry`] – [`SeriesRegistry`], the built-in series opened on demand.

pub mod point;
pub mod registry;
pub mod time_series;

pub use point::{deserialize_point, serialize_point};
pub use registry::{SeriesRegistry, series_options};
pub use time_series::{MAX_LATEST, SCAN_BATCH, SeriesOptions, TimeSeries};

//! Error taxonomy shared across the homewatch crates.

use thiserror::Error;

/// Failures reported by the backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the command failed in transit.
    /// Retrying is the caller's concern.
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("operation against a key holding the wrong kind of value: {key}")]
    WrongType { key: String },

    /// A connection was used in a way its protocol does not allow.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Failures of the publish/subscribe bus and its ack/reply protocol.
#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no reply on {channel} within {timeout_ms} ms")]
    Timeout { channel: String, timeout_ms: u64 },

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("bus protocol error: {0}")]
    Protocol(String),
}

/// A serialized series point that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PointError {
    #[error("malformed series point '{0}'")]
    Malformed(String),
}

/// Failures of time-series reads and writes.
#[derive(Error, Debug)]
pub enum SeriesError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("unknown series '{0}'")]
    UnknownSeries(String),
}

/// Failures raised by sensor and actuator drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HalError {
    #[error("driver fault on {component}: {details}")]
    Driver { component: String, details: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_channel() {
        let err = BusError::Timeout {
            channel: "camera:x:abc:reply".to_string(),
            timeout_ms: 1000,
        };
        let text = err.to_string();
        assert!(text.contains("camera:x:abc:reply"));
        assert!(text.contains("1000"));
    }

    #[test]
    fn store_error_converts_into_series_error() {
        let err: SeriesError = StoreError::Connection("refused".to_string()).into();
        assert!(matches!(err, SeriesError::Store(StoreError::Connection(_))));
        assert!(err.to_string().contains("refused"));
    }
}

//! Command channel to the camera-mount microcontroller.
//!
//! Each command is one opcode byte followed by one value byte.

use async_trait::async_trait;
use homewatch_types::HalError;
use parking_lot::Mutex;
use tracing::debug;

pub const CMD_CAMERA_X: u8 = 0xA0;
pub const CMD_CAMERA_Y: u8 = 0xA1;
pub const CMD_CAMERA_IR: u8 = 0xA2;

/// Driver boundary for the command bus.
#[async_trait]
pub trait SpiCommandWriter: Send + Sync {
    /// Send `command` with `value`; `Ok(true)` when the device accepted it.
    async fn exec(&self, command: u8, value: u8) -> Result<bool, HalError>;
}

/// Map a percentage onto the command value range, clamping to 0..=100.
pub fn clamp_percent(value: f64) -> Result<u8, HalError> {
    if !value.is_finite() {
        return Err(HalError::InvalidValue(format!("{value} is not a finite number")));
    }
    Ok(value.round().clamp(0.0, 100.0) as u8)
}

/// Records every command and accepts it.
#[derive(Debug, Default)]
pub struct SimSpi {
    sent: Mutex<Vec<(u8, u8)>>,
}

impl SimSpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(u8, u8)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SpiCommandWriter for SimSpi {
    async fn exec(&self, command: u8, value: u8) -> Result<bool, HalError> {
        debug!(command = format_args!("{command:#04x}"), value, "spi command");
        self.sent.lock().push((command, value));
        Ok(true)
    }
}

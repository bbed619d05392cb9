//! Camera-mount actuators served over ack/reply.
//!
//! | Channel     | SPI opcode | Drives            |
//! |-------------|------------|-------------------|
//! | `camera:x`  | `0xA0`     | pan position      |
//! | `camera:y`  | `0xA1`     | tilt position     |
//! | `camera:ir` | `0xA2`     | IR LED brightness |
//!
//! Requests carry `{ "value": 0..100 }`; every request is answered with
//! `{ "success": bool }`.

use std::sync::Arc;

use homewatch_hal::spi::{self, SpiCommandWriter, clamp_percent};
use homewatch_middleware::{AckListener, AckRequest, Bus};
use homewatch_types::BusError;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraAxis {
    X,
    Y,
    Ir,
}

impl CameraAxis {
    pub const ALL: [CameraAxis; 3] = [CameraAxis::X, CameraAxis::Y, CameraAxis::Ir];

    pub fn channel(&self) -> &'static str {
        match self {
            CameraAxis::X => "camera:x",
            CameraAxis::Y => "camera:y",
            CameraAxis::Ir => "camera:ir",
        }
    }

    pub fn command(&self) -> u8 {
        match self {
            CameraAxis::X => spi::CMD_CAMERA_X,
            CameraAxis::Y => spi::CMD_CAMERA_Y,
            CameraAxis::Ir => spi::CMD_CAMERA_IR,
        }
    }

    /// Field name in the persisted settings hash.
    pub fn field(&self) -> &'static str {
        match self {
            CameraAxis::X => "x",
            CameraAxis::Y => "y",
            CameraAxis::Ir => "ir",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
}

/// Listens for camera commands and forwards them to the SPI bus.
pub struct PeripheralService {
    tasks: Vec<JoinHandle<()>>,
}

impl PeripheralService {
    /// Resolves once every listener is subscribed.
    pub async fn start(bus: &Bus, spi: Arc<dyn SpiCommandWriter>) -> Result<Self, BusError> {
        let mut tasks = Vec::with_capacity(CameraAxis::ALL.len());
        for axis in CameraAxis::ALL {
            let listener = bus.ack_on(axis.channel()).activate().await?;
            tasks.push(tokio::spawn(serve(axis, listener, Arc::clone(&spi))));
        }
        info!(channels = tasks.len(), "peripheral service listening");
        Ok(Self { tasks })
    }

    pub fn stop(self) {
        info!("stopping peripheral service");
    }
}

impl Drop for PeripheralService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve(axis: CameraAxis, mut listener: AckListener, spi: Arc<dyn SpiCommandWriter>) {
    while let Some(request) = listener.recv().await {
        let success = execute(axis, &request, spi.as_ref()).await;
        debug!(channel = axis.channel(), success, "camera command handled");
        request.ack(&CommandReply { success }).await;
    }
}

async fn execute(axis: CameraAxis, request: &AckRequest, spi: &dyn SpiCommandWriter) -> bool {
    let requested = match request.parse::<CommandRequest>() {
        Ok(request) => request.value,
        Err(e) => {
            warn!(channel = axis.channel(), error = %e, "malformed camera command");
            return false;
        }
    };
    let value = match clamp_percent(requested) {
        Ok(value) => value,
        Err(e) => {
            warn!(channel = axis.channel(), error = %e, "rejecting camera command");
            return false;
        }
    };
    match spi.exec(axis.command(), value).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(channel = axis.channel(), error = %e, "spi command failed");
            false
        }
    }
}

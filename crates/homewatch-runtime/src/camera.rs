//! Client side of the camera actuators.
//!
//! Settings are persisted in the hash `peripheral:camera:settings` (fields
//! `x`, `y`, `ir`) and only written after the actuator acknowledged the
//! change.

use std::collections::HashMap;
use std::time::Duration;

use homewatch_middleware::Bus;
use homewatch_types::StoreError;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::peripherals::{CameraAxis, CommandReply, CommandRequest};

pub const SETTINGS_KEY: &str = "peripheral:camera:settings";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CameraSettings {
    pub x: i64,
    pub y: i64,
    pub ir: i64,
}

impl CameraSettings {
    fn from_hash(hash: &HashMap<String, String>) -> Self {
        let field = |axis: CameraAxis| {
            hash.get(axis.field())
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
        };
        Self {
            x: field(CameraAxis::X),
            y: field(CameraAxis::Y),
            ir: field(CameraAxis::Ir),
        }
    }

    pub fn get(&self, axis: CameraAxis) -> i64 {
        match axis {
            CameraAxis::X => self.x,
            CameraAxis::Y => self.y,
            CameraAxis::Ir => self.ir,
        }
    }

    fn set(&mut self, axis: CameraAxis, value: i64) {
        match axis {
            CameraAxis::X => self.x = value,
            CameraAxis::Y => self.y = value,
            CameraAxis::Ir => self.ir = value,
        }
    }
}

pub struct CameraControl {
    bus: Bus,
    timeout: Duration,
    /// Loaded from the store on first use.
    settings: Mutex<Option<CameraSettings>>,
}

impl CameraControl {
    pub fn new(bus: Bus, timeout: Duration) -> Self {
        Self {
            bus,
            timeout,
            settings: Mutex::new(None),
        }
    }

    pub async fn values(&self) -> Result<CameraSettings, StoreError> {
        let mut cached = self.settings.lock().await;
        self.load(&mut cached).await
    }

    pub async fn set_x(&self, value: i64) -> Result<bool, StoreError> {
        self.set(CameraAxis::X, value).await
    }

    pub async fn set_y(&self, value: i64) -> Result<bool, StoreError> {
        self.set(CameraAxis::Y, value).await
    }

    pub async fn set_ir_brightness(&self, value: i64) -> Result<bool, StoreError> {
        self.set(CameraAxis::Ir, value).await
    }

    /// `Ok(true)` when the value is in place (already or newly acknowledged);
    /// `Ok(false)` when the actuator refused or did not answer in time.
    async fn set(&self, axis: CameraAxis, value: i64) -> Result<bool, StoreError> {
        let mut cached = self.settings.lock().await;
        let mut settings = self.load(&mut cached).await?;
        if settings.get(axis) == value {
            return Ok(true);
        }

        let request = CommandRequest {
            value: value as f64,
        };
        let accepted = match self.bus.ack_publish(axis.channel(), &request, self.timeout).await {
            Ok(reply) => serde_json::from_value::<CommandReply>(reply)
                .map(|reply| reply.success)
                .unwrap_or(false),
            Err(e) => {
                warn!(channel = axis.channel(), error = %e, "camera command not acknowledged");
                false
            }
        };
        if !accepted {
            return Ok(false);
        }

        self.bus
            .store()
            .hset(SETTINGS_KEY, axis.field(), &value.to_string())
            .await?;
        settings.set(axis, value);
        *cached = Some(settings);
        debug!(channel = axis.channel(), value, "camera setting stored");
        Ok(true)
    }

    async fn load(&self, cached: &mut Option<CameraSettings>) -> Result<CameraSettings, StoreError> {
        if let Some(settings) = *cached {
            return Ok(settings);
        }
        let hash = self.bus.store().hgetall(SETTINGS_KEY).await?;
        let settings = CameraSettings::from_hash(&hash);
        *cached = Some(settings);
        Ok(settings)
    }
}

//! Event-driven passive-infrared motion sensor.
//!
//! There is no polling here: every detection pushes the time elapsed since
//! the previous detection to all current subscribers.

use std::sync::Arc;
use std::time::Duration;

use homewatch_types::{Clock, SensorReading};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::poller::PollSubscription;

pub struct MotionSensor {
    clock: Arc<dyn Clock>,
    state: Mutex<MotionState>,
}

#[derive(Default)]
struct MotionState {
    last_detected_at: Option<i64>,
    subscribers: Vec<mpsc::UnboundedSender<SensorReading>>,
}

impl MotionSensor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MotionState::default()),
        }
    }

    /// Milliseconds since the last detection (or since the epoch when there
    /// has been none).
    pub fn read(&self) -> i64 {
        let last = self.state.lock().last_detected_at.unwrap_or(0);
        self.clock.now_millis() - last
    }

    /// Record a detection edge and notify subscribers.  Returns the elapsed
    /// time that was delivered.
    pub fn motion_detected(&self) -> i64 {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let elapsed = now - state.last_detected_at.unwrap_or(0);
        state.last_detected_at = Some(now);

        let reading = SensorReading {
            value: elapsed as f64,
            ts: now,
        };
        state.subscribers.retain(|tx| tx.send(reading).is_ok());
        debug!(elapsed_ms = elapsed, subscribers = state.subscribers.len(), "motion detected");
        elapsed
    }

    pub fn subscribe(&self) -> PollSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        PollSubscription::new(rx, None)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Stand-in for the detection interrupt: fire every `every`.
    pub fn simulate(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let sensor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                sensor.motion_detected();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_types::ManualClock;

    #[tokio::test]
    async fn detections_report_elapsed_time() -> Result<(), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(10_000));
        let sensor = MotionSensor::new(clock.clone());
        let mut sub = sensor.subscribe();

        sensor.motion_detected();
        clock.advance(2_500);
        assert_eq!(sensor.read(), 2_500);
        sensor.motion_detected();

        assert_eq!(sub.recv().await.ok_or("closed")?.value, 10_000.0);
        let second = sub.recv().await.ok_or("closed")?;
        assert_eq!(second.value, 2_500.0);
        assert_eq!(second.ts, 12_500);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let sensor = MotionSensor::new(Arc::new(ManualClock::new(0)));
        let kept = sensor.subscribe();
        let gone = sensor.subscribe();
        drop(gone);

        sensor.motion_detected();
        assert_eq!(sensor.subscriber_count(), 1);
        drop(kept);
        assert_eq!(sensor.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_interrupt_fires_periodically() -> Result<(), Box<dyn std::error::Error>> {
        let clock = Arc::new(ManualClock::new(0));
        let sensor = Arc::new(MotionSensor::new(clock));
        let mut sub = sensor.subscribe();
        let task = sensor.simulate(Duration::from_secs(30));

        sub.recv().await.ok_or("closed")?;
        sub.recv().await.ok_or("closed")?;
        task.abort();
        Ok(())
    }
}

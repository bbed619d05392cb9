//! Adaptive polling loop shared by every subscriber of one sensor.
//!
//! A single loop task reads the sensor at the greatest common divisor of all
//! subscriber periods, never faster than [`MIN_POLL_INTERVAL`].  Each
//! subscriber buffers the raw samples that arrive within its own period and
//! receives one reduced value per period.
//!
//! | Event                         | Effect                                        |
//! |-------------------------------|-----------------------------------------------|
//! | first subscriber              | loop starts with an immediate read            |
//! | subscriber set changes        | interval recomputed, loop restarts if changed |
//! | last subscriber leaves        | loop stops after the in-flight read           |
//! | source reports end of stream  | every subscriber stream closes                |
//!
//! Reads never overlap: a read in flight when the interval changes still
//! publishes its value before the new schedule takes over.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use homewatch_types::{Clock, SensorReading};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::reading::Reading;

/// Floor for both subscriber periods and the loop interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Period used when a subscriber asks for zero.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Interval arithmetic
// ────────────────────────────────────────────────────────────────────────────

/// Greatest common divisor of `periods` (milliseconds).
///
/// Zero entries count as 1; the divisor of an empty set is 0.
pub fn common_divisor(periods: &[u64]) -> u64 {
    periods.iter().map(|&p| p.max(1)).fold(0, gcd)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Loop interval for a set of subscriber periods.
pub fn poll_interval(periods: &[Duration]) -> Duration {
    let millis: Vec<u64> = periods.iter().map(|p| p.as_millis() as u64).collect();
    Duration::from_millis(common_divisor(&millis)).max(MIN_POLL_INTERVAL)
}

/// Normalise a requested subscriber period.
pub fn effective_period(requested: Duration) -> Duration {
    if requested.is_zero() {
        DEFAULT_POLL_INTERVAL
    } else {
        requested.max(MIN_POLL_INTERVAL)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sources and reducers
// ────────────────────────────────────────────────────────────────────────────

/// Something the poll loop can read from.
pub trait SampleSource<T>: Send + Sync {
    fn read(&self) -> Reading<T>;
}

impl<T, F> SampleSource<T> for F
where
    F: Fn() -> Reading<T> + Send + Sync,
{
    fn read(&self) -> Reading<T> {
        self()
    }
}

/// Collapses the raw samples of one subscriber period into a single value.
/// Never called with an empty slice.
pub type Reducer<T> = Arc<dyn Fn(&[T]) -> f64 + Send + Sync>;

/// Reducer that keeps the newest sample.
pub fn latest<T: Copy + Into<f64>>() -> Reducer<T> {
    Arc::new(|samples: &[T]| samples.last().copied().map_or(f64::NAN, Into::into))
}

// ────────────────────────────────────────────────────────────────────────────
// Poller
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum PollEvent<T> {
    Sample(T),
    End,
}

struct PollerState<T> {
    subscribers: HashMap<u64, Duration>,
    loop_alive: bool,
    last: Option<(T, i64)>,
    ended: bool,
}

struct Shared<T> {
    name: String,
    source: Box<dyn SampleSource<T>>,
    reducer: Reducer<T>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<PollEvent<T>>,
    /// `None` while stopped.
    interval: watch::Sender<Option<Duration>>,
    state: Mutex<PollerState<T>>,
    next_subscriber: AtomicU64,
}

/// Shared poll loop for one sensor.
pub struct AdaptivePoller<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AdaptivePoller<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for AdaptivePoller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptivePoller")
            .field("name", &self.shared.name)
            .field("interval", &*self.shared.interval.borrow())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> AdaptivePoller<T> {
    pub fn new(
        name: impl Into<String>,
        source: impl SampleSource<T> + 'static,
        reducer: Reducer<T>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (interval, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                source: Box::new(source),
                reducer,
                clock,
                events,
                interval,
                state: Mutex::new(PollerState {
                    subscribers: HashMap::new(),
                    loop_alive: false,
                    last: None,
                    ended: false,
                }),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current loop interval, `None` while stopped.
    pub fn interval(&self) -> Option<Duration> {
        *self.shared.interval.borrow()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.state.lock().loop_alive
    }

    /// Most recent raw sample and the time it was read (epoch ms).
    pub fn last_value(&self) -> Option<(T, i64)> {
        self.shared.state.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Join the poll loop with the given delivery period.
    ///
    /// The first value arrives immediately: the cached raw sample when one
    /// exists, otherwise the next read.  Dropping the returned subscription
    /// leaves the loop.  Must be called within a Tokio runtime.
    pub fn subscribe(&self, period: Duration) -> PollSubscription {
        let period = effective_period(period);
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.shared.events.subscribe();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let cached = {
            let mut state = self.shared.state.lock();
            let cached = state.last.as_ref().map(|(value, _)| value.clone());
            if state.ended {
                if let Some(value) = cached {
                    let _ = tx.send(self.shared.reading(std::slice::from_ref(&value)));
                }
                return PollSubscription::new(rx, None);
            }
            state.subscribers.insert(id, period);
            self.shared.reconcile(&mut state);
            cached
        };

        tokio::spawn(deliver(Arc::clone(&self.shared), events, tx, period, cached));

        let shared = Arc::downgrade(&self.shared);
        PollSubscription::new(
            rx,
            Some(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.remove_subscriber(id);
                }
            })),
        )
    }
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn reading(&self, samples: &[T]) -> SensorReading {
        SensorReading {
            value: (self.reducer)(samples),
            ts: self.clock.now_millis(),
        }
    }

    fn remove_subscriber(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_some() {
            self.reconcile(&mut state);
        }
    }

    /// Bring the loop in line with the subscriber set.  Caller holds the
    /// state lock.
    fn reconcile(self: &Arc<Self>, state: &mut PollerState<T>) {
        if state.ended {
            return;
        }
        let target = if state.subscribers.is_empty() {
            None
        } else {
            let periods: Vec<Duration> = state.subscribers.values().copied().collect();
            Some(poll_interval(&periods))
        };

        if *self.interval.borrow() != target {
            match target {
                Some(interval) => debug!(
                    sensor = %self.name,
                    interval_ms = interval.as_millis() as u64,
                    subscribers = state.subscribers.len(),
                    "poll interval set"
                ),
                None => debug!(sensor = %self.name, "no subscribers left, stopping poll loop"),
            }
            self.interval.send_replace(target);
        }

        if target.is_some() && !state.loop_alive {
            state.loop_alive = true;
            tokio::spawn(run_loop(Arc::clone(self)));
        }
    }

    /// Called by the loop between reads; clears `loop_alive` when stopped.
    fn exit_if_stopped(&self) -> bool {
        let mut state = self.state.lock();
        if self.interval.borrow().is_none() {
            state.loop_alive = false;
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        state.loop_alive = false;
        state.subscribers.clear();
        self.interval.send_replace(None);
        info!(sensor = %self.name, "sensor reached end of stream");
        let _ = self.events.send(PollEvent::End);
    }
}

async fn run_loop<T: Clone + Send + Sync + 'static>(shared: Arc<Shared<T>>) {
    let mut interval = shared.interval.subscribe();
    debug!(sensor = %shared.name, "poll loop started");

    loop {
        match shared.source.read().resolve().await {
            Some(value) => {
                shared.state.lock().last = Some((value.clone(), shared.clock.now_millis()));
                let _ = shared.events.send(PollEvent::Sample(value));
            }
            None => {
                shared.finish();
                return;
            }
        }

        let period = *interval.borrow_and_update();
        if let Some(period) = period {
            // A changed interval wakes the loop early: that is the restart,
            // and it begins with an immediate read.
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = interval.changed() => {}
            }
        }

        if shared.exit_if_stopped() {
            debug!(sensor = %shared.name, "poll loop stopped");
            return;
        }
    }
}

async fn next_sample<T: Clone>(events: &mut broadcast::Receiver<PollEvent<T>>) -> Option<T> {
    loop {
        match events.recv().await {
            Ok(PollEvent::Sample(value)) => return Some(value),
            Ok(PollEvent::End) | Err(RecvError::Closed) => return None,
            Err(RecvError::Lagged(_)) => continue,
        }
    }
}

/// Per-subscriber task: first value immediately, then one reduced value
/// per period while samples keep arriving.
async fn deliver<T: Clone + Send + Sync + 'static>(
    shared: Arc<Shared<T>>,
    mut events: broadcast::Receiver<PollEvent<T>>,
    tx: mpsc::UnboundedSender<SensorReading>,
    period: Duration,
    cached: Option<T>,
) {
    let first = match cached {
        Some(value) => value,
        None => tokio::select! {
            sample = next_sample(&mut events) => match sample {
                Some(value) => value,
                None => return,
            },
            _ = tx.closed() => return,
        },
    };
    if tx.send(shared.reading(std::slice::from_ref(&first))).is_err() {
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window: Vec<T> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PollEvent::Sample(value)) => window.push(value),
                Ok(PollEvent::End) | Err(RecvError::Closed) => {
                    if !window.is_empty() {
                        let _ = tx.send(shared.reading(&window));
                    }
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(sensor = %shared.name, skipped, "subscriber fell behind the poll loop");
                }
            },
            _ = ticker.tick() => {
                if !window.is_empty() {
                    let reading = shared.reading(&window);
                    window.clear();
                    if tx.send(reading).is_err() {
                        break;
                    }
                }
            }
            _ = tx.closed() => break,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ────────────────────────────────────────────────────────────────────────────

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Stream of readings for one consumer.  Dropping it unsubscribes.
pub struct PollSubscription {
    rx: mpsc::UnboundedReceiver<SensorReading>,
    release: Option<Release>,
}

impl PollSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SensorReading>, release: Option<Release>) -> Self {
        Self { rx, release }
    }

    /// Next reading; `None` once the sensor has ended.
    pub async fn recv(&mut self) -> Option<SensorReading> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SensorReading> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for PollSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSubscription")
            .field("attached", &self.release.is_some())
            .finish()
    }
}

impl Drop for PollSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_types::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn counting_poller(reads: Arc<AtomicU64>) -> AdaptivePoller<f64> {
        AdaptivePoller::new(
            "counter",
            move || Reading::Ready((reads.fetch_add(1, Ordering::SeqCst) + 1) as f64),
            latest(),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn common_divisor_edge_cases() {
        assert_eq!(common_divisor(&[]), 0);
        assert_eq!(common_divisor(&[0]), 1);
        assert_eq!(common_divisor(&[0, 500]), 1);
        assert_eq!(common_divisor(&[300, 200]), 100);
        assert_eq!(common_divisor(&[1000]), 1000);
    }

    #[test]
    fn poll_interval_divides_periods_and_respects_floor() {
        let sets: [&[u64]; 5] = [&[1000], &[300, 200], &[750, 500, 1250], &[60, 90], &[7, 13]];
        for set in sets {
            let periods: Vec<Duration> = set.iter().map(|&ms| Duration::from_millis(ms)).collect();
            let interval = poll_interval(&periods);
            assert!(interval >= MIN_POLL_INTERVAL);
            if common_divisor(set) >= 50 {
                for &p in set {
                    assert_eq!(p % interval.as_millis() as u64, 0, "{set:?}");
                }
            }
        }
    }

    #[test]
    fn requested_periods_are_normalised() {
        assert_eq!(effective_period(Duration::ZERO), DEFAULT_POLL_INTERVAL);
        assert_eq!(effective_period(Duration::from_millis(10)), MIN_POLL_INTERVAL);
        assert_eq!(effective_period(Duration::from_millis(800)), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscriber_gets_an_immediate_read() -> Result<(), Box<dyn std::error::Error>> {
        let reads = Arc::new(AtomicU64::new(0));
        let poller = counting_poller(reads.clone());
        let started = Instant::now();

        let mut sub = poller.subscribe(Duration::from_secs(1));
        let first = sub.recv().await.ok_or("stream closed")?;

        assert_eq!(first.value, 1.0);
        assert!(started.elapsed() < MIN_POLL_INTERVAL);
        assert_eq!(poller.interval(), Some(Duration::from_secs(1)));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn second_subscriber_recomputes_interval_and_keeps_last_value()
    -> Result<(), Box<dyn std::error::Error>> {
        let reads = Arc::new(AtomicU64::new(0));
        let poller = counting_poller(reads);

        let mut a = poller.subscribe(Duration::from_millis(300));
        assert_eq!(a.recv().await.ok_or("stream closed")?.value, 1.0);
        assert_eq!(poller.interval(), Some(Duration::from_millis(300)));

        let mut b = poller.subscribe(Duration::from_millis(200));
        assert_eq!(poller.interval(), Some(Duration::from_millis(100)));
        assert_eq!(poller.last_value().map(|(v, _)| v), Some(1.0));
        assert_eq!(poller.subscriber_count(), 2);

        // Cached value goes straight to the newcomer.
        assert_eq!(b.recv().await.ok_or("stream closed")?.value, 1.0);

        drop(b);
        assert_eq!(poller.interval(), Some(Duration::from_millis(300)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_receives_reduced_window() -> Result<(), Box<dyn std::error::Error>> {
        let poller: AdaptivePoller<f64> = AdaptivePoller::new(
            "count",
            || Reading::Ready(1.0),
            Arc::new(|samples: &[f64]| samples.len() as f64),
            Arc::new(ManualClock::new(0)),
        );
        let _fast = poller.subscribe(Duration::from_millis(100));
        let mut slow = poller.subscribe(Duration::from_millis(400));

        assert_eq!(slow.recv().await.ok_or("stream closed")?.value, 1.0);
        let window = slow.recv().await.ok_or("stream closed")?;
        assert!(window.value >= 3.0, "window held {} samples", window.value);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_when_last_subscriber_leaves() -> Result<(), Box<dyn std::error::Error>> {
        let reads = Arc::new(AtomicU64::new(0));
        let poller = counting_poller(reads.clone());

        let mut sub = poller.subscribe(Duration::from_millis(100));
        sub.recv().await.ok_or("stream closed")?;
        drop(sub);
        assert_eq!(poller.interval(), None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!poller.is_polling());
        let settled = reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reads.load(Ordering::SeqCst), settled);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_closes_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let reads = Arc::new(AtomicU64::new(0));
        let counter = reads.clone();
        let poller: AdaptivePoller<f64> = AdaptivePoller::new(
            "finite",
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Reading::Ready(5.0)
                } else {
                    Reading::EndOfStream
                }
            },
            latest(),
            Arc::new(ManualClock::new(0)),
        );

        let mut sub = poller.subscribe(Duration::from_millis(50));
        assert!(sub.recv().await.is_some());
        while sub.recv().await.is_some() {}

        assert_eq!(poller.interval(), None);
        assert!(!poller.is_polling());

        let mut late = poller.subscribe(Duration::from_millis(50));
        assert_eq!(late.recv().await.map(|r| r.value), Some(5.0));
        assert!(late.recv().await.is_none());
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_read_publishes_across_restart() -> Result<(), Box<dyn std::error::Error>> {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicU64::new(0));
        let (a_active, a_peak, a_reads) = (active.clone(), peak.clone(), reads.clone());

        let poller: AdaptivePoller<f64> = AdaptivePoller::new(
            "slow",
            move || {
                let (active, peak, reads) = (a_active.clone(), a_peak.clone(), a_reads.clone());
                Reading::deferred(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Reading::Ready((reads.fetch_add(1, Ordering::SeqCst) + 1) as f64)
                })
            },
            latest(),
            Arc::new(ManualClock::new(0)),
        );

        let started = Instant::now();
        let mut a = poller.subscribe(Duration::from_millis(1000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut b = poller.subscribe(Duration::from_millis(500));
        assert_eq!(poller.interval(), Some(Duration::from_millis(500)));

        assert_eq!(b.recv().await.ok_or("stream closed")?.value, 1.0);
        assert_eq!(a.recv().await.ok_or("stream closed")?.value, 1.0);
        assert!(started.elapsed() >= Duration::from_millis(200));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        Ok(())
    }
}

//! Bucketed, capped time series kept in a backing-store list.
//!
//! # Storage layout
//!
//! | Key / channel          | Content                                          |
//! |------------------------|--------------------------------------------------|
//! | `<name>_series`        | encoded points, newest at the head, capped       |
//! | `series:<name>:add`    | `[ts, value]` broadcast for every accepted point |
//!
//! Timestamps are bucketed down to a multiple of the series interval and
//! accepted only when strictly newer than the last accepted one, so the
//! list is always ordered newest first with no duplicates.
//!
//! # Reads under concurrent writers
//!
//! [`TimeSeries::get_values_since`] listens on the series channel before
//! its first page read and pages backward through the list.  Every point
//! announced on the channel during the scan is merged into the result.  A
//! point announced between two page reads also shifts the next page start by
//! one, since each insert pushes the existing entries one index further from
//! the head.  The bus never hands the listener points announced before it
//! was registered, so those cannot shift the scan.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use homewatch_middleware::{Bus, Subscription};
use homewatch_types::{Clock, SeriesError, SeriesWindow};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::point::{deserialize_point, serialize_point};

/// Entries fetched per page during a scan.
pub const SCAN_BATCH: i64 = 1000;

/// Upper bound for an explicit [`TimeSeries::get_latest`] count.
pub const MAX_LATEST: usize = 3600;

/// Look-back used when no start timestamp is given.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(60 * 60);

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOptions {
    pub interval: Duration,
    /// Retention cap, in points.
    pub max_size: usize,
    /// Stands in for unobserved buckets in window reads.
    pub empty_value: Option<i64>,
    pub value_min: i64,
    pub value_max: i64,
    /// Span covered by `get_latest(None)`.
    pub default_range: Duration,
}

impl SeriesOptions {
    /// One day of retention at `interval`, no empty value, 0..=1024 range.
    pub fn with_interval(interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        Self {
            interval,
            max_size: (ONE_DAY.as_millis() / interval_ms) as usize,
            empty_value: None,
            value_min: 0,
            value_max: 1024,
            default_range: ONE_DAY,
        }
    }
}

pub struct TimeSeries {
    name: String,
    key: String,
    channel: String,
    options: SeriesOptions,
    interval: i64,
    bus: Bus,
    clock: Arc<dyn Clock>,
    /// Held across compare-then-append.
    last_ts: Mutex<Option<i64>>,
}

impl std::fmt::Debug for TimeSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeries")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

impl TimeSeries {
    /// Open the series, restoring the last accepted timestamp from the head
    /// of the stored list.
    pub async fn open(
        name: impl Into<String>,
        options: SeriesOptions,
        bus: Bus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SeriesError> {
        let name = name.into();
        let key = format!("{name}_series");
        let channel = format!("series:{name}:add");
        let interval = options.interval.as_millis().max(1) as i64;

        let last_ts = match bus.store().lindex(&key, 0).await? {
            Some(raw) => match deserialize_point(&raw) {
                Ok((ts, _)) => Some(ts),
                Err(e) => {
                    warn!(series = %name, error = %e, "unreadable head point, starting fresh");
                    None
                }
            },
            None => None,
        };
        info!(series = %name, interval_ms = interval, last_ts, "series opened");

        Ok(Self {
            name,
            key,
            channel,
            options,
            interval,
            bus,
            clock,
            last_ts: Mutex::new(last_ts),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing list key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Channel on which accepted points are announced.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn options(&self) -> &SeriesOptions {
        &self.options
    }

    /// Interval in milliseconds.
    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn bucket(&self, ts: i64) -> i64 {
        ts.div_euclid(self.interval) * self.interval
    }

    pub async fn last_timestamp(&self) -> Option<i64> {
        *self.last_ts.lock().await
    }

    /// Append a point.
    ///
    /// Returns `Ok(false)` without touching the store when the bucketed
    /// timestamp is not newer than the last accepted one.  A store failure
    /// leaves the last accepted timestamp unchanged.
    pub async fn add(&self, ts: i64, value: Option<i64>) -> Result<bool, SeriesError> {
        let ts = self.bucket(ts);
        let mut last = self.last_ts.lock().await;
        if last.is_some_and(|last| ts <= last) {
            debug!(series = %self.name, ts, last = ?*last, "rejecting non-increasing point");
            return Ok(false);
        }

        self.bus
            .store()
            .lpush_capped(&self.key, &serialize_point(ts, value), self.options.max_size)
            .await?;
        *last = Some(ts);
        drop(last);

        self.bus.publish(&self.channel, &(ts, value)).await;
        Ok(true)
    }

    /// Dense window from `since` (bucketed; default one hour ago) to now.
    ///
    /// Unobserved buckets hold the configured empty value, except the
    /// current bucket, which is left out when nothing has arrived for it
    /// yet.  A store failure during the scan fails the whole read.
    pub async fn get_values_since(&self, since: Option<i64>) -> Result<SeriesWindow, SeriesError> {
        let since = self.bucket(since.unwrap_or_else(|| {
            self.clock.now_millis() - DEFAULT_LOOKBACK.as_millis() as i64
        }));

        // Subscription is confirmed before the first page is read.
        let mut inserts = self.bus.on(self.channel.clone()).activate().await?;
        let mut found = BTreeMap::new();
        let scanned = self.scan(since, &mut inserts, &mut found).await;
        if scanned.is_ok() {
            self.drain_inserts(&mut inserts, &mut found);
        }
        if let Err(e) = inserts.cancel().await {
            warn!(series = %self.name, error = %e, "failed to release insert watch");
        }
        scanned?;

        Ok(self.window(since, &found))
    }

    /// Window of `count` buckets ending near now (default: the series'
    /// default range, explicit counts capped at [`MAX_LATEST`]).
    ///
    /// The window opens `count` intervals back and is cut to `count` points
    /// from its newest end, so a populated current bucket is the one dropped.
    pub async fn get_latest(&self, count: Option<usize>) -> Result<SeriesWindow, SeriesError> {
        let count = match count {
            Some(count) => count.min(MAX_LATEST),
            None => {
                let range = self.options.default_range.as_millis() as i64;
                (range + self.interval - 1).div_euclid(self.interval) as usize
            }
        };
        let since = self.clock.now_millis() - self.interval * count as i64;
        let mut window = self.get_values_since(Some(since)).await?;

        if window.points.len() > count {
            window.points.truncate(count);
            window.count = window.points.len();
            window.max = window.min + (window.count as i64 - 1) * window.step;
        }
        Ok(window)
    }

    async fn scan(
        &self,
        since: i64,
        inserts: &mut Subscription,
        found: &mut BTreeMap<i64, Option<i64>>,
    ) -> Result<(), SeriesError> {
        let store = self.bus.store();
        let mut start: i64 = 0;
        // Announced before the first page: already part of it.
        self.drain_inserts(inserts, found);

        loop {
            let page = store.lrange(&self.key, start, start + SCAN_BATCH - 1).await?;

            let mut reached_since = false;
            for raw in &page {
                let (ts, value) = match deserialize_point(raw) {
                    Ok(point) => point,
                    Err(e) => {
                        warn!(series = %self.name, error = %e, "skipping malformed point");
                        continue;
                    }
                };
                if ts < since {
                    reached_since = true;
                    break;
                }
                found.insert(ts, value);
            }

            if reached_since || (page.len() as i64) < SCAN_BATCH {
                return Ok(());
            }
            start += SCAN_BATCH + self.drain_inserts(inserts, found) as i64;
        }
    }

    /// Merge announced points; returns how many arrived.
    fn drain_inserts(&self, inserts: &mut Subscription, found: &mut BTreeMap<i64, Option<i64>>) -> usize {
        let mut arrived = 0;
        while let Some(delivery) = inserts.try_recv() {
            arrived += 1;
            match delivery.parse::<(i64, Option<i64>)>() {
                Ok((ts, value)) => {
                    found.insert(ts, value);
                }
                Err(e) => warn!(series = %self.name, error = %e, "ignoring malformed insert notice"),
            }
        }
        arrived
    }

    fn window(&self, since: i64, found: &BTreeMap<i64, Option<i64>>) -> SeriesWindow {
        let now = self.bucket(self.clock.now_millis());
        let mut points = Vec::new();
        let mut ts = since;
        while ts <= now {
            match found.get(&ts) {
                Some(value) => points.push(*value),
                None if ts == now => break,
                None => points.push(self.options.empty_value),
            }
            ts += self.interval;
        }

        SeriesWindow {
            min: since,
            max: since + (points.len() as i64 - 1) * self.interval,
            count: points.len(),
            step: self.interval,
            series_min: self.options.value_min,
            series_max: self.options.value_max,
            kind: self.name.clone(),
            points,
        }
    }
}

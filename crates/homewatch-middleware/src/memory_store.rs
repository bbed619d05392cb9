//! In-process [`Store`] standing in for Redis in tests.
//!
//! [`MemoryStore`] keeps strings, hashes and lists in a map, honours key
//! expiry, and fans published messages out to every open subscriber
//! connection with Redis-style glob matching for pattern subscriptions.
//! Cloning the store yields another handle on the same data, which is how
//! several "processes" share one store in tests.
//!
//! [`MemoryStore::set_offline`] makes every command fail with
//! [`StoreError::Connection`] so callers' failure paths can be exercised.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use homewatch_types::StoreError;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::store::{MessageSink, Store, StoreMessage, SubscriberConnection};

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

struct SubscriberSlot {
    sink: MessageSink,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<u64, SubscriberSlot>,
}

impl MemoryState {
    /// Look up a key, evicting it first if its timeout has passed.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    next_subscriber: AtomicU64,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ────────────────────────────────────────────────────────────────────────────

/// Shared in-memory backing store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) connectivity to the store.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of subscribe/psubscribe commands issued so far.
    pub fn subscribe_calls(&self) -> usize {
        self.shared.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe/punsubscribe commands issued so far.
    pub fn unsubscribe_calls(&self) -> usize {
        self.shared.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Whether any subscriber connection currently listens on `channel`
    /// (exact subscriptions only).
    pub fn has_subscription(&self, channel: &str) -> bool {
        self.shared
            .state
            .lock()
            .subscribers
            .values()
            .any(|slot| slot.channels.contains(channel))
    }

    /// Whether any subscriber connection currently listens on `pattern`.
    pub fn has_pattern_subscription(&self, pattern: &str) -> bool {
        self.shared
            .state
            .lock()
            .subscribers
            .values()
            .any(|slot| slot.patterns.contains(pattern))
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.shared.offline.load(Ordering::SeqCst) {
            Err(StoreError::Connection("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        match state.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.shared.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        match state.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        match state.live(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        if state.live(key).is_none() {
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match state.live(key).map(|e| &mut e.value) {
            Some(Value::Hash(h)) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn lpush_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        if state.live(key).is_none() {
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match state.live(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => {
                list.push_front(value.to_string());
                list.truncate(max_len.max(1));
                Ok(())
            }
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        match state.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match list_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        match state.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::List(list)) => {
                let len = list.len() as i64;
                let index = if index < 0 { len + index } else { index };
                if index < 0 || index >= len {
                    Ok(None)
                } else {
                    Ok(list.get(index as usize).cloned())
                }
            }
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        let state = self.shared.state.lock();
        let mut receivers = 0;
        for slot in state.subscribers.values() {
            if slot.channels.contains(channel) {
                let message = StoreMessage::Message {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                };
                if slot.sink.send(message).is_ok() {
                    receivers += 1;
                }
            }
            for pattern in slot.patterns.iter().filter(|p| glob_match(p, channel)) {
                let message = StoreMessage::PatternMessage {
                    pattern: pattern.clone(),
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                };
                if slot.sink.send(message).is_ok() {
                    receivers += 1;
                }
            }
        }
        trace!(channel, receivers, "memory store publish");
        Ok(receivers)
    }

    async fn open_subscriber(
        &self,
        sink: MessageSink,
    ) -> Result<Box<dyn SubscriberConnection>, StoreError> {
        self.check_online()?;
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.shared.state.lock().subscribers.insert(
            id,
            SubscriberSlot {
                sink,
                channels: HashSet::new(),
                patterns: HashSet::new(),
            },
        );
        Ok(Box::new(MemorySubscriber {
            id,
            store: self.clone(),
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscriber connection
// ────────────────────────────────────────────────────────────────────────────

struct MemorySubscriber {
    id: u64,
    store: MemoryStore,
}

impl MemorySubscriber {
    fn update(
        &self,
        pattern: bool,
        name: &str,
        add: bool,
    ) -> Result<(), StoreError> {
        self.store.check_online()?;
        let counter = if add {
            &self.store.shared.subscribe_calls
        } else {
            &self.store.shared.unsubscribe_calls
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let mut state = self.store.shared.state.lock();
        let slot = state
            .subscribers
            .get_mut(&self.id)
            .ok_or_else(|| StoreError::Protocol("subscriber connection closed".to_string()))?;
        let set = if pattern {
            &mut slot.patterns
        } else {
            &mut slot.channels
        };
        if add {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberConnection for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.update(false, channel, true)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.update(false, channel, false)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), StoreError> {
        self.update(true, pattern, true)
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError> {
        self.update(true, pattern, false)
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.store.shared.state.lock().subscribers.remove(&self.id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

/// Resolve an inclusive `[start, stop]` list range with Redis index rules.
fn list_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

/// Redis-style glob match: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(mut p: &[u8], mut t: &[u8]) -> bool {
    while let Some(&c) = p.first() {
        match c {
            b'*' => {
                while p.len() > 1 && p[1] == b'*' {
                    p = &p[1..];
                }
                if p.len() == 1 {
                    return true;
                }
                return (0..=t.len()).any(|i| match_bytes(&p[1..], &t[i..]));
            }
            b'?' => {
                if t.is_empty() {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
            b'[' => {
                let Some(&ch) = t.first() else {
                    return false;
                };
                let (matched, rest) = match_class(&p[1..], ch);
                if !matched {
                    return false;
                }
                p = rest;
                t = &t[1..];
            }
            b'\\' if p.len() >= 2 => {
                if t.first() != Some(&p[1]) {
                    return false;
                }
                p = &p[2..];
                t = &t[1..];
            }
            _ => {
                if t.first() != Some(&c) {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
        }
    }
    t.is_empty()
}

/// Match one character against a `[...]` class; returns the verdict and the
/// pattern remaining after the closing bracket.
fn match_class(mut p: &[u8], ch: u8) -> (bool, &[u8]) {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }
    let mut matched = false;
    loop {
        match p {
            [] => break,
            [b']', rest @ ..] => {
                p = rest;
                break;
            }
            [b'\\', escaped, rest @ ..] => {
                matched |= *escaped == ch;
                p = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&ch);
                p = rest;
            }
            [other, rest @ ..] => {
                matched |= *other == ch;
                p = rest;
            }
        }
    }
    (matched != negate, p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn glob_question_marks_match_exact_length() {
        let pattern = format!("camera:x:{}:ack", "?".repeat(36));
        let id = "0b4f6f0e-5c2d-4d6e-9a43-2f1f4f0d8a11";
        assert!(glob_match(&pattern, &format!("camera:x:{id}:ack")));
        assert!(!glob_match(&pattern, "camera:x:short:ack"));
        assert!(!glob_match(&pattern, &format!("camera:x:{id}:reply")));
    }

    #[test]
    fn glob_star_class_and_escape() {
        assert!(glob_match("series:*:add", "series:light:add"));
        assert!(glob_match("*", ""));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
    }

    #[test]
    fn list_range_follows_redis_rules() {
        assert_eq!(list_range(5, 0, -1), Some((0, 4)));
        assert_eq!(list_range(5, 3, 100), Some((3, 4)));
        assert_eq!(list_range(5, -2, -1), Some((3, 4)));
        assert_eq!(list_range(5, 5, 10), None);
        assert_eq!(list_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn lpush_capped_keeps_newest_entries() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.lpush_capped("points", &i.to_string(), 3).await?;
        }
        assert_eq!(store.lrange("points", 0, -1).await?, vec!["4", "3", "2"]);
        assert_eq!(store.lindex("points", 0).await?.as_deref(), Some("4"));
        assert_eq!(store.lindex("points", -1).await?.as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_type_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.set("k", "v").await?;
        let err = store.lrange("k", 0, -1).await.unwrap_err();
        assert_eq!(err, StoreError::WrongType { key: "k".to_string() });
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_disappear() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.set("session", "abc").await?;
        assert!(store.expire("session", Duration::from_secs(1)).await?);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.get("session").await?, None);
        assert!(!store.del("session").await?);
        Ok(())
    }

    #[tokio::test]
    async fn hash_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store.hset("settings", "x", "40").await?;
        store.hset("settings", "y", "60").await?;
        let all = store.hgetall("settings").await?;
        assert_eq!(all.get("x").map(String::as_str), Some("40"));
        assert_eq!(all.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn publish_reaches_exact_and_pattern_subscribers() -> Result<(), Box<dyn std::error::Error>>
    {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreMessage>();
        let conn = store.open_subscriber(tx.into()).await?;
        conn.subscribe("series:light:add").await?;
        conn.psubscribe("series:*:add").await?;

        assert_eq!(store.publish("series:light:add", "[1,2]").await?, 2);
        assert_eq!(
            rx.recv().await,
            Some(StoreMessage::Message {
                channel: "series:light:add".to_string(),
                payload: "[1,2]".to_string(),
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(StoreMessage::PatternMessage { pattern, .. }) if pattern == "series:*:add"
        ));

        conn.unsubscribe("series:light:add").await?;
        conn.punsubscribe("series:*:add").await?;
        assert_eq!(store.publish("series:light:add", "[1,2]").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn offline_store_fails_commands() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.publish("c", "1").await,
            Err(StoreError::Connection(_))
        ));
        store.set_offline(false);
        assert!(store.publish("c", "1").await.is_ok());
    }

    #[tokio::test]
    async fn dropping_subscriber_closes_sink() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreMessage>();
        let conn = store.open_subscriber(tx.into()).await?;
        conn.subscribe("c").await?;
        drop(conn);
        assert!(!store.has_subscription("c"));
        assert_eq!(rx.recv().await, None);
        Ok(())
    }
}

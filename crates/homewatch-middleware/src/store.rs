//! The backing-store capability.
//!
//! The bus and the series store never talk to a concrete database.  They are
//! handed a [`Store`] (the command connection) and, through it, open one
//! [`SubscriberConnection`] (the connection parked in subscribe mode).  A
//! connection in subscribe mode cannot issue ordinary commands, which is why
//! the two are separate.
//!
//! Messages for the subscriber connection are pushed into the
//! [`MessageSink`] supplied when it is opened.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use homewatch_types::StoreError;
use tokio::sync::mpsc;

/// Traffic delivered to a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    /// Published on a channel the connection subscribed to exactly.
    Message { channel: String, payload: String },
    /// Published on a channel matching a pattern the connection subscribed to.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: String,
    },
}

/// Where a subscriber connection delivers its messages.
///
/// The receiving side sees each message at the moment the connection hands
/// it over, which is what lets the bus tell messages received before a
/// handler registered from those received after.
#[derive(Clone)]
pub struct MessageSink {
    deliver: Arc<dyn Fn(StoreMessage) -> Result<(), StoreMessage> + Send + Sync>,
}

impl MessageSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(StoreMessage) -> Result<(), StoreMessage> + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Hand over one message.  `Err` gives it back once the receiving side
    /// is gone.
    pub fn send(&self, message: StoreMessage) -> Result<(), StoreMessage> {
        (self.deliver)(message)
    }
}

impl fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSink").finish_non_exhaustive()
    }
}

impl From<mpsc::UnboundedSender<StoreMessage>> for MessageSink {
    fn from(tx: mpsc::UnboundedSender<StoreMessage>) -> Self {
        Self::new(move |message| tx.send(message).map_err(|e| e.0))
    }
}

/// Command connection of the backing store.
///
/// Every method may suspend; every failure is a [`StoreError`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns `true` when the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns `true` when the key exists and the timeout was applied.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Push `value` to the head of the list at `key` and trim the list to
    /// `max_len` entries, as one atomic transaction.
    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize)
    -> Result<(), StoreError>;

    /// Inclusive range read; negative indices count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>, StoreError>;

    /// Returns the number of subscriber connections that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Open the subscribe-mode connection.  Messages flow into `sink` until
    /// the returned connection is dropped.
    async fn open_subscriber(
        &self,
        sink: MessageSink,
    ) -> Result<Box<dyn SubscriberConnection>, StoreError>;
}

/// A connection parked in subscribe mode.
///
/// Each call resolves once the store has acknowledged the change, so a
/// message published after `subscribe` returns is guaranteed to be delivered.
#[async_trait]
pub trait SubscriberConnection: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), StoreError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError>;

    async fn psubscribe(&self, pattern: &str) -> Result<(), StoreError>;

    async fn punsubscribe(&self, pattern: &str) -> Result<(), StoreError>;
}

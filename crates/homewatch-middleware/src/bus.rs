//! Store-backed publish/subscribe bus.
//!
//! Every message is JSON-encoded and relayed through the backing [`Store`],
//! so subscribers in other processes sharing the store see it as well as
//! local ones.  Locally, a [`Bus`] keeps one [`CallbackRegistry`] for exact
//! channels and one for glob patterns; the two are separate namespaces.
//!
//! # Physical subscriptions
//!
//! The store-level subscription for a channel is reference counted by the
//! number of local handlers.  It moves through [`PhysicalState`]:
//!
//! ```text
//! Unsubscribed ─(first handler)→ Subscribing ─(store ack)→ Subscribed
//! Subscribed ─(last handler gone)→ Unsubscribing ─(store ack)→ Unsubscribed
//! ```
//!
//! Transitions happen only when the count crosses zero and are serialized,
//! so concurrent activations never issue duplicate subscribes.
//!
//! # Delivery window
//!
//! A handler sees exactly the messages the subscriber connection received
//! after the handler was registered.  Each incoming message is stamped with
//! the next handler id at the moment it arrives, and is dispatched only to
//! handlers with a smaller id, even when it is still queued when a later
//! handler joins an already subscribed channel.
//!
//! # Consuming
//!
//! [`Bus::on`] / [`Bus::pattern_on`] return a lazy [`Source`].  Nothing is
//! registered until [`Source::activate`] (stream of [`Delivery`]) or
//! [`Source::listen`] (callback) is awaited, and both resolve only once the
//! physical subscription is confirmed.  A source can be activated any number
//! of times.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use homewatch_types::{BusError, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, mpsc};
use tracing::{debug, error, warn};

use crate::registry::{CallbackRegistry, HandlerId};
use crate::store::{MessageSink, Store, StoreMessage, SubscriberConnection};

/// Exact channel names and glob patterns are distinct namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Matches one channel name literally.
    Exact,
    /// Matches every channel accepted by a glob pattern.
    Pattern,
}

/// State of the store-level subscription backing one channel or pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalState {
    /// No store-level subscription exists.
    Unsubscribed,
    /// Subscribe issued, store acknowledgement pending.
    Subscribing,
    /// The store delivers traffic for the channel.
    Subscribed,
    /// Unsubscribe issued, store acknowledgement pending.
    Unsubscribing,
}

/// One decoded message handed to a local handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The concrete channel the message was published on (for pattern
    /// subscriptions this is the matched channel, not the pattern).
    pub channel: String,
    pub data: Value,
}

impl Delivery {
    /// Decode the message body into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            BusError::Decode(format!("{} on {}", e, self.channel))
        })
    }
}

/// Local message handler.
pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    exact: CallbackRegistry<Handler>,
    pattern: CallbackRegistry<Handler>,
}

impl Handlers {
    fn registry(&self, mode: ChannelMode) -> &CallbackRegistry<Handler> {
        match mode {
            ChannelMode::Exact => &self.exact,
            ChannelMode::Pattern => &self.pattern,
        }
    }

    fn registry_mut(&mut self, mode: ChannelMode) -> &mut CallbackRegistry<Handler> {
        match mode {
            ChannelMode::Exact => &mut self.exact,
            ChannelMode::Pattern => &mut self.pattern,
        }
    }
}

struct BusInner {
    store: Arc<dyn Store>,
    // Opened on first subscribe and held for the lifetime of the bus.
    subscriber: OnceCell<Box<dyn SubscriberConnection>>,
    handlers: Mutex<Handlers>,
    physical: AsyncMutex<HashMap<(ChannelMode, String), PhysicalState>>,
    /// Next handler id; also the stamp given to arriving messages.
    next_handler: Arc<AtomicU64>,
}

impl BusInner {
    fn dispatch(&self, stamp: HandlerId, message: StoreMessage) {
        let (mode, key, channel, payload) = match message {
            StoreMessage::Message { channel, payload } => {
                (ChannelMode::Exact, channel.clone(), channel, payload)
            }
            StoreMessage::PatternMessage {
                pattern,
                channel,
                payload,
            } => (ChannelMode::Pattern, pattern, channel, payload),
        };

        let data = match serde_json::from_str::<Value>(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(channel = %channel, error = %e, "dropping undecodable bus message");
                return;
            }
        };

        let handlers = self
            .handlers
            .lock()
            .registry(mode)
            .handlers_before(&key, stamp);
        let delivery = Delivery { channel, data };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| (*handler)(&delivery))).is_err() {
                error!(
                    channel = %delivery.channel,
                    "bus handler panicked; delivery continues to remaining handlers"
                );
            }
        }
    }
}

async fn dispatch_loop(
    inner: Weak<BusInner>,
    mut rx: mpsc::UnboundedReceiver<(HandlerId, StoreMessage)>,
) {
    while let Some((stamp, message)) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(stamp, message);
    }
    debug!("bus dispatcher stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Bus
// ────────────────────────────────────────────────────────────────────────────

/// Publish/subscribe bus over a backing [`Store`].  Clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscriber_open", &self.inner.subscriber.initialized())
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Create a bus issuing commands over `store`.  The subscriber
    /// connection is opened lazily.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                subscriber: OnceCell::new(),
                handlers: Mutex::new(Handlers::default()),
                physical: AsyncMutex::new(HashMap::new()),
                next_handler: Arc::new(AtomicU64::new(1)),
            }),
        }
    }

    /// The command connection this bus publishes through.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// JSON-encode `message` and publish it on `channel`.
    ///
    /// Fire-and-forget: encoding or store failures drop the message and are
    /// logged, never returned.
    pub async fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) {
        if let Err(e) = self.try_publish(channel, message).await {
            warn!(channel, error = %e, "dropping message");
        }
    }

    /// Like [`Bus::publish`] but reports failures.  Returns the number of
    /// subscriber connections that received the message.
    pub async fn try_publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        message: &T,
    ) -> Result<usize, BusError> {
        let json = serde_json::to_string(message)
            .map_err(|e| BusError::Encode(format!("{e} on {channel}")))?;
        Ok(self.inner.store.publish(channel, &json).await?)
    }

    /// Lazy source of messages published on exactly `channel`.
    pub fn on(&self, channel: impl Into<String>) -> Source {
        Source {
            bus: self.clone(),
            mode: ChannelMode::Exact,
            channel: channel.into(),
        }
    }

    /// Lazy source of messages published on any channel matching the glob
    /// `pattern`.
    pub fn pattern_on(&self, pattern: impl Into<String>) -> Source {
        Source {
            bus: self.clone(),
            mode: ChannelMode::Pattern,
            channel: pattern.into(),
        }
    }

    /// Number of live local handlers on `channel`.
    pub fn handler_count(&self, mode: ChannelMode, channel: &str) -> usize {
        self.inner.handlers.lock().registry(mode).count(channel)
    }

    /// Current state of the store-level subscription for `channel`.
    pub async fn physical_state(&self, mode: ChannelMode, channel: &str) -> PhysicalState {
        self.inner
            .physical
            .lock()
            .await
            .get(&(mode, channel.to_string()))
            .copied()
            .unwrap_or(PhysicalState::Unsubscribed)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn subscriber(&self) -> Result<&dyn SubscriberConnection, BusError> {
        let conn = self
            .inner
            .subscriber
            .get_or_try_init(|| async {
                let (tx, rx) = mpsc::unbounded_channel();
                let next_handler = Arc::clone(&self.inner.next_handler);
                let sink = MessageSink::new(move |message| {
                    let stamp = next_handler.load(Ordering::SeqCst);
                    tx.send((stamp, message)).map_err(|e| e.0.1)
                });
                let conn = self.inner.store.open_subscriber(sink).await?;
                tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), rx));
                debug!("bus subscriber connection opened");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.as_ref())
    }

    async fn physical_subscribe(&self, mode: ChannelMode, channel: &str) -> Result<(), BusError> {
        let conn = self.subscriber().await?;
        match mode {
            ChannelMode::Exact => conn.subscribe(channel).await?,
            ChannelMode::Pattern => conn.psubscribe(channel).await?,
        }
        Ok(())
    }

    async fn physical_unsubscribe(&self, mode: ChannelMode, channel: &str) -> Result<(), BusError> {
        let conn = self.subscriber().await?;
        match mode {
            ChannelMode::Exact => conn.unsubscribe(channel).await?,
            ChannelMode::Pattern => conn.punsubscribe(channel).await?,
        }
        Ok(())
    }

    async fn add_handler(
        &self,
        mode: ChannelMode,
        channel: &str,
        handler: Handler,
    ) -> Result<HandlerId, BusError> {
        let id = self.inner.next_handler.fetch_add(1, Ordering::SeqCst);
        let mut physical = self.inner.physical.lock().await;

        self.inner
            .handlers
            .lock()
            .registry_mut(mode)
            .add(channel, id, handler);

        let key = (mode, channel.to_string());
        if physical.get(&key) == Some(&PhysicalState::Subscribed) {
            return Ok(id);
        }

        physical.insert(key.clone(), PhysicalState::Subscribing);
        debug!(channel, ?mode, "physical subscribe");
        match self.physical_subscribe(mode, channel).await {
            Ok(()) => {
                physical.insert(key, PhysicalState::Subscribed);
                Ok(id)
            }
            Err(e) => {
                physical.remove(&key);
                self.inner
                    .handlers
                    .lock()
                    .registry_mut(mode)
                    .remove(channel, id);
                Err(e)
            }
        }
    }

    /// Unregister a handler; returns `true` if the channel has no handlers
    /// left.
    fn unregister(&self, mode: ChannelMode, channel: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let registry = handlers.registry_mut(mode);
        registry.remove(channel, id) && registry.count(channel) == 0
    }

    async fn remove_handler(
        &self,
        mode: ChannelMode,
        channel: &str,
        id: HandlerId,
    ) -> Result<(), BusError> {
        if self.unregister(mode, channel, id) {
            self.release_if_unused(mode, channel).await
        } else {
            Ok(())
        }
    }

    /// Synchronous teardown used from `Drop`: the handler stops receiving
    /// immediately, the physical unsubscribe runs on the runtime.
    fn detach(&self, mode: ChannelMode, channel: &str, id: HandlerId) {
        if !self.unregister(mode, channel, id) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                let channel = channel.to_string();
                handle.spawn(async move {
                    if let Err(e) = bus.release_if_unused(mode, &channel).await {
                        warn!(channel = %channel, error = %e, "physical unsubscribe failed");
                    }
                });
            }
            Err(_) => {
                warn!(channel, "no runtime available; physical subscription left in place");
            }
        }
    }

    async fn release_if_unused(&self, mode: ChannelMode, channel: &str) -> Result<(), BusError> {
        let mut physical = self.inner.physical.lock().await;
        // Re-check under the lock: a new handler may have arrived meanwhile.
        if self.handler_count(mode, channel) > 0 {
            return Ok(());
        }
        let key = (mode, channel.to_string());
        if physical.get(&key) != Some(&PhysicalState::Subscribed) {
            return Ok(());
        }

        physical.insert(key.clone(), PhysicalState::Unsubscribing);
        debug!(channel, ?mode, "physical unsubscribe");
        match self.physical_unsubscribe(mode, channel).await {
            Ok(()) => {
                physical.remove(&key);
                Ok(())
            }
            Err(e) => {
                physical.insert(key, PhysicalState::Subscribed);
                Err(e)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Source / Listener / Subscription
// ────────────────────────────────────────────────────────────────────────────

/// Lazy, restartable message source returned by [`Bus::on`] and
/// [`Bus::pattern_on`].
#[derive(Clone, Debug)]
pub struct Source {
    bus: Bus,
    mode: ChannelMode,
    channel: String,
}

impl Source {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Register `handler`; it runs on the bus dispatcher for every message
    /// until the returned [`Listener`] is cancelled or dropped.
    pub async fn listen<F>(&self, handler: F) -> Result<Listener, BusError>
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let id = self
            .bus
            .add_handler(self.mode, &self.channel, Arc::new(handler))
            .await?;
        Ok(Listener {
            bus: self.bus.clone(),
            mode: self.mode,
            channel: self.channel.clone(),
            id: Some(id),
        })
    }

    /// Register a stream consumer.
    pub async fn activate(&self) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self
            .listen(move |delivery| {
                // The receiver only goes away together with the listener.
                let _ = tx.send(delivery.clone());
            })
            .await?;
        Ok(Subscription { listener, rx })
    }
}

/// Teardown handle of one registered handler.
///
/// Dropping it unregisters the handler at once and schedules the physical
/// unsubscribe; [`Listener::cancel`] does both before returning.
pub struct Listener {
    bus: Bus,
    mode: ChannelMode,
    channel: String,
    id: Option<HandlerId>,
}

impl Listener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn cancel(mut self) -> Result<(), BusError> {
        match self.id.take() {
            Some(id) => self.bus.remove_handler(self.mode, &self.channel, id).await,
            None => Ok(()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.detach(self.mode, &self.channel, id);
        }
    }
}

/// Stream of [`Delivery`] values from one activation of a [`Source`].
pub struct Subscription {
    listener: Listener,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        self.listener.channel()
    }

    /// Next message, in publish order.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub async fn cancel(self) -> Result<(), BusError> {
        self.listener.cancel().await
    }
}

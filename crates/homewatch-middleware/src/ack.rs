//! Request/response over one-way publish/subscribe.
//!
//! A request on base channel `C` gets a fresh UUID `ID`.  The requester
//! listens on `C:ID:reply` and publishes the payload on `C:ID:ack`; a
//! responder pattern-subscribes to `C:<36 × ?>:ack` and answers on the reply
//! channel derived from the concrete channel it received on.
//!
//! ```text
//! requester                          responder
//!   on(C:ID:reply).activate()
//!   publish(C:ID:ack, payload)  ───▶  pattern_on(C:????…:ack)
//!                               ◀───  publish(C:ID:reply, response)
//! ```

use std::time::Duration;

use homewatch_types::BusError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{Bus, Source, Subscription};

/// Reply window used when callers have no stronger opinion.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Length of a hyphenated UUID, the id segment of derived channels.
const ID_LEN: usize = 36;

pub fn ack_channel(base: &str, id: &str) -> String {
    format!("{base}:{id}:ack")
}

pub fn reply_channel(base: &str, id: &str) -> String {
    format!("{base}:{id}:reply")
}

/// Pattern matching the request channel of any id on `base`.
pub fn ack_pattern(base: &str) -> String {
    format!("{base}:{}:ack", "?".repeat(ID_LEN))
}

/// Derive the reply channel from a concrete request channel by swapping the
/// trailing `:ack` segment for `:reply`, keeping the embedded id.
pub fn reply_channel_for(ack_channel: &str) -> Option<String> {
    let prefix = ack_channel.strip_suffix(":ack")?;
    let (_, id) = prefix.rsplit_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some(format!("{prefix}:reply"))
}

impl Bus {
    /// Publish `payload` as a request on `channel` and wait for the first
    /// reply.
    ///
    /// Resolves with the reply body, or fails with [`BusError::Timeout`] when
    /// nothing arrives within `timeout`.  A payload that cannot be encoded, or
    /// a store that refuses the request, fails at once.  Whichever happens first settles the
    /// call; the temporary reply handler is removed exactly once, so a late
    /// reply has no effect.
    pub async fn ack_publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let id = Uuid::new_v4().to_string();
        let reply = reply_channel(channel, &id);

        // Listen before asking so a fast responder cannot be missed.
        let mut replies = self.on(reply.clone()).activate().await?;
        if let Err(e) = self.try_publish(&ack_channel(channel, &id), payload).await {
            if let Err(cancel) = replies.cancel().await {
                warn!(channel = %reply, error = %cancel, "failed to release reply subscription");
            }
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, replies.recv()).await;
        if let Err(e) = replies.cancel().await {
            warn!(channel = %reply, error = %e, "failed to release reply subscription");
        }

        match outcome {
            Ok(Some(delivery)) => Ok(delivery.data),
            Ok(None) => Err(BusError::Protocol(format!(
                "reply subscription on {reply} closed"
            ))),
            Err(_) => Err(BusError::Timeout {
                channel: reply,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Lazy source of requests sent with [`Bus::ack_publish`] on `channel`.
    pub fn ack_on(&self, channel: &str) -> AckSource {
        AckSource {
            bus: self.clone(),
            source: self.pattern_on(ack_pattern(channel)),
        }
    }
}

/// Lazy source returned by [`Bus::ack_on`].
#[derive(Clone, Debug)]
pub struct AckSource {
    bus: Bus,
    source: Source,
}

impl AckSource {
    pub fn pattern(&self) -> &str {
        self.source.channel()
    }

    pub async fn activate(&self) -> Result<AckListener, BusError> {
        Ok(AckListener {
            bus: self.bus.clone(),
            subscription: self.source.activate().await?,
        })
    }
}

/// Stream of incoming requests.
pub struct AckListener {
    bus: Bus,
    subscription: Subscription,
}

impl AckListener {
    /// Next request; `None` once the listener is torn down.
    pub async fn recv(&mut self) -> Option<AckRequest> {
        loop {
            let delivery = self.subscription.recv().await?;
            match reply_channel_for(&delivery.channel) {
                Some(reply_channel) => {
                    return Some(AckRequest {
                        data: delivery.data,
                        reply_channel,
                        bus: self.bus.clone(),
                    });
                }
                None => {
                    warn!(channel = %delivery.channel, "ignoring request on malformed ack channel");
                }
            }
        }
    }

    pub async fn cancel(self) -> Result<(), BusError> {
        self.subscription.cancel().await
    }
}

/// One request awaiting its answer.
///
/// The responder should call [`AckRequest::ack`] once; repeated calls are
/// not guarded and simply publish again.
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub data: Value,
    reply_channel: String,
    bus: Bus,
}

impl AckRequest {
    pub fn reply_channel(&self) -> &str {
        &self.reply_channel
    }

    /// Decode the request body into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| BusError::Decode(format!("{} on {}", e, self.reply_channel)))
    }

    pub async fn ack<T: Serialize + ?Sized>(&self, response: &T) {
        self.bus.publish(&self.reply_channel, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn reply_channel_keeps_embedded_id() {
        let id = "ABCD-1234-0000-0000-000000000000-abc";
        assert_eq!(
            reply_channel_for(&format!("topic:{id}:ack")).as_deref(),
            Some(format!("topic:{id}:reply").as_str())
        );
        assert_eq!(
            reply_channel_for("camera:x:5f0c:ack").as_deref(),
            Some("camera:x:5f0c:reply")
        );
        assert_eq!(reply_channel_for("topic:id:reply"), None);
        assert_eq!(reply_channel_for("ack"), None);
    }

    #[test]
    fn derived_channel_names() {
        assert_eq!(ack_channel("camera:x", "42"), "camera:x:42:ack");
        assert_eq!(reply_channel("camera:x", "42"), "camera:x:42:reply");
        assert_eq!(ack_pattern("c"), format!("c:{}:ack", "?".repeat(36)));
    }

    async fn spawn_responder(bus: &Bus, channel: &str, replies: Vec<Value>, delay: Duration)
    -> Result<tokio::task::JoinHandle<Option<String>>, BusError> {
        let mut listener = bus.ack_on(channel).activate().await?;
        Ok(tokio::spawn(async move {
            let request = listener.recv().await?;
            tokio::time::sleep(delay).await;
            for reply in &replies {
                request.ack(reply).await;
            }
            Some(request.reply_channel().to_string())
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn ack_publish_resolves_with_first_reply() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let requester = Bus::new(Arc::new(store.clone()));
        let responder = Bus::new(Arc::new(store.clone()));
        spawn_responder(
            &responder,
            "camera:x",
            vec![json!({ "success": true }), json!({ "success": false })],
            Duration::ZERO,
        )
        .await?;

        let reply = requester
            .ack_publish("camera:x", &json!({ "value": 30 }), DEFAULT_ACK_TIMEOUT)
            .await?;
        assert_eq!(reply, json!({ "success": true }));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn responder_sees_request_payload() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store));
        let mut listener = bus.ack_on("camera:ir").activate().await?;

        let echo = tokio::spawn(async move {
            let request = listener.recv().await?;
            let value = request.data["value"].clone();
            request.ack(&json!({ "echo": value })).await;
            Some(())
        });

        let reply = bus
            .ack_publish("camera:ir", &json!({ "value": 77 }), DEFAULT_ACK_TIMEOUT)
            .await?;
        assert_eq!(reply["echo"], 77);
        echo.await?.ok_or("responder ended early")?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn ack_publish_times_out_without_reply() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store.clone()));

        let started = tokio::time::Instant::now();
        let result = bus
            .ack_publish("camera:y", &json!({ "value": 1 }), Duration::from_millis(1000))
            .await;

        assert!(matches!(result, Err(BusError::Timeout { timeout_ms: 1000, .. })));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_request_fails_without_waiting() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store.clone()));
        let mut payload = std::collections::HashMap::new();
        payload.insert((1, 2), 3);

        let started = tokio::time::Instant::now();
        let result = bus.ack_publish("camera:x", &payload, DEFAULT_ACK_TIMEOUT).await;

        assert!(matches!(result, Err(BusError::Encode(_))));
        assert!(started.elapsed() < DEFAULT_ACK_TIMEOUT);
        assert_eq!(store.subscribe_calls(), store.unsubscribe_calls());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_listener_releases_pattern_subscription()
    -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store.clone()));
        let pattern = ack_pattern("camera:x");

        let first = bus.ack_on("camera:x").activate().await?;
        let second = bus.ack_on("camera:x").activate().await?;
        assert!(store.has_pattern_subscription(&pattern));

        first.cancel().await?;
        assert!(store.has_pattern_subscription(&pattern));

        second.cancel().await?;
        assert!(!store.has_pattern_subscription(&pattern));
        assert_eq!(bus.handler_count(crate::ChannelMode::Pattern, &pattern), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_listener_releases_pattern_subscription()
    -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store.clone()));
        let pattern = ack_pattern("camera:ir");

        let listener = bus.ack_on("camera:ir").activate().await?;
        assert!(store.has_pattern_subscription(&pattern));
        drop(listener);

        tokio::time::timeout(Duration::from_secs(1), async {
            while store.has_pattern_subscription(&pattern) {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn request_body_decodes_into_typed_value() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let bus = Bus::new(Arc::new(store));
        let mut listener = bus.ack_on("camera:y").activate().await?;

        bus.publish(&ack_channel("camera:y", "0b4f6f0e-5c2d-4d6e-9a43-2f1f4f0d8a11"), &json!({ "value": 12 }))
            .await;
        let request = listener.recv().await.ok_or("listener closed")?;

        let parsed: std::collections::HashMap<String, i64> = request.parse()?;
        assert_eq!(parsed.get("value"), Some(&12));
        assert!(matches!(request.parse::<Vec<String>>(), Err(BusError::Decode(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_has_no_effect() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        let requester = Bus::new(Arc::new(store.clone()));
        let responder = Bus::new(Arc::new(store.clone()));
        let late = spawn_responder(
            &responder,
            "camera:x",
            vec![json!({ "success": true })],
            Duration::from_millis(2000),
        )
        .await?;

        let result = requester
            .ack_publish("camera:x", &json!({ "value": 5 }), Duration::from_millis(1000))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));

        let reply_channel = late.await?.ok_or("responder ended early")?;
        assert!(!store.has_subscription(&reply_channel));
        Ok(())
    }
}

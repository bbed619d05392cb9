//! `homewatch-middleware` – the message backbone.
//!
//! Relays readings and commands between sensor loops, the series store and
//! actuator services through a shared backing store.
//!
//! # Modules
//!
//! - [`store`] – the backing-store capability: [`Store`] (command
//!   connection) and [`SubscriberConnection`] (subscribe-mode connection).
//! - [`redis_store`] – [`RedisStore`], the production store on a Redis
//!   server.
//! - [`memory_store`] – [`MemoryStore`], an in-process stand-in with glob
//!   pattern matching, used by tests.
//! - [`registry`] – [`CallbackRegistry`], the per-channel handler multiset.
//! - [`bus`] – [`Bus`], publish/subscribe with ref-counted physical
//!   subscriptions.
//! - [`ack`] – request/response (`ack_publish` / `ack_on`) over the bus.

pub mod ack;
pub mod bus;
pub mod memory_store;
pub mod redis_store;
pub mod registry;
pub mod store;

pub use ack::{AckListener, AckRequest, AckSource, DEFAULT_ACK_TIMEOUT};
pub use bus::{Bus, ChannelMode, Delivery, Listener, PhysicalState, Source, Subscription};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use registry::{CallbackRegistry, HandlerId};
pub use store::{MessageSink, Store, StoreMessage, SubscriberConnection};

//! [`CallbackRegistry`] – per-channel multiset of local handlers.
//!
//! Handlers are keyed by a caller-chosen [`HandlerId`], so the same closure
//! may be registered twice under different ids.  Ids are expected to grow
//! with registration time; iteration order for one channel is registration
//! order.

use std::collections::HashMap;

/// Identifier of one registered handler.
pub type HandlerId = u64;

#[derive(Debug)]
pub struct CallbackRegistry<H> {
    channels: HashMap<String, Vec<(HandlerId, H)>>,
}

impl<H> Default for CallbackRegistry<H> {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }
}

impl<H: Clone> CallbackRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id` on `channel`.
    ///
    /// Returns `true` when the channel's handler count grew; re-adding an id
    /// that is already present is a no-op.
    pub fn add(&mut self, channel: &str, id: HandlerId, handler: H) -> bool {
        let handlers = self.channels.entry(channel.to_string()).or_default();
        if handlers.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        handlers.push((id, handler));
        true
    }

    /// Remove the handler registered under `id` on `channel`.
    ///
    /// Returns `true` when something was removed.  The channel entry is
    /// dropped once its last handler goes.
    pub fn remove(&mut self, channel: &str, id: HandlerId) -> bool {
        let Some(handlers) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() < before;
        if handlers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Snapshot of the handlers on `channel` whose id is below `bound`, in
    /// registration order.
    pub fn handlers_before(&self, channel: &str, bound: HandlerId) -> Vec<H> {
        self.channels
            .get(channel)
            .map(|handlers| {
                handlers
                    .iter()
                    .filter(|(id, _)| *id < bound)
                    .map(|(_, h)| h.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }
}

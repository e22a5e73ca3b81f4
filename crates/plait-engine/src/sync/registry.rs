//! Global registry of live channels
//!
//! Channels are referenced by stable IDs from blocked tasklets and portable
//! continuations; the registry resolves an ID back to the channel. It holds
//! weak references so a channel's lifetime stays with its `Arc` owners.

use crate::sync::{Channel, ChannelId};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};

static CHANNELS: Lazy<DashMap<ChannelId, Weak<Channel>>> = Lazy::new(DashMap::new);

/// Register a channel (called on construction)
pub(crate) fn register(channel: &Arc<Channel>) {
    CHANNELS.insert(channel.id(), Arc::downgrade(channel));
}

/// Look up a live channel by ID
pub fn lookup(id: ChannelId) -> Option<Arc<Channel>> {
    let entry = CHANNELS.get(&id)?;
    match entry.upgrade() {
        Some(channel) => Some(channel),
        None => {
            drop(entry);
            CHANNELS.remove(&id);
            None
        }
    }
}

/// Number of registered (possibly dropped) channel slots
pub fn count() -> usize {
    CHANNELS.len()
}

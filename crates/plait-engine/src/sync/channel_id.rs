//! Unique identifier for channels

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    /// Generate a new unique ChannelId
    pub fn new() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a ChannelId from a u64 value (for deserialization)
    pub fn from_u64(id: u64) -> Self {
        ChannelId(id)
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

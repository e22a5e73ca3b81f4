//! Synchronization primitives: channels and the channel registry

mod channel;
mod channel_id;
pub mod registry;

pub use channel::{Channel, Dir, Messages, Preference};
pub(crate) use channel::{ReceiveOutcome, SendOutcome};
pub use channel_id::ChannelId;

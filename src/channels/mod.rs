//! Chat-platform adapter(s). The core only depends on the
//! [`crate::collaborators`] traits; this module holds the reference
//! implementation that backs them for Discord.

#[cfg(feature = "channels-discord")]
pub mod discord;

#[cfg(feature = "channels-discord")]
pub use discord::{DiscordChannel, DiscordConfig};

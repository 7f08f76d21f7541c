//! Telegram channel for relay.
//!
//! Long-polls the Bot API with teloxide, hands text and slash commands to a
//! [`relay_channels::ChannelEventSink`] and implements
//! [`relay_channels::ChannelOutbound`] for replies.

pub mod bot;
pub mod error;
pub mod handlers;
pub mod outbound;

#[cfg(test)]
mod mock_api;

pub use {
    bot::TelegramBot,
    error::{Error, Result},
    outbound::TelegramOutbound,
};

//! Channel contracts.
//!
//! A channel (Telegram, the local console) implements [`ChannelOutbound`] so
//! the runner can deliver text and liveness indicators without knowing the
//! platform. Inbound messages flow the other way through
//! [`ChannelEventSink`].

pub mod error;
pub mod plugin;

pub use {
    error::{Error, Result},
    plugin::{ChannelEventSink, ChannelOutbound, ChannelReplyTarget, ChannelType, TaskSubmission},
};

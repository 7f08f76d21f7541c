use {async_trait::async_trait, serde::Serialize};

use crate::Result;

/// Messaging platform a conversation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Telegram,
    Console,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Telegram => f.write_str("telegram"),
            Self::Console => f.write_str("console"),
        }
    }
}

/// Where replies for an inbound message go.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ChannelReplyTarget {
    pub channel_type: ChannelType,
    /// Chat/peer ID; doubles as the conversation identifier.
    pub chat_id: String,
}

/// Outcome of handing a task to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSubmission {
    /// A worker was started; replies arrive asynchronously.
    Started,
    /// The conversation already has a task in flight.
    Busy,
    /// Nothing to run after trimming.
    Empty,
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Send one message. The caller keeps `text` under the platform limit.
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    /// Send a "typing" indicator. No-op by default.
    async fn send_typing(&self, _to: &str) -> Result<()> {
        Ok(())
    }
}

/// Receives inbound traffic from a channel; the runner implements it.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    /// Submit free text as a task for the conversation behind `reply_to`.
    async fn dispatch_task(&self, text: &str, reply_to: ChannelReplyTarget) -> TaskSubmission;

    /// Run a slash command (without the leading `/`) and return the reply.
    async fn dispatch_command(&self, command: &str, args: &str, reply_to: ChannelReplyTarget)
    -> String;
}

//! Local channel for `relay run`: everything the runner delivers is printed
//! to stdout.

use std::io::Write;

use {
    async_trait::async_trait,
    relay_channels::{ChannelOutbound, Error, Result},
};

/// Conversation id used for tasks started from the terminal.
pub const CONSOLE_CONVERSATION: &str = "console";

#[derive(Debug, Default)]
pub struct ConsoleOutbound;

#[async_trait]
impl ChannelOutbound for ConsoleOutbound {
    async fn send_text(&self, _to: &str, text: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}\n")
            .and_then(|()| stdout.flush())
            .map_err(|e| Error::transport("console write", e))
    }
}

//! Inbound dispatch: free text becomes a task, slash commands are answered
//! from the registry.

use std::{fmt::Write as _, sync::Arc};

use {
    async_trait::async_trait,
    relay_channels::{ChannelEventSink, ChannelReplyTarget, TaskSubmission},
    relay_common::text::truncate_with_ellipsis,
    tracing::debug,
};

use crate::controller::TaskController;

/// Commands advertised to chat platforms, with their descriptions.
pub const COMMANDS: &[(&str, &str)] = &[
    ("start", "Show the welcome message"),
    ("help", "List commands"),
    ("new", "Start a fresh session and forget past tasks"),
    ("status", "Show whether a task is running"),
    ("history", "Show recently finished tasks"),
];

const HISTORY_TASK_CHARS: usize = 80;
const HISTORY_RESULT_CHARS: usize = 160;

/// Bridges channel traffic to a [`TaskController`].
#[derive(Clone)]
pub struct RelayDispatcher {
    controller: Arc<TaskController>,
}

impl RelayDispatcher {
    #[must_use]
    pub fn new(controller: Arc<TaskController>) -> Self {
        Self { controller }
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<TaskController> {
        &self.controller
    }

    fn welcome(&self) -> String {
        format!(
            "👋 Send me a task and I will run it with {} and stream the progress here.\n\n{}",
            self.controller.invocation().program,
            help_text()
        )
    }

    fn status(&self, conversation_id: &str) -> String {
        let registry = self.controller.registry();
        let remembered = registry.memory(conversation_id).len();
        if registry.is_running(conversation_id) {
            format!("⏳ A task is running. {remembered} finished task(s) remembered.")
        } else {
            format!("✅ Idle. {remembered} finished task(s) remembered.")
        }
    }

    fn history(&self, conversation_id: &str) -> String {
        let memory = self.controller.registry().memory(conversation_id);
        if memory.is_empty() {
            return "No finished tasks yet.".to_string();
        }
        let mut out = String::from("Recent tasks:");
        for (i, entry) in memory.iter().enumerate() {
            let result = if entry.result.is_empty() {
                "(no text output)".to_string()
            } else {
                truncate_with_ellipsis(&entry.result, HISTORY_RESULT_CHARS)
            };
            let _ = write!(
                out,
                "\n\n{}. {}\n→ {}",
                i + 1,
                truncate_with_ellipsis(&entry.task, HISTORY_TASK_CHARS),
                result
            );
        }
        out
    }
}

fn help_text() -> String {
    let mut out = String::from("Commands:");
    for (name, description) in COMMANDS {
        let _ = write!(out, "\n/{name} - {description}");
    }
    out
}

#[async_trait]
impl ChannelEventSink for RelayDispatcher {
    async fn dispatch_task(&self, text: &str, reply_to: ChannelReplyTarget) -> TaskSubmission {
        let submission = self.controller.submit(&reply_to.chat_id, text);
        debug!(
            channel = %reply_to.channel_type,
            chat_id = %reply_to.chat_id,
            ?submission,
            "task dispatched"
        );
        submission
    }

    async fn dispatch_command(
        &self,
        command: &str,
        _args: &str,
        reply_to: ChannelReplyTarget,
    ) -> String {
        let conversation_id = reply_to.chat_id.as_str();
        match command {
            "start" => self.welcome(),
            "help" => help_text(),
            "new" => {
                let dropped = self.controller.registry().clear_memory(conversation_id);
                format!("🆕 New session started. Forgot {dropped} finished task(s).")
            },
            "status" => self.status(conversation_id),
            "history" => self.history(conversation_id),
            other => format!("❓ Unknown command: /{other}. Send /help for the list."),
        }
    }
}

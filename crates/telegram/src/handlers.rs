use {
    relay_channels::{
        ChannelEventSink, ChannelOutbound, ChannelReplyTarget, ChannelType, TaskSubmission,
    },
    teloxide::types::Message,
    tracing::{debug, info},
};

use crate::error::Result;

/// Reply when a task arrives while another one is still running.
pub const BUSY_REPLY: &str = "⏳ A task is already running here. Wait for it to finish, or check /status.";

/// Reply for messages without any text.
pub const TEXT_ONLY_REPLY: &str = "Send the task as a text message.";

/// Handle one inbound message: slash commands are answered by the sink,
/// anything else is submitted as a task.
pub async fn handle_message(
    msg: &Message,
    bot_username: Option<&str>,
    outbound: &dyn ChannelOutbound,
    sink: &dyn ChannelEventSink,
) -> Result<()> {
    let chat_id = msg.chat.id.0.to_string();
    let Some(text) = extract_text(msg) else {
        debug!(chat_id = %chat_id, "ignoring message without text");
        if msg.chat.is_private() {
            outbound.send_text(&chat_id, TEXT_ONLY_REPLY).await?;
        }
        return Ok(());
    };

    let reply_to = ChannelReplyTarget {
        channel_type: ChannelType::Telegram,
        chat_id: chat_id.clone(),
    };

    // Intercept slash commands before treating the text as a task.
    if let Some((command, args)) = parse_command(text, bot_username) {
        info!(chat_id = %chat_id, command = %command, "telegram command");
        let _ = outbound.send_typing(&chat_id).await;
        let reply = sink.dispatch_command(&command, args, reply_to).await;
        if !reply.trim().is_empty() {
            outbound.send_text(&chat_id, &reply).await?;
        }
        return Ok(());
    }

    match sink.dispatch_task(text, reply_to).await {
        TaskSubmission::Started => {
            info!(chat_id = %chat_id, chars = text.chars().count(), "telegram task submitted");
        },
        TaskSubmission::Busy => {
            outbound.send_text(&chat_id, BUSY_REPLY).await?;
        },
        TaskSubmission::Empty => {
            debug!(chat_id = %chat_id, "ignoring blank message");
        },
    }
    Ok(())
}

/// Text content of a message, falling back to a media caption.
fn extract_text(msg: &Message) -> Option<&str> {
    msg.text().or_else(|| msg.caption())
}

/// Split `/cmd@bot args` into a lowercase command name and its arguments.
///
/// Commands addressed to a different bot (`/cmd@other_bot`) are not ours.
fn parse_command<'a>(text: &'a str, bot_username: Option<&str>) -> Option<(String, &'a str)> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let (name, target) = match head.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (head, None),
    };
    if name.is_empty() {
        return None;
    }
    if let (Some(target), Some(me)) = (target, bot_username)
        && !target.eq_ignore_ascii_case(me)
    {
        return None;
    }
    Some((name.to_ascii_lowercase(), args))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        async_trait::async_trait,
        rstest::rstest,
        serde_json::json,
    };

    use {
        super::*,
        crate::{mock_api::MockTelegramApi, outbound::TelegramOutbound},
    };

    struct MockSink {
        submission: TaskSubmission,
        tasks: Mutex<Vec<String>>,
        commands: Mutex<Vec<(String, String)>>,
    }

    impl MockSink {
        fn new(submission: TaskSubmission) -> Self {
            Self {
                submission,
                tasks: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChannelEventSink for MockSink {
        async fn dispatch_task(&self, text: &str, reply_to: ChannelReplyTarget) -> TaskSubmission {
            assert_eq!(reply_to.channel_type, ChannelType::Telegram);
            self.tasks.lock().unwrap().push(text.to_string());
            self.submission
        }

        async fn dispatch_command(
            &self,
            command: &str,
            args: &str,
            _reply_to: ChannelReplyTarget,
        ) -> String {
            self.commands
                .lock()
                .unwrap()
                .push((command.to_string(), args.to_string()));
            format!("reply to /{command}")
        }
    }

    fn text_message(text: &str) -> Message {
        serde_json::from_value(json!({
            "message_id": 1,
            "date": 1,
            "chat": { "id": 42, "type": "private", "first_name": "Alice" },
            "from": { "id": 1001, "is_bot": false, "first_name": "Alice" },
            "text": text,
        }))
        .expect("deserialize text message")
    }

    #[rstest]
    #[case("/status", Some(("status", "")))]
    #[case("/HELP", Some(("help", "")))]
    #[case("/new please", Some(("new", "please")))]
    #[case("/start@relay_bot", Some(("start", "")))]
    #[case("/start@Relay_Bot  x ", Some(("start", "x")))]
    #[case("/start@other_bot", None)]
    #[case("write hello world", None)]
    #[case("/", None)]
    fn parses_commands(#[case] text: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_command(text, Some("relay_bot"));
        assert_eq!(
            parsed.as_ref().map(|(c, a)| (c.as_str(), *a)),
            expected
        );
    }

    #[tokio::test]
    async fn command_reply_is_sent_and_not_submitted() {
        let api = MockTelegramApi::start().await;
        let outbound = TelegramOutbound::new(api.bot.clone());
        let sink = MockSink::new(TaskSubmission::Started);

        handle_message(&text_message("/status"), Some("relay_bot"), &outbound, &sink)
            .await
            .unwrap();

        assert_eq!(sink.commands.lock().unwrap().as_slice(), &[(
            "status".to_string(),
            String::new()
        )]);
        assert!(sink.tasks.lock().unwrap().is_empty());
        assert_eq!(api.sent_texts(), vec![(42, "reply to /status".to_string())]);
        api.stop().await;
    }

    #[tokio::test]
    async fn text_is_submitted_as_task() {
        let api = MockTelegramApi::start().await;
        let outbound = TelegramOutbound::new(api.bot.clone());
        let sink = MockSink::new(TaskSubmission::Started);

        handle_message(&text_message("write hello world"), None, &outbound, &sink)
            .await
            .unwrap();

        assert_eq!(sink.tasks.lock().unwrap().as_slice(), ["write hello world"]);
        // The runner announces the task itself.
        assert!(api.sent_texts().is_empty());
        api.stop().await;
    }

    #[tokio::test]
    async fn busy_conversation_gets_busy_reply() {
        let api = MockTelegramApi::start().await;
        let outbound = TelegramOutbound::new(api.bot.clone());
        let sink = MockSink::new(TaskSubmission::Busy);

        handle_message(&text_message("another task"), None, &outbound, &sink)
            .await
            .unwrap();

        assert_eq!(api.sent_texts(), vec![(42, BUSY_REPLY.to_string())]);
        api.stop().await;
    }

    #[tokio::test]
    async fn media_without_caption_gets_hint() {
        let api = MockTelegramApi::start().await;
        let outbound = TelegramOutbound::new(api.bot.clone());
        let sink = MockSink::new(TaskSubmission::Started);
        let msg: Message = serde_json::from_value(json!({
            "message_id": 1,
            "date": 1,
            "chat": { "id": 42, "type": "private", "first_name": "Alice" },
            "from": { "id": 1001, "is_bot": false, "first_name": "Alice" },
            "sticker": {
                "file_id": "sticker-id",
                "file_unique_id": "sticker-unique",
                "type": "regular",
                "width": 512,
                "height": 512,
                "is_animated": false,
                "is_video": false
            }
        }))
        .expect("deserialize sticker message");

        handle_message(&msg, None, &outbound, &sink).await.unwrap();

        assert_eq!(api.sent_texts(), vec![(42, TEXT_ONLY_REPLY.to_string())]);
        assert!(sink.tasks.lock().unwrap().is_empty());
        api.stop().await;
    }
}

use std::{future::Future, time::Duration};

use {
    async_trait::async_trait,
    teloxide::{
        RequestError,
        prelude::*,
        types::{ChatAction, ChatId},
    },
    tracing::{debug, warn},
};

use relay_channels::{ChannelOutbound, Error as ChannelError, Result};

/// How often a rate-limited request is retried after waiting out
/// Telegram's `retry_after`.
const TELEGRAM_RETRY_AFTER_MAX_RETRIES: usize = 4;

/// Sends plain-text messages and chat actions for one bot.
#[derive(Clone)]
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    #[must_use]
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn run_telegram_request_with_retry<T, F, Fut>(
        &self,
        to: &str,
        operation: &'static str,
        mut request: F,
    ) -> std::result::Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RequestError>>,
    {
        let mut retries = 0usize;

        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(wait) = retry_after_duration(&err) else {
                        return Err(err);
                    };

                    if retries >= TELEGRAM_RETRY_AFTER_MAX_RETRIES {
                        warn!(
                            chat_id = to,
                            operation,
                            retries,
                            retry_after_secs = wait.as_secs(),
                            "telegram rate limit persisted after retries"
                        );
                        return Err(err);
                    }

                    retries += 1;
                    warn!(
                        chat_id = to,
                        operation,
                        retries,
                        max_retries = TELEGRAM_RETRY_AFTER_MAX_RETRIES,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                },
            }
        }
    }
}

fn parse_chat_id(to: &str) -> Result<ChatId> {
    to.parse::<i64>()
        .map(ChatId)
        .map_err(|_| ChannelError::invalid_input(format!("not a telegram chat id: {to}")))
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

#[async_trait]
impl ChannelOutbound for TelegramOutbound {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        let chat_id = parse_chat_id(to)?;
        self.run_telegram_request_with_retry(to, "send message", || {
            let bot = self.bot.clone();
            let text = text.to_string();
            async move { bot.send_message(chat_id, text).await }
        })
        .await
        .map_err(|e| ChannelError::transport("telegram send message", e))?;
        debug!(chat_id = to, chars = text.chars().count(), "telegram message sent");
        Ok(())
    }

    async fn send_typing(&self, to: &str) -> Result<()> {
        let chat_id = parse_chat_id(to)?;
        self.bot
            .send_chat_action(chat_id, ChatAction::Typing)
            .await
            .map_err(|e| ChannelError::transport("telegram chat action", e))?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    use crate::mock_api::{Captured, MockTelegramApi};

    #[test]
    fn retry_after_duration_extracts_wait() {
        let err = RequestError::RetryAfter(teloxide::types::Seconds::from_seconds(42));
        assert_eq!(retry_after_duration(&err), Some(Duration::from_secs(42)));
    }

    #[test]
    fn retry_after_duration_ignores_other_errors() {
        let err = RequestError::Io(std::io::Error::other("boom"));
        assert_eq!(retry_after_duration(&err), None);
    }

    #[tokio::test]
    async fn sends_plain_text() {
        let api = MockTelegramApi::start().await;
        let outbound = TelegramOutbound::new(api.bot.clone());

        outbound.send_text("42", "**not** parsed").await.unwrap();
        outbound.send_typing("42").await.unwrap();

        let requests = api.requests();
        assert!(requests.iter().any(|r| matches!(
            r,
            Captured::SendMessage(m) if m.chat_id == 42 && m.text == "**not** parsed" && m.parse_mode.is_none()
        )));
        assert!(requests.iter().any(|r| matches!(
            r,
            Captured::SendChatAction(a) if a.chat_id == 42 && a.action == "typing"
        )));
        api.stop().await;
    }

    #[tokio::test]
    async fn waits_out_rate_limit() {
        let api = MockTelegramApi::start_rate_limited(1).await;
        let outbound = TelegramOutbound::new(api.bot.clone());

        outbound.send_text("42", "eventually").await.unwrap();

        assert_eq!(api.sent_texts(), vec![(42, "eventually".to_string())]);
        api.stop().await;
    }

    #[tokio::test]
    async fn rejects_non_numeric_chat_id() {
        let outbound = TelegramOutbound::new(Bot::new("test-token"));
        let err = outbound.send_text("console", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidInput { .. }));
    }
}

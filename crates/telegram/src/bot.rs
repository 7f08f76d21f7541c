use std::{sync::Arc, time::Duration};

use {
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        prelude::*,
        types::{AllowedUpdate, BotCommand, UpdateKind},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {relay_channels::ChannelEventSink, relay_config::TelegramConfig};

use crate::{
    error::{Error, Result},
    handlers,
    outbound::TelegramOutbound,
};

/// Pause after a failed `getUpdates` before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A connected bot, ready to poll.
pub struct TelegramBot {
    bot: Bot,
    username: Option<String>,
    poll_timeout_secs: u32,
}

impl TelegramBot {
    /// Verify the token, clear any webhook so long polling works, and
    /// register `commands` for client autocomplete.
    pub async fn connect(config: &TelegramConfig, commands: &[(&str, &str)]) -> Result<Self> {
        if !config.has_token() {
            return Err(Error::message("telegram.token is not set"));
        }

        // Client timeout must outlive the long-poll timeout, or the HTTP
        // client aborts the request before Telegram responds.
        let client = teloxide::net::default_reqwest_settings()
            .timeout(Duration::from_secs(u64::from(config.poll_timeout_secs) + 15))
            .build()?;
        let bot = Bot::with_client(config.token.expose_secret(), client);

        let me = bot.get_me().await?;
        bot.delete_webhook().send().await?;

        let commands: Vec<BotCommand> = commands
            .iter()
            .map(|(name, description)| BotCommand::new(*name, *description))
            .collect();
        if let Err(e) = bot.set_my_commands(commands).await {
            warn!("failed to register bot commands: {e}");
        }

        info!(username = ?me.username, "telegram bot connected (webhook cleared)");
        Ok(Self {
            bot,
            username: me.username.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    #[must_use]
    pub fn outbound(&self) -> TelegramOutbound {
        TelegramOutbound::new(self.bot.clone())
    }

    /// Poll for updates until `cancel` fires. Returns an error if another
    /// instance takes over the token.
    pub async fn run_polling(
        &self,
        sink: Arc<dyn ChannelEventSink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("starting telegram polling loop");
        let outbound = self.outbound();
        let mut offset: i32 = 0;

        loop {
            let request = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(self.poll_timeout_secs)
                .allowed_updates(vec![AllowedUpdate::Message]);

            let result = tokio::select! {
                () = cancel.cancelled() => {
                    info!("telegram polling stopped");
                    return Ok(());
                },
                result = request.send() => result,
            };

            match result {
                Ok(updates) => {
                    debug!(count = updates.len(), "got telegram updates");
                    for update in updates {
                        offset = update.id.as_offset();
                        match update.kind {
                            UpdateKind::Message(msg) => {
                                debug!(chat_id = msg.chat.id.0, "received telegram message");
                                if let Err(e) = handlers::handle_message(
                                    &msg,
                                    self.username.as_deref(),
                                    &outbound,
                                    sink.as_ref(),
                                )
                                .await
                                {
                                    error!(error = %e, "error handling telegram message");
                                }
                            },
                            other => {
                                debug!("ignoring non-message update: {other:?}");
                            },
                        }
                    }
                },
                Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                    warn!("another instance is already polling with this token, stopping");
                    return Err(Error::message(
                        "another bot instance is already running with this token",
                    ));
                },
                Err(e) => {
                    warn!(error = %e, "telegram getUpdates failed");
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(POLL_ERROR_BACKOFF) => {},
                    }
                },
            }
        }
    }
}

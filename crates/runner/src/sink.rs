//! Cleans, chunks, retries and paces outbound messages for one conversation.

use std::{sync::Arc, time::Duration};

use {
    relay_channels::ChannelOutbound,
    relay_config::DeliveryConfig,
    tokio::{sync::Mutex, time::Instant},
    tracing::{debug, warn},
};

use crate::{
    buffer::FlushUnit,
    markdown::{chunk_message, strip_markdown},
};

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Upper bound for one message, in characters.
    pub max_chunk_len: usize,
    /// Tries per chunk; at least one is always made.
    pub send_attempts: u32,
    pub retry_delay: Duration,
    /// Minimum gap between two sends.
    pub pace: Duration,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_chunk_len: config.max_chunk_len,
            send_attempts: config.send_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            pace: Duration::from_millis(config.pace_ms),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

/// Per-call delivery tally. Dropped chunks never fail the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub dropped: usize,
}

impl std::ops::AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.dropped += other.dropped;
    }
}

pub struct DeliverySink {
    outbound: Arc<dyn ChannelOutbound>,
    settings: DeliverySettings,
    last_send: Mutex<Option<Instant>>,
}

impl DeliverySink {
    pub fn new(outbound: Arc<dyn ChannelOutbound>, settings: DeliverySettings) -> Self {
        Self {
            outbound,
            settings,
            last_send: Mutex::new(None),
        }
    }

    /// Deliver agent content: strip markup, chunk, send each chunk.
    pub async fn deliver(&self, conversation_id: &str, text: &str) -> DeliveryReport {
        let cleaned = strip_markdown(text);
        self.send_chunks(conversation_id, &cleaned).await
    }

    pub async fn deliver_unit(&self, conversation_id: &str, unit: &FlushUnit) -> DeliveryReport {
        debug!(
            conversation_id,
            category = %unit.category,
            chars = unit.text.chars().count(),
            "delivering flush unit"
        );
        self.deliver(conversation_id, &unit.render()).await
    }

    /// Deliver a relay-authored notice. No markup stripping.
    pub async fn notify(&self, conversation_id: &str, text: &str) -> DeliveryReport {
        self.send_chunks(conversation_id, text).await
    }

    /// Best-effort "typing" indicator.
    pub async fn indicate(&self, conversation_id: &str) {
        if let Err(e) = self.outbound.send_typing(conversation_id).await {
            debug!(conversation_id, error = %e, "typing indicator failed");
        }
    }

    async fn send_chunks(&self, conversation_id: &str, text: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for chunk in chunk_message(text, self.settings.max_chunk_len) {
            // Whitespace-only messages are rejected by chat APIs.
            if chunk.trim().is_empty() {
                continue;
            }
            if self.send_with_retry(conversation_id, &chunk).await {
                report.sent += 1;
            } else {
                report.dropped += 1;
            }
        }
        report
    }

    async fn send_with_retry(&self, conversation_id: &str, chunk: &str) -> bool {
        let attempts = self.settings.send_attempts.max(1);
        let mut last_send = self.last_send.lock().await;

        for attempt in 1..=attempts {
            if let Some(previous) = *last_send {
                tokio::time::sleep_until(previous + self.settings.pace).await;
            }
            let result = self.outbound.send_text(conversation_id, chunk).await;
            *last_send = Some(Instant::now());

            match result {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    warn!(
                        conversation_id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                },
                Err(e) => {
                    warn!(
                        conversation_id,
                        attempts,
                        chunk_chars = chunk.chars().count(),
                        error = %e,
                        "send failed, dropping chunk"
                    );
                },
            }
        }
        false
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use {async_trait::async_trait, relay_channels::Error as ChannelError};

    use {super::*, crate::classifier::Category};

    /// Fails the first `fail_first` sends, then records.
    #[derive(Default)]
    struct FlakyOutbound {
        fail_first: usize,
        calls: AtomicUsize,
        sent: StdMutex<Vec<String>>,
        typing: AtomicUsize,
    }

    #[async_trait]
    impl ChannelOutbound for FlakyOutbound {
        async fn send_text(&self, _to: &str, text: &str) -> relay_channels::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ChannelError::unavailable("endpoint down"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_typing(&self, _to: &str) -> relay_channels::Result<()> {
            self.typing.fetch_add(1, Ordering::SeqCst);
            Err(ChannelError::unavailable("typing unsupported"))
        }
    }

    fn settings(max_chunk_len: usize, send_attempts: u32) -> DeliverySettings {
        DeliverySettings {
            max_chunk_len,
            send_attempts,
            retry_delay: Duration::ZERO,
            pace: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn cleans_markup_before_sending() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 3));
        let report = sink.deliver("1", "**Hello** `World`").await;
        assert_eq!(report, DeliveryReport { sent: 1, dropped: 0 });
        assert_eq!(outbound.sent.lock().unwrap().as_slice(), ["Hello World"]);
    }

    #[tokio::test]
    async fn notices_are_sent_verbatim() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 1));
        sink.notify("1", "*kept*").await;
        assert_eq!(outbound.sent.lock().unwrap().as_slice(), ["*kept*"]);
    }

    #[tokio::test]
    async fn long_text_is_chunked_in_order() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(10, 1));
        let text = "line one\nline two\nline 3";
        let report = sink.deliver("1", text).await;
        assert_eq!(report.sent, 3);
        let sent = outbound.sent.lock().unwrap();
        assert!(sent.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(sent.concat(), text);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let outbound = Arc::new(FlakyOutbound {
            fail_first: 2,
            ..Default::default()
        });
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 3));
        let report = sink.deliver("1", "hi").await;
        assert_eq!(report, DeliveryReport { sent: 1, dropped: 0 });
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_chunk_is_dropped_and_next_continues() {
        let outbound = Arc::new(FlakyOutbound {
            fail_first: 2,
            ..Default::default()
        });
        let sink = DeliverySink::new(outbound.clone(), settings(6, 2));
        let report = sink.deliver("1", "first\nsecond").await;
        assert_eq!(report, DeliveryReport { sent: 1, dropped: 1 });
        assert_eq!(outbound.sent.lock().unwrap().as_slice(), ["second"]);
    }

    #[tokio::test]
    async fn blank_text_sends_nothing() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 1));
        assert_eq!(sink.deliver("1", "  \n ").await, DeliveryReport::default());
        assert_eq!(outbound.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn typing_failure_is_swallowed() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 1));
        sink.indicate("1").await;
        assert_eq!(outbound.typing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_paced() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), DeliverySettings {
            pace: Duration::from_millis(500),
            ..settings(4000, 1)
        });
        let started = Instant::now();
        sink.notify("1", "a").await;
        sink.notify("1", "b").await;
        sink.notify("1", "c").await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(outbound.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn thinking_units_carry_marker() {
        let outbound = Arc::new(FlakyOutbound::default());
        let sink = DeliverySink::new(outbound.clone(), settings(4000, 1));
        sink.deliver_unit("1", &FlushUnit {
            category: Category::Thinking,
            text: "weighing options".into(),
        })
        .await;
        assert_eq!(outbound.sent.lock().unwrap().as_slice(), [
            "💭 weighing options"
        ]);
    }
}

//! Task lifecycle: single-flight admission, retries, notices, cleanup.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    relay_channels::{ChannelOutbound, TaskSubmission},
    relay_common::text::truncate_with_ellipsis,
    relay_config::RelayConfig,
    tokio::time::Instant,
    tracing::{error, info, warn},
};

use crate::{
    cleanup::{ReclaimScope, ResourceReclaimer, SystemReclaimer},
    error::Result,
    process::{AgentInvocation, AttemptContext, AttemptOutcome, ProcessExecutor},
    registry::{ConversationRegistry, LiveAgents, RunGuard},
    settings::RunnerSettings,
    sink::{DeliverySettings, DeliverySink},
};

/// Characters of a task repeated back in notices.
const TASK_ECHO_CHARS: usize = 80;

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { attempts: u32, summary: String },
    Failed { attempts: u32, last: AttemptOutcome },
    /// The worker panicked mid-task.
    Faulted { reason: String },
}

pub struct TaskController {
    executor: ProcessExecutor,
    outbound: Arc<dyn ChannelOutbound>,
    delivery: DeliverySettings,
    reclaimer: Arc<dyn ResourceReclaimer>,
    registry: ConversationRegistry,
    live_agents: LiveAgents,
    settings: RunnerSettings,
}

impl TaskController {
    pub fn new(
        invocation: AgentInvocation,
        outbound: Arc<dyn ChannelOutbound>,
        reclaimer: Arc<dyn ResourceReclaimer>,
        settings: RunnerSettings,
        delivery: DeliverySettings,
    ) -> Self {
        let live_agents = LiveAgents::new();
        Self {
            executor: ProcessExecutor::new(invocation, &settings, live_agents.clone()),
            outbound,
            delivery,
            reclaimer,
            registry: ConversationRegistry::new(settings.memory_limit),
            live_agents,
            settings,
        }
    }

    /// Build a controller with the system reclaimer described by `config`.
    pub fn from_config(config: &RelayConfig, outbound: Arc<dyn ChannelOutbound>) -> Result<Self> {
        let reclaimer = SystemReclaimer::from_config(&config.agent)?;
        Ok(Self::new(
            AgentInvocation::from(&config.agent),
            outbound,
            Arc::new(reclaimer),
            RunnerSettings::from(&config.runner),
            DeliverySettings::from(&config.delivery),
        ))
    }

    #[must_use]
    pub fn registry(&self) -> &ConversationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn invocation(&self) -> &AgentInvocation {
        self.executor.invocation()
    }

    /// Admit a task and run it on its own worker. Returns immediately.
    pub fn submit(self: &Arc<Self>, conversation_id: &str, task: &str) -> TaskSubmission {
        let task = task.trim();
        if task.is_empty() {
            return TaskSubmission::Empty;
        }
        let Some(guard) = self.registry.try_begin(conversation_id) else {
            info!(conversation_id, "task rejected, conversation busy");
            return TaskSubmission::Busy;
        };

        let this = Arc::clone(self);
        let task = task.to_string();
        tokio::spawn(async move {
            this.run(guard, task).await;
        });
        TaskSubmission::Started
    }

    /// Run an admitted task to its end. Cleanup runs exactly once on every
    /// path, including a panic inside the attempt loop.
    pub async fn run(self: &Arc<Self>, guard: RunGuard, task: String) -> TaskOutcome {
        let conversation_id = guard.conversation_id().to_string();
        let sink = Arc::new(DeliverySink::new(
            Arc::clone(&self.outbound),
            self.delivery.clone(),
        ));
        let terminal_sent = Arc::new(AtomicBool::new(false));
        info!(conversation_id, task_chars = task.chars().count(), "task started");

        let worker = tokio::spawn({
            let this = Arc::clone(self);
            let sink = Arc::clone(&sink);
            let terminal_sent = Arc::clone(&terminal_sent);
            let conversation_id = conversation_id.clone();
            let task = task.clone();
            async move {
                this.attempt_loop(&conversation_id, &task, &sink, &terminal_sent)
                    .await
            }
        });

        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(conversation_id, error = %e, "task worker faulted");
                if !terminal_sent.swap(true, Ordering::SeqCst) {
                    sink.notify(
                        &conversation_id,
                        "❌ The task stopped because of an internal error.",
                    )
                    .await;
                }
                TaskOutcome::Faulted {
                    reason: e.to_string(),
                }
            },
        };

        // This task's agent has exited by now, so every live agent belongs
        // to another conversation. Our own guard is still counted.
        let scope = ReclaimScope {
            live_agents: self.live_agents.clone(),
            sweep_scratch: self.registry.running_count() <= 1,
        };
        let reclaimed = self.reclaimer.reclaim(&scope).await;
        info!(
            conversation_id,
            killed = reclaimed.killed,
            removed_dirs = reclaimed.removed_dirs,
            spared_agents = scope.live_agents.len(),
            outcome = ?outcome,
            "task finished"
        );
        drop(guard);
        outcome
    }

    async fn attempt_loop(
        &self,
        conversation_id: &str,
        task: &str,
        sink: &DeliverySink,
        terminal_sent: &AtomicBool,
    ) -> TaskOutcome {
        let task_started = Instant::now();
        sink.notify(conversation_id, &start_notice(task)).await;
        sink.indicate(conversation_id).await;

        let mut attempt = 0;
        loop {
            let report = self
                .executor
                .run_attempt(
                    AttemptContext {
                        conversation_id,
                        task,
                        attempt,
                        task_started,
                    },
                    sink,
                )
                .await;

            if report.outcome.is_success() {
                self.registry.record(conversation_id, task, &report.summary);
                sink.notify(
                    conversation_id,
                    &completion_notice(&report.summary, self.settings.completion_preview_chars),
                )
                .await;
                return TaskOutcome::Completed {
                    attempts: attempt + 1,
                    summary: report.summary,
                };
            }

            if attempt < self.settings.max_retries {
                attempt += 1;
                warn!(
                    conversation_id,
                    attempt,
                    max_retries = self.settings.max_retries,
                    outcome = %report.outcome,
                    "attempt failed, retrying"
                );
                sink.notify(
                    conversation_id,
                    &retry_notice(&report.outcome, attempt, self.settings.max_retries),
                )
                .await;
                tokio::time::sleep(self.settings.retry_backoff).await;
                continue;
            }

            error!(
                conversation_id,
                attempts = attempt + 1,
                outcome = %report.outcome,
                "task failed after retries"
            );
            if !terminal_sent.swap(true, Ordering::SeqCst) {
                sink.notify(conversation_id, &failure_notice(&report.outcome, attempt + 1))
                    .await;
            }
            return TaskOutcome::Failed {
                attempts: attempt + 1,
                last: report.outcome,
            };
        }
    }
}

fn start_notice(task: &str) -> String {
    format!(
        "🔄 Running: {}",
        truncate_with_ellipsis(task, TASK_ECHO_CHARS)
    )
}

fn completion_notice(summary: &str, preview_chars: usize) -> String {
    if summary.is_empty() || preview_chars == 0 {
        "✅ Done".to_string()
    } else {
        format!(
            "✅ Done\n\n{}",
            truncate_with_ellipsis(summary, preview_chars)
        )
    }
}

/// `retry` is the 1-based number of the retry about to start.
fn retry_notice(outcome: &AttemptOutcome, retry: u32, max_retries: u32) -> String {
    format!("⚠️ Attempt {outcome}. Retrying ({retry}/{max_retries})…")
}

fn failure_notice(outcome: &AttemptOutcome, attempts: u32) -> String {
    let plural = if attempts == 1 { "" } else { "s" };
    format!("❌ Task failed after {attempts} attempt{plural}: {outcome}")
}

//! One attempt of the external agent: spawn, stream, classify, deliver.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use {
    relay_config::AgentConfig,
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::{Child, Command},
        sync::mpsc,
        time::Instant,
    },
    tracing::{debug, info, warn},
};

use crate::{
    buffer::ContentBuffer,
    classifier::Classifier,
    heartbeat::Heartbeat,
    registry::LiveAgents,
    settings::RunnerSettings,
    sink::{DeliveryReport, DeliverySink},
    summary::summarize,
};

/// How long to keep reading after the process is gone (or killed) before
/// giving up on descendants that still hold the pipe open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Trailing stderr lines kept for the crash reason.
const STDERR_TAIL_LINES: usize = 5;

/// How to start the agent for a task.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub program: String,
    /// Arguments placed before `--` and the task.
    pub args: Vec<String>,
    /// Merged over the inherited environment.
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl From<&AgentConfig> for AgentInvocation {
    fn from(config: &AgentConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.resolved_args(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.attempt_timeout(),
        }
    }
}

impl AgentInvocation {
    /// Build the command. The task is passed as a single argument after
    /// `--`; no shell is involved, so it needs no escaping.
    #[must_use]
    pub fn command(&self, task: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--")
            .arg(task)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TimedOut,
    Crashed { reason: String },
}

impl AttemptOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Crashed { reason } => write!(f, "crashed: {reason}"),
        }
    }
}

#[derive(Debug)]
pub struct AttemptReport {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    /// Every stdout line, in order.
    pub output: Vec<String>,
    pub summary: String,
    pub duration: Duration,
    pub delivered: DeliveryReport,
    pub heartbeats: u32,
}

/// Identifies the attempt being run.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub conversation_id: &'a str,
    pub task: &'a str,
    /// Zero-based.
    pub attempt: u32,
    /// When the task's first attempt started.
    pub task_started: Instant,
}

pub struct ProcessExecutor {
    invocation: AgentInvocation,
    flush_threshold: usize,
    heartbeat_interval: Duration,
    line_channel_capacity: usize,
    live_agents: LiveAgents,
}

impl ProcessExecutor {
    /// Every spawned agent is tracked in `live_agents` until it is reaped.
    #[must_use]
    pub fn new(
        invocation: AgentInvocation,
        settings: &RunnerSettings,
        live_agents: LiveAgents,
    ) -> Self {
        Self {
            invocation,
            flush_threshold: settings.flush_threshold,
            heartbeat_interval: settings.heartbeat_interval,
            line_channel_capacity: settings.line_channel_capacity.max(1),
            live_agents,
        }
    }

    #[must_use]
    pub fn invocation(&self) -> &AgentInvocation {
        &self.invocation
    }

    /// Run one attempt to completion. Never returns an error: every failure
    /// becomes an [`AttemptOutcome`].
    pub async fn run_attempt(&self, ctx: AttemptContext<'_>, sink: &DeliverySink) -> AttemptReport {
        let started = Instant::now();
        let mut stream = AttemptStream {
            conversation_id: ctx.conversation_id,
            sink,
            classifier: Classifier::new(),
            buffer: ContentBuffer::new(self.flush_threshold),
            heartbeat: Heartbeat::new(self.heartbeat_interval, ctx.task_started),
            output: Vec::new(),
            delivered: DeliveryReport::default(),
        };

        let outcome = match self.invocation.command(ctx.task).spawn() {
            Ok(child) => {
                info!(
                    conversation_id = ctx.conversation_id,
                    attempt = ctx.attempt,
                    program = %self.invocation.program,
                    pid = ?child.id(),
                    "agent started"
                );
                self.stream_child(child, started, &mut stream).await
            },
            Err(e) => {
                warn!(
                    conversation_id = ctx.conversation_id,
                    attempt = ctx.attempt,
                    program = %self.invocation.program,
                    error = %e,
                    "failed to start agent"
                );
                AttemptOutcome::Crashed {
                    reason: format!("failed to start {}: {e}", self.invocation.program),
                }
            },
        };

        stream.flush_all().await;

        let summary = summarize(&stream.output);
        let duration = started.elapsed();
        info!(
            conversation_id = ctx.conversation_id,
            attempt = ctx.attempt,
            outcome = %outcome,
            lines = stream.output.len(),
            sent = stream.delivered.sent,
            dropped = stream.delivered.dropped,
            elapsed_ms = duration.as_millis() as u64,
            "agent attempt finished"
        );

        AttemptReport {
            attempt: ctx.attempt,
            outcome,
            summary,
            duration,
            delivered: stream.delivered,
            heartbeats: stream.heartbeat.beats(),
            output: stream.output,
        }
    }

    async fn stream_child(
        &self,
        mut child: Child,
        started: Instant,
        stream: &mut AttemptStream<'_>,
    ) -> AttemptOutcome {
        let _live = child.id().map(|pid| self.live_agents.register(pid));
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return AttemptOutcome::Crashed {
                reason: "agent stdout was not captured".into(),
            };
        };
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_stderr(stderr)));

        let (tx, mut rx) = mpsc::channel(self.line_channel_capacity);
        let reader = tokio::spawn(forward_lines(stdout, tx));
        let timeout_at = self.invocation.timeout.map(|t| started + t);

        let end = loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => stream.on_line(line).await,
                    None => break StreamEnd::Eof,
                },
                status = child.wait() => break StreamEnd::Exited(status),
                () = tokio::time::sleep_until(stream.heartbeat.deadline()) => stream.on_heartbeat().await,
                () = sleep_until_opt(timeout_at) => break StreamEnd::TimedOut,
            }
        };

        let outcome = match end {
            // Stdout closed but the process may live on; keep the heartbeat
            // and the timeout running while waiting for it.
            StreamEnd::Eof => loop {
                tokio::select! {
                    status = child.wait() => break match status {
                        Ok(status) => exit_outcome(status),
                        Err(e) => AttemptOutcome::Crashed {
                            reason: format!("failed to wait for agent: {e}"),
                        },
                    },
                    () = tokio::time::sleep_until(stream.heartbeat.deadline()) => stream.on_heartbeat().await,
                    () = sleep_until_opt(timeout_at) => {
                        let _ = child.kill().await;
                        break AttemptOutcome::TimedOut;
                    },
                }
            },
            StreamEnd::Exited(Ok(status)) => {
                stream.drain(&mut rx).await;
                exit_outcome(status)
            },
            StreamEnd::Exited(Err(e)) => {
                let _ = child.kill().await;
                AttemptOutcome::Crashed {
                    reason: format!("failed to wait for agent: {e}"),
                }
            },
            StreamEnd::TimedOut => {
                warn!(
                    conversation_id = stream.conversation_id,
                    timeout_secs = ?self.invocation.timeout.map(|t| t.as_secs()),
                    "agent attempt timed out, killing"
                );
                let _ = child.kill().await;
                stream.drain(&mut rx).await;
                AttemptOutcome::TimedOut
            },
        };
        reader.abort();

        let stderr_tail = match stderr_task {
            Some(task) => match tokio::time::timeout(DRAIN_GRACE, task).await {
                Ok(Ok(tail)) => tail,
                _ => VecDeque::new(),
            },
            None => VecDeque::new(),
        };

        match outcome {
            AttemptOutcome::Crashed { reason } if !stderr_tail.is_empty() => {
                let tail = stderr_tail.into_iter().collect::<Vec<_>>().join(" | ");
                AttemptOutcome::Crashed {
                    reason: format!("{reason}: {tail}"),
                }
            },
            other => other,
        }
    }
}

enum StreamEnd {
    Eof,
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
}

/// Mutable state of one attempt's read loop.
struct AttemptStream<'a> {
    conversation_id: &'a str,
    sink: &'a DeliverySink,
    classifier: Classifier,
    buffer: ContentBuffer,
    heartbeat: Heartbeat,
    output: Vec<String>,
    delivered: DeliveryReport,
}

impl AttemptStream<'_> {
    async fn on_line(&mut self, line: String) {
        if let Some(event) = self.classifier.classify(&line) {
            debug!(
                conversation_id = self.conversation_id,
                category = %event.category,
                chars = event.payload.chars().count(),
                "classified agent output"
            );
            self.buffer.append(event.category, &event.payload);
            if event.category.is_line_oriented() {
                self.buffer.append(event.category, "\n");
            }
            let units = self.buffer.drain_ready(event.category);
            if !units.is_empty() {
                for unit in &units {
                    self.delivered += self.sink.deliver_unit(self.conversation_id, unit).await;
                }
                self.heartbeat.record_flush(Instant::now());
            }
        }
        self.output.push(line);
    }

    /// Silence for a full interval: push out what is buffered, then tell the
    /// user the task is still alive.
    async fn on_heartbeat(&mut self) {
        self.flush_all().await;
        self.sink.indicate(self.conversation_id).await;
        let notice = self.heartbeat.beat(Instant::now());
        debug!(
            conversation_id = self.conversation_id,
            beats = self.heartbeat.beats(),
            "heartbeat"
        );
        self.delivered += self.sink.notify(self.conversation_id, &notice).await;
    }

    async fn flush_all(&mut self) {
        for unit in self.buffer.drain_all() {
            self.delivered += self.sink.deliver_unit(self.conversation_id, &unit).await;
        }
    }

    /// Consume lines still in flight after the process ended.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<String>) {
        let deadline = Instant::now() + DRAIN_GRACE;
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            self.on_line(line).await;
        }
    }
}

/// Read stdout line by line into the channel. Invalid UTF-8 is replaced
/// rather than ending the stream.
async fn forward_lines(stdout: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            },
            Err(e) => {
                warn!(error = %e, "error reading agent stdout");
                break;
            },
        }
    }
}

/// Log stderr as it arrives and keep the last few lines.
async fn collect_stderr(stderr: impl AsyncRead + Unpin) -> VecDeque<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                warn!(stderr = %line, "agent stderr");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            },
        }
    }
    tail
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn exit_outcome(status: ExitStatus) -> AttemptOutcome {
    if status.success() {
        AttemptOutcome::Success
    } else {
        AttemptOutcome::Crashed {
            reason: format!("agent exited with {status}"),
        }
    }
}

//! Liveness tracking for the streaming loop.
//!
//! The heartbeat does not own a timer; the executor selects on
//! [`Heartbeat::deadline`] next to the line channel.

use {std::time::Duration, tokio::time::Instant};

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    task_started: Instant,
    last_flush: Instant,
    beats: u32,
}

impl Heartbeat {
    /// `task_started` is when the task's first attempt began, so elapsed
    /// time keeps counting across retries.
    #[must_use]
    pub fn new(interval: Duration, task_started: Instant) -> Self {
        Self {
            interval,
            task_started,
            last_flush: Instant::now(),
            beats: 0,
        }
    }

    /// When the next beat is due if nothing is flushed before then.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.interval
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Content went out; push the deadline back.
    pub fn record_flush(&mut self, now: Instant) {
        self.last_flush = now;
    }

    /// Register a beat and return the status line to send.
    pub fn beat(&mut self, now: Instant) -> String {
        self.last_flush = now;
        self.beats += 1;
        status_message(now.saturating_duration_since(self.task_started))
    }

    #[must_use]
    pub fn beats(&self) -> u32 {
        self.beats
    }
}

/// Liveness notice for a task that has been running for `elapsed`.
#[must_use]
pub fn status_message(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    if minutes == 0 {
        "⏳ Still running, under a minute so far…".to_string()
    } else {
        format!("⏳ Still running, about {minutes} min elapsed…")
    }
}

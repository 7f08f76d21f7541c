//! `relay doctor`: config validation and environment audit.
//!
//! Prints a report with `[ok]`, `[warn]`, `[fail]` or `[info]` per item and
//! exits non-zero when anything failed.

use std::path::Path;

use {
    anyhow::Result,
    relay_config::{
        RelayConfig,
        validate::{self, Severity},
    },
    relay_runner::SystemReclaimer,
};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Info => CYAN,
        }
    }
}

impl From<Severity> for Status {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn count(&self, status: Status) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

fn print_report(sections: &[Section]) -> (usize, usize) {
    for section in sections {
        eprintln!("{BOLD}{}{RESET}", section.title);
        for item in &section.items {
            let color = item.status.color();
            let label = item.status.label();
            eprintln!("  [{color}{label}{RESET}]  {}", item.message);
        }
        eprintln!();
    }

    let errors = sections.iter().map(|s| s.count(Status::Fail)).sum();
    let warnings = sections.iter().map(|s| s.count(Status::Warn)).sum();
    (errors, warnings)
}

pub async fn handle_doctor(config_path: Option<&Path>, config: &RelayConfig) -> Result<()> {
    eprintln!("{BOLD}relay doctor{RESET}");
    eprintln!("{BOLD}============{RESET}\n");

    let sections = vec![
        check_config(config_path),
        check_telegram(config),
        check_agent(config),
        check_cleanup(config),
    ];

    let (errors, warnings) = print_report(&sections);
    eprintln!("{BOLD}Summary:{RESET} {errors} error(s), {warnings} warning(s)");

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn check_config(config_path: Option<&Path>) -> Section {
    let result = validate::validate(config_path);
    let label = result
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".into());
    let mut section = Section::new(format!("Config ({label})"));

    if result.diagnostics.is_empty() {
        section.push(Status::Ok, "No issues found");
    }
    for d in &result.diagnostics {
        let message = if d.path.is_empty() {
            d.message.clone()
        } else {
            format!("{}: {}", d.path, d.message)
        };
        section.push(d.severity.into(), message);
    }
    section
}

fn check_telegram(config: &RelayConfig) -> Section {
    let mut section = Section::new("Telegram");
    if config.telegram.has_token() {
        section.push(Status::Ok, "Bot token configured");
    } else {
        section.push(
            Status::Warn,
            "No bot token; set telegram.token or RELAY_TELEGRAM_TOKEN to use `relay serve`",
        );
    }
    section.push(
        Status::Info,
        format!("Long-poll timeout {}s", config.telegram.poll_timeout_secs),
    );
    section
}

fn check_agent(config: &RelayConfig) -> Section {
    let agent = &config.agent;
    let mut section = Section::new("Agent");

    match which::which(&agent.program) {
        Ok(path) => section.push(Status::Ok, format!("{} found at {}", agent.program, path.display())),
        Err(_) => section.push(Status::Fail, format!("{} not found on PATH", agent.program)),
    }
    section.push(
        Status::Info,
        format!("Invocation: {} {} -- <task>", agent.program, agent.resolved_args().join(" ")),
    );

    if let Some(ref dir) = agent.working_dir
        && !dir.is_dir()
    {
        section.push(
            Status::Fail,
            format!("Working directory {} does not exist", dir.display()),
        );
    }

    match agent.attempt_timeout() {
        Some(timeout) => section.push(Status::Info, format!("Attempts time out after {timeout:?}")),
        None => section.push(Status::Info, "Attempts have no time limit"),
    }
    section
}

fn check_cleanup(config: &RelayConfig) -> Section {
    let agent = &config.agent;
    let mut section = Section::new("Cleanup");

    match SystemReclaimer::from_config(agent) {
        Ok(_) => match agent.cleanup_pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(pattern) => section.push(Status::Ok, format!("Process pattern `{pattern}` compiles")),
            None => section.push(Status::Info, "Leftover process sweep disabled"),
        },
        Err(e) => section.push(Status::Fail, format!("agent.cleanup_pattern: {e}")),
    }

    match agent.scratch_dir {
        Some(ref dir) if dir.is_dir() => {
            section.push(Status::Ok, format!("Scratch directory {}", dir.display()));
        },
        Some(ref dir) => section.push(
            Status::Info,
            format!("Scratch directory {} does not exist yet", dir.display()),
        ),
        None => section.push(Status::Info, "Scratch directory sweep disabled"),
    }
    section
}

mod console;
mod doctor_commands;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::{Context, bail},
    clap::{Parser, Subcommand},
    relay_channels::{ChannelEventSink, ChannelOutbound},
    relay_config::RelayConfig,
    relay_runner::{COMMANDS, RelayDispatcher, TaskController, TaskOutcome},
    relay_telegram::TelegramBot,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::console::{CONSOLE_CONVERSATION, ConsoleOutbound};

/// How long `serve` waits for in-flight tasks after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "relay", version, about = "Relay chat tasks to a command-line coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to use instead of the discovered one.
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll Telegram and run incoming tasks (default when no subcommand is provided).
    Serve,
    /// Run one task and print its output here.
    Run {
        #[arg(short, long)]
        message: String,
    },
    /// Config validation and environment checks.
    Doctor,
}

/// Logs go to stderr so `relay run` keeps stdout for task output.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    match cli.config {
        Some(ref path) => {
            let mut config = relay_config::load_config(path)
                .with_context(|| format!("loading {}", path.display()))?;
            relay_config::apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(relay_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");
    let config = load_config(&cli)?;

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Run { ref message }) => run_once(config, message).await,
        Some(Commands::Doctor) => doctor_commands::handle_doctor(cli.config.as_deref(), &config).await,
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    let bot = TelegramBot::connect(&config.telegram, COMMANDS).await?;
    let outbound: Arc<dyn ChannelOutbound> = Arc::new(bot.outbound());
    let controller = Arc::new(TaskController::from_config(&config, outbound)?);
    let sink: Arc<dyn ChannelEventSink> = Arc::new(RelayDispatcher::new(Arc::clone(&controller)));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let polled = bot.run_polling(sink, cancel).await;
    wait_for_running_tasks(&controller).await;
    polled?;
    Ok(())
}

async fn wait_for_running_tasks(controller: &TaskController) {
    let running = controller.registry().running_count();
    if running == 0 {
        return;
    }
    info!(running, "waiting for running tasks to finish");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while controller.registry().running_count() > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            running = controller.registry().running_count(),
            "tasks still running at shutdown, abandoning them"
        );
    }
}

async fn run_once(config: RelayConfig, message: &str) -> anyhow::Result<()> {
    let task = message.trim();
    if task.is_empty() {
        bail!("the task is empty");
    }

    let controller = Arc::new(TaskController::from_config(
        &config,
        Arc::new(ConsoleOutbound),
    )?);
    let Some(guard) = controller.registry().try_begin(CONSOLE_CONVERSATION) else {
        bail!("a task is already running");
    };

    match controller.run(guard, task.to_string()).await {
        TaskOutcome::Completed { attempts, .. } => {
            info!(attempts, "task completed");
            Ok(())
        },
        TaskOutcome::Failed { attempts, last } => {
            bail!("task failed after {attempts} attempt(s): {last}")
        },
        TaskOutcome::Faulted { reason } => bail!("task stopped: {reason}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["relay"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn run_takes_a_message() {
        let cli = Cli::try_parse_from(["relay", "run", "-m", "write hello world", "--json-logs"])
            .unwrap();
        assert!(cli.json_logs);
        match cli.command {
            Some(Commands::Run { message }) => assert_eq!(message, "write hello world"),
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn blank_task_is_rejected() {
        let err = run_once(RelayConfig::default(), "   ").await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}

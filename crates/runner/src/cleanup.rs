//! Post-task resource reclamation: stray agent processes and scratch
//! directories.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    regex::Regex,
    relay_config::AgentConfig,
    sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    registry::LiveAgents,
};

/// Parent links followed when checking whether a process belongs to a live
/// agent.
const MAX_ANCESTRY_DEPTH: usize = 64;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub killed: usize,
    pub removed_dirs: usize,
    pub errors: Vec<String>,
}

/// What a finishing task may touch without disturbing other conversations.
#[derive(Debug, Clone, Default)]
pub struct ReclaimScope {
    /// Agents still running for other conversations. They and their
    /// descendants are spared.
    pub live_agents: LiveAgents,
    /// False while another conversation may still be using the scratch
    /// directory.
    pub sweep_scratch: bool,
}

/// Reclaims whatever an agent run may have left behind. Runs once per task
/// and must not fail; problems are reported, not returned.
#[async_trait]
pub trait ResourceReclaimer: Send + Sync {
    async fn reclaim(&self, scope: &ReclaimScope) -> ReclaimReport;
}

/// Kills processes whose command line matches a pattern and empties the
/// agent's scratch directory.
#[derive(Debug, Clone)]
pub struct SystemReclaimer {
    pattern: Option<Regex>,
    scratch_dir: Option<PathBuf>,
}

impl SystemReclaimer {
    pub fn new(pattern: Option<&str>, scratch_dir: Option<PathBuf>) -> Result<Self> {
        let pattern = pattern
            .filter(|p| !p.trim().is_empty())
            .map(|p| {
                Regex::new(p).map_err(|source| Error::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self {
            pattern,
            scratch_dir,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(
            config.cleanup_pattern.as_deref(),
            config.scratch_dir.clone(),
        )
    }
}

#[async_trait]
impl ResourceReclaimer for SystemReclaimer {
    async fn reclaim(&self, scope: &ReclaimScope) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        if let Some(pattern) = self.pattern.clone() {
            let live_agents = scope.live_agents.clone();
            match tokio::task::spawn_blocking(move || kill_matching(&pattern, &live_agents)).await {
                Ok(killed) => report.killed = killed,
                Err(e) => report.errors.push(format!("process sweep panicked: {e}")),
            }
        }

        match &self.scratch_dir {
            Some(dir) if scope.sweep_scratch => sweep_scratch(dir, &mut report).await,
            Some(dir) => {
                debug!(path = %dir.display(), "other tasks running, scratch sweep deferred");
            },
            None => {},
        }

        if report.killed > 0 || report.removed_dirs > 0 || !report.errors.is_empty() {
            info!(
                killed = report.killed,
                removed_dirs = report.removed_dirs,
                errors = report.errors.len(),
                "reclaimed agent resources"
            );
        }
        report
    }
}

/// Kill every process whose joined command line matches `pattern`, except
/// ourselves and anything spawned by a live agent.
fn kill_matching(pattern: &Regex, live_agents: &LiveAgents) -> usize {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let own_pid = sysinfo::get_current_pid().ok();

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        if Some(*pid) == own_pid || process.thread_kind().is_some() {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if cmdline.is_empty() || !pattern.is_match(&cmdline) {
            continue;
        }
        if belongs_to_live_agent(&sys, *pid, live_agents) {
            debug!(pid = pid.as_u32(), cmdline = %cmdline, "sparing process of a running task");
            continue;
        }
        if process.kill() {
            debug!(pid = pid.as_u32(), cmdline = %cmdline, "killed leftover agent process");
            killed += 1;
        } else {
            warn!(pid = pid.as_u32(), cmdline = %cmdline, "failed to kill leftover agent process");
        }
    }
    killed
}

/// Whether `pid` is a live agent or one of its descendants.
fn belongs_to_live_agent(sys: &System, pid: Pid, live_agents: &LiveAgents) -> bool {
    if live_agents.is_empty() {
        return false;
    }
    let mut current = Some(pid);
    for _ in 0..MAX_ANCESTRY_DEPTH {
        let Some(pid) = current else {
            return false;
        };
        if live_agents.contains(pid.as_u32()) {
            return true;
        }
        current = sys.process(pid).and_then(|p| p.parent());
    }
    false
}

/// Remove every subdirectory of `dir`. Plain files are left alone and a
/// missing directory is not an error.
async fn sweep_scratch(dir: &Path, report: &mut ReclaimReport) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            report
                .errors
                .push(format!("read {}: {e}", dir.display()));
            return;
        },
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                report
                    .errors
                    .push(format!("read {}: {e}", dir.display()));
                break;
            },
        };
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if !is_dir {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => report.removed_dirs += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove scratch dir");
                report.errors.push(format!("remove {}: {e}", path.display()));
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn exclusive() -> ReclaimScope {
        ReclaimScope {
            live_agents: LiveAgents::new(),
            sweep_scratch: true,
        }
    }

    #[tokio::test]
    async fn sweeps_subdirectories_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run-1/nested")).unwrap();
        std::fs::create_dir(dir.path().join("run-2")).unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let reclaimer = SystemReclaimer::new(None, Some(dir.path().to_path_buf())).unwrap();
        let report = reclaimer.reclaim(&exclusive()).await;

        assert_eq!(report.removed_dirs, 2);
        assert!(report.errors.is_empty());
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("run-1").exists());
    }

    #[tokio::test]
    async fn missing_scratch_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let reclaimer =
            SystemReclaimer::new(None, Some(dir.path().join("never-created"))).unwrap();
        assert_eq!(reclaimer.reclaim(&exclusive()).await, ReclaimReport::default());
    }

    #[tokio::test]
    async fn scratch_sweep_waits_for_other_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("in-use")).unwrap();
        let reclaimer = SystemReclaimer::new(None, Some(dir.path().to_path_buf())).unwrap();

        let shared = ReclaimScope {
            sweep_scratch: false,
            ..exclusive()
        };
        assert_eq!(reclaimer.reclaim(&shared).await.removed_dirs, 0);
        assert!(dir.path().join("in-use").exists());

        assert_eq!(reclaimer.reclaim(&exclusive()).await.removed_dirs, 1);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = SystemReclaimer::new(Some("(unclosed"), None).unwrap_err();
        assert!(err.to_string().contains("(unclosed"));
        assert!(SystemReclaimer::new(Some("   "), None).unwrap().pattern.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kills_matching_processes() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("987")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // Give the process table a moment to show the new command line.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reclaimer = SystemReclaimer::new(Some(r"^sleep 987$"), None).unwrap();
        let report = reclaimer.reclaim(&exclusive()).await;
        assert!(report.killed >= 1);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spares_live_agents_and_their_children() {
        // The shell is the registered agent; the sleep it forks is its child.
        let mut agent = tokio::process::Command::new("sh")
            .args(["-c", "sleep 988; true"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let live_agents = LiveAgents::new();
        let _live = live_agents.register(agent.id().unwrap());
        let scope = ReclaimScope {
            live_agents,
            sweep_scratch: true,
        };
        let reclaimer = SystemReclaimer::new(Some(r"sleep 988"), None).unwrap();
        let report = reclaimer.reclaim(&scope).await;

        assert_eq!(report.killed, 0);
        assert!(agent.try_wait().unwrap().is_none());

        // Once the agent is gone, its leftover child is fair game.
        agent.kill().await.unwrap();
        let report = reclaimer.reclaim(&exclusive()).await;
        assert!(report.killed >= 1);
    }
}

//! Local subprocess execution.
//!
//! The child runs in its own process group with stdin from `/dev/null`
//! and stdout+stderr redirected to the log file, so a timeout kill can
//! take the whole group down and a crashed parent leaves a complete log
//! behind. The wrapper writes the same header/trailer lines the remote
//! side produces, which keeps trailer scanning uniform.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::{result_from_exit, RunOutcome, RunnerError, TestCommand};
use crate::status::{ExitStatus, ResultKind};

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Live process groups of running children, shared with the interrupt
/// handler so Ctrl-C can take every child's whole group down.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups {
    pids: std::sync::Arc<std::sync::Mutex<std::collections::HashSet<i32>>>,
}

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: i32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).insert(pid);
    }

    fn unregister(&self, pid: i32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).remove(&pid);
    }

    /// SIGTERM to every registered group, a grace period, then SIGKILL.
    pub fn terminate_all(&self) {
        let pids: Vec<i32> = self
            .pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        for pid in &pids {
            let _ = killpg(Pid::from_raw(*pid), Signal::SIGTERM);
        }
        if !pids.is_empty() {
            std::thread::sleep(Duration::from_secs(2));
            for pid in &pids {
                let _ = killpg(Pid::from_raw(*pid), Signal::SIGKILL);
            }
        }
    }
}

/// Runs a command locally with output to `log_path`, honoring `timeout`.
/// A timeout of zero means no timeout.
pub async fn run_with_log(
    cmd: &TestCommand,
    log_path: &Path,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> Result<RunOutcome, RunnerError> {
    run_tracked(cmd, log_path, timeout, poll_interval, None).await
}

/// [`run_with_log`] with the child's process group registered in
/// `groups` for the life of the run.
pub async fn run_tracked(
    cmd: &TestCommand,
    log_path: &Path,
    timeout: Option<Duration>,
    poll_interval: Duration,
    groups: Option<&ProcessGroups>,
) -> Result<RunOutcome, RunnerError> {
    let timeout = timeout.filter(|t| !t.is_zero());

    let mut logfp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(log_path)
        .map_err(|source| RunnerError::Log {
            path: log_path.to_path_buf(),
            source,
        })?;

    let header = format!(
        "Start Date: {}\nSubcommand: {}\nDirectory : {}\n\n",
        chrono::Local::now().format("%c"),
        cmd.to_shell_string(),
        cmd.chdir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| ".".to_string()),
    );
    logfp.write_all(header.as_bytes())?;
    logfp.flush()?;

    let start = Instant::now();

    let mut child = {
        let mut pc = tokio::process::Command::new(&cmd.program);
        pc.args(&cmd.args);
        for (k, v) in &cmd.env {
            pc.env(k, v);
        }
        if let Some(dir) = &cmd.chdir {
            pc.current_dir(dir);
        }
        pc.stdin(Stdio::null());
        pc.stdout(Stdio::from(logfp.try_clone()?));
        pc.stderr(Stdio::from(logfp.try_clone()?));
        pc.process_group(0);
        pc.spawn().map_err(|source| RunnerError::Spawn {
            program: cmd.program.clone(),
            source,
        })?
    };

    let pid = child.id().map(|p| p as i32);
    debug!("launched {} (pid {:?})", cmd.to_shell_string(), pid);

    if let (Some(groups), Some(pid)) = (groups, pid) {
        groups.register(pid);
    }

    let mut timed_out = false;
    let exit_code: Option<i32> = loop {
        let wait = match timeout {
            Some(tmo) => {
                let left = tmo.checked_sub(start.elapsed());
                match left {
                    Some(left) => left.min(poll_interval),
                    None => Duration::ZERO,
                }
            }
            None => poll_interval,
        };

        match tokio::time::timeout(wait, child.wait()).await {
            Ok(Ok(status)) => break status.code(),
            Ok(Err(e)) => {
                warn!("wait on child failed: {}", e);
                break None;
            }
            Err(_elapsed) => {
                if let Some(tmo) = timeout {
                    if start.elapsed() >= tmo {
                        timed_out = true;
                        kill_group(pid, &mut child).await;
                        break None;
                    }
                }
            }
        }
    };

    if let (Some(groups), Some(pid)) = (groups, pid) {
        groups.unregister(pid);
    }

    let runtime_secs = start.elapsed().as_secs() as i64;

    let (result, exit) = if timed_out {
        (ResultKind::Timeout, None)
    } else {
        match exit_code {
            Some(code) => {
                let exit = ExitStatus::Code(code);
                (result_from_exit(&exit), Some(exit))
            }
            // killed by a signal: no code, treat as failure
            None => (ResultKind::Fail, None),
        }
    };

    let trailer = format!(
        "\nSubcommand exit: {}\nFinish Date: {}\n",
        match &exit {
            Some(ExitStatus::Code(c)) => c.to_string(),
            Some(ExitStatus::Text(t)) => t.clone(),
            None => "None".to_string(),
        },
        chrono::Local::now().format("%c"),
    );
    let _ = logfp.write_all(trailer.as_bytes());
    let _ = logfp.flush();

    Ok(RunOutcome {
        result,
        exit,
        runtime_secs,
    })
}

/// SIGTERM to the process group, a grace period, then SIGKILL.
async fn kill_group(pid: Option<i32>, child: &mut tokio::process::Child) {
    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let pgid = Pid::from_raw(pid);

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!("SIGTERM to group {} failed: {}", pid, e);
    }

    let deadline = Instant::now() + KILL_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(_) => break,
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    warn!("process group {} survived SIGTERM, sending SIGKILL", pid);
    let _ = killpg(pgid, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let _ = child.try_wait();
}

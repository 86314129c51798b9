//! Remote execution over SSH.
//!
//! The remote side is driven through the [`RemoteAgent`] contract: launch
//! a detached command with its output going to a remote log, then poll
//! cheap facts about it (log size, process elapsed time) until it
//! disappears, pulling the log back whenever it grows. The agent here
//! realizes each call as a one-shot `ssh` invocation running a small
//! POSIX-sh snippet; the launch snippet detaches the payload with
//! `setsid`, enforces the timeout, and appends the `Subcommand exit:`
//! trailer the monitor scans.
//!
//! Every structured call replies with one JSON object on stdout
//! (`{"pid": 4242}`, `{"size": -1}`, ...), deserialized with
//! `serde_json` on this side; only the bulk [`RemoteAgent::read_file`]
//! transfer is raw bytes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{scan_exit_trailer, ExitScan, RunOutcome, RunnerError, TestCommand};
use crate::status::{ExitStatus, ResultKind};

/// Per-call SSH timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for bulk file transfer calls.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// File facts used to mirror the remote log locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub mtime: i64,
    pub atime: i64,
    pub mode: u32,
}

/// Operations the monitor needs from the remote host.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Launches `cmd` detached on the remote host with output redirected
    /// to `logfile`; returns the remote pid.
    async fn background_command(
        &self,
        cmd: &TestCommand,
        logfile: &str,
        chdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<i32, RunnerError>;

    /// `ps` output for the pid with the given output fields; empty when
    /// the process is gone.
    async fn processes(&self, pid: i32, fields: &str) -> Result<String, RunnerError>;

    /// Size of a remote file in bytes, `-1` when it does not exist.
    async fn file_size(&self, path: &str) -> Result<i64, RunnerError>;

    /// Whole contents of a remote file.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RunnerError>;

    /// mtime/atime/mode of a remote file.
    async fn file_stats(&self, path: &str) -> Result<FileStats, RunnerError>;

    /// One-line description of the remote machine.
    async fn machine_info(&self) -> Result<String, RunnerError>;
}

// The per-call reply envelopes the remote snippets print.

#[derive(Debug, Deserialize)]
struct PidReply {
    pid: i32,
}

#[derive(Debug, Deserialize)]
struct SizeReply {
    size: i64,
}

#[derive(Debug, Deserialize)]
struct StatsReply {
    mtime: i64,
    atime: i64,
    /// Octal text, e.g. `"644"`.
    mode: String,
}

#[derive(Debug, Deserialize)]
struct EtimeReply {
    etime: String,
}

#[derive(Debug, Deserialize)]
struct InfoReply {
    info: String,
}

fn parse_reply<T: serde::de::DeserializeOwned>(call: &str, out: &[u8]) -> Result<T, RunnerError> {
    serde_json::from_slice(out).map_err(|e| RunnerError::Remote {
        call: call.to_string(),
        detail: format!("bad reply {:?}: {}", String::from_utf8_lossy(out), e),
    })
}

/// Escapes a captured shell variable so it can sit inside a JSON string:
/// backslashes and double quotes get backslash-escaped, newlines
/// collapse to spaces.
const SH_JSON_ESCAPE: &str = r#"sed 's/\\/\\\\/g; s/"/\\"/g' | tr '\n' ' '"#;

/// A [`RemoteAgent`] over one-shot `ssh` invocations.
pub struct SshAgent {
    machine: String,
    ssh_exe: String,
    ssh_opts: Vec<String>,
}

impl SshAgent {
    pub fn new(machine: impl Into<String>, ssh_exe: Option<&str>) -> Self {
        Self {
            machine: machine.into(),
            ssh_exe: ssh_exe.unwrap_or("ssh").to_string(),
            ssh_opts: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=30".to_string(),
            ],
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// Runs a shell snippet on the remote host, capturing stdout.
    async fn ssh_call(
        &self,
        call: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, RunnerError> {
        let mut cmd = tokio::process::Command::new(&self.ssh_exe);
        cmd.args(&self.ssh_opts);
        cmd.arg(&self.machine);
        cmd.arg(script);
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let remote_err = |detail: String| RunnerError::Remote {
            call: call.to_string(),
            detail,
        };

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| remote_err(format!("timed out after {:?}", timeout)))?
            .map_err(|e| remote_err(e.to_string()))?;

        if !output.status.success() {
            return Err(remote_err(format!(
                "exit {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Verifies connectivity, retrying up to `attempts` times sleeping
    /// `2^i` seconds between tries.
    pub async fn connect(&self, attempts: u32) -> Result<String, RunnerError> {
        assert!(attempts > 0);
        let mut last = String::new();
        for i in 0..attempts {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(1u64 << i.min(10))).await;
            }
            match self.machine_info().await {
                Ok(info) => {
                    info!("connected to {}: {}", self.machine, info.trim());
                    return Ok(info);
                }
                Err(e) => {
                    // print each unique failure once, not per retry
                    let msg = e.to_string();
                    if msg != last {
                        warn!("connect attempt {} to {}: {}", i + 1, self.machine, msg);
                        last = msg;
                    }
                }
            }
        }
        Err(RunnerError::Connect {
            machine: self.machine.clone(),
            attempts,
        })
    }
}

#[async_trait]
impl RemoteAgent for SshAgent {
    async fn background_command(
        &self,
        cmd: &TestCommand,
        logfile: &str,
        chdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<i32, RunnerError> {
        let payload = cmd.to_shell_string();
        let cd = chdir
            .map(|d| format!("cd {} && ", shell_words::quote(d)))
            .unwrap_or_default();

        // run the payload under `timeout` when bounded; 124 is the
        // timeout utility's kill marker, written to the trailer as None
        let run = match timeout {
            Some(tmo) => format!(
                "timeout -k 10 {} sh -c {pay}; x=$?; if [ \"$x\" = 124 ]; then x=None; fi",
                tmo.as_secs(),
                pay = shell_words::quote(&payload),
            ),
            None => format!("sh -c {pay}; x=$?", pay = shell_words::quote(&payload)),
        };

        let wrapper = format!(
            concat!(
                "{{ echo \"Start Date: $(date)\"; ",
                "echo \"Parent PID: $$\"; ",
                "echo \"Subcommand: \"{pay}; ",
                "echo \"Directory : $(pwd)\"; echo; ",
                "{run}; echo; ",
                "echo \"Subcommand exit: $x\"; ",
                "echo \"Finish Date: $(date)\"; }} > {log} 2>&1"
            ),
            pay = shell_words::quote(&payload),
            run = run,
            log = shell_words::quote(logfile),
        );

        let script = format!(
            "{cd}setsid sh -c {wrapper} < /dev/null > /dev/null 2>&1 & \
             printf '{{\"pid\": %s}}\\n' $!",
            cd = cd,
            wrapper = shell_words::quote(&wrapper),
        );

        let out = self
            .ssh_call("background_command", &script, CALL_TIMEOUT)
            .await?;
        let reply: PidReply = parse_reply("background_command", &out)?;
        Ok(reply.pid)
    }

    async fn processes(&self, pid: i32, fields: &str) -> Result<String, RunnerError> {
        let script = format!(
            "v=$(ps -o {fields}= -p {pid} 2>/dev/null | {esc}); \
             printf '{{\"etime\": \"%s\"}}\\n' \"$v\"",
            fields = fields,
            pid = pid,
            esc = SH_JSON_ESCAPE,
        );
        let out = self.ssh_call("processes", &script, CALL_TIMEOUT).await?;
        let reply: EtimeReply = parse_reply("processes", &out)?;
        Ok(reply.etime)
    }

    async fn file_size(&self, path: &str) -> Result<i64, RunnerError> {
        let script = format!(
            "if [ -e {p} ]; then s=$(wc -c < {p}); else s=-1; fi; \
             printf '{{\"size\": %s}}\\n' \"$s\"",
            p = shell_words::quote(path)
        );
        let out = self.ssh_call("file_size", &script, CALL_TIMEOUT).await?;
        let reply: SizeReply = parse_reply("file_size", &out)?;
        Ok(reply.size)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RunnerError> {
        // bulk transfer stays raw; an envelope would force re-encoding
        // arbitrary log bytes
        let script = format!("cat {}", shell_words::quote(path));
        self.ssh_call("read_file", &script, TRANSFER_TIMEOUT).await
    }

    async fn file_stats(&self, path: &str) -> Result<FileStats, RunnerError> {
        let script = format!(
            "set -- $(stat -c '%Y %X %a' {p} 2>/dev/null || stat -f '%m %a %Lp' {p}); \
             printf '{{\"mtime\": %s, \"atime\": %s, \"mode\": \"%s\"}}\\n' \"$1\" \"$2\" \"$3\"",
            p = shell_words::quote(path)
        );
        let out = self.ssh_call("file_stats", &script, CALL_TIMEOUT).await?;
        let reply: StatsReply = parse_reply("file_stats", &out)?;
        let mode = u32::from_str_radix(&reply.mode, 8).map_err(|_| RunnerError::Remote {
            call: "file_stats".to_string(),
            detail: format!("bad mode field: {:?}", reply.mode),
        })?;
        Ok(FileStats {
            mtime: reply.mtime,
            atime: reply.atime,
            mode,
        })
    }

    async fn machine_info(&self) -> Result<String, RunnerError> {
        let script = format!(
            "v=$(echo \"user=$(id -un) sysname=$(uname -s) nodename=$(uname -n) \
             uptime=$(uptime)\" | {esc}); printf '{{\"info\": \"%s\"}}\\n' \"$v\"",
            esc = SH_JSON_ESCAPE,
        );
        let out = self
            .ssh_call("get_machine_info", &script, CALL_TIMEOUT)
            .await?;
        let reply: InfoReply = parse_reply("get_machine_info", &out)?;
        Ok(reply.info)
    }
}

/// Knobs for [`monitor_remote`].
#[derive(Debug, Clone)]
pub struct MonitorParams {
    pub remote_log: String,
    pub local_log: PathBuf,
    /// The remote writes straight to the local path (shared filesystem);
    /// skip pulling.
    pub shared_log: bool,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Minimum seconds between repeated monitor-exception prints.
    pub exception_print_interval: Duration,
}

/// Watches a remote background process to completion: pulls the log as
/// it grows, queries the process's elapsed time, and recovers the exit
/// status from the log trailer once the process disappears. The monitor
/// itself times out at `timeout + 2` seconds.
pub async fn monitor_remote(
    agent: &dyn RemoteAgent,
    rpid: i32,
    params: &MonitorParams,
) -> Result<RunOutcome, RunnerError> {
    let start = Instant::now();

    // give the job a moment to start before the first log pull
    tokio::time::sleep(Duration::from_secs(2)).await;

    let (monitor_timeout, ipoll) = match params.timeout {
        Some(tmo) => {
            let mt = tmo + Duration::from_secs(2);
            let cap = Duration::from_secs(((mt.as_secs() as f64 * 0.45) as u64).max(1));
            (Some(mt), params.poll_interval.min(cap))
        }
        None => (None, params.poll_interval),
    };

    let mut pause = Duration::from_secs(2);
    let mut last_exc = String::new();
    let mut last_exc_at = Instant::now()
        .checked_sub(params.exception_print_interval)
        .unwrap_or_else(Instant::now);
    let mut timed_out = false;

    loop {
        let mut process_alive = true;

        let tick = async {
            if !params.shared_log {
                pull_log(agent, &params.remote_log, &params.local_log).await?;
            }
            let etime = agent.processes(rpid, "etime").await?;
            Ok::<bool, RunnerError>(!etime.trim().is_empty())
        };

        match tick.await {
            Ok(alive) => process_alive = alive,
            Err(e) => {
                // transient monitor faults are logged sparsely and ignored
                let msg = e.to_string();
                let due = last_exc_at.elapsed() >= params.exception_print_interval;
                if msg != last_exc || due {
                    warn!(
                        "monitor exception for remote pid {} (continuing): {}",
                        rpid, msg
                    );
                    last_exc = msg;
                    last_exc_at = Instant::now();
                }
            }
        }

        if !process_alive {
            debug!("remote pid {} is gone", rpid);
            break;
        }

        if let Some(mt) = monitor_timeout {
            if start.elapsed() > mt {
                warn!(
                    "monitor timed out after {}s for remote pid {}",
                    start.elapsed().as_secs(),
                    rpid
                );
                timed_out = true;
                break;
            }
        }

        tokio::time::sleep(pause).await;
        pause = (pause * 2).min(ipoll);
    }

    // final log pull so the trailer is present locally
    if !params.shared_log {
        if let Err(e) = pull_log(agent, &params.remote_log, &params.local_log).await {
            warn!("final log pull failed: {}", e);
        }
    }

    let runtime_secs = start.elapsed().as_secs() as i64;
    let outcome = match scan_exit_trailer(&params.local_log) {
        Some(ExitScan::Exited(exit)) => RunOutcome {
            result: super::result_from_exit(&exit),
            exit: Some(exit),
            runtime_secs,
        },
        Some(ExitScan::TimedOut) => RunOutcome {
            result: ResultKind::Timeout,
            exit: None,
            runtime_secs,
        },
        None => RunOutcome {
            result: if timed_out {
                ResultKind::Timeout
            } else {
                ResultKind::Fail
            },
            exit: Some(ExitStatus::Text("unknown".to_string())),
            runtime_secs,
        },
    };
    Ok(outcome)
}

/// Pulls the whole remote log when its size differs from the local copy,
/// restoring mtime/atime/mode on the local file.
async fn pull_log(
    agent: &dyn RemoteAgent,
    remote_log: &str,
    local_log: &Path,
) -> Result<(), RunnerError> {
    let local_size = std::fs::metadata(local_log).map(|m| m.len() as i64).unwrap_or(-1);
    let remote_size = agent.file_size(remote_log).await?;

    if remote_size >= 0 && remote_size != local_size {
        let content = agent.read_file(remote_log).await?;
        let stats = agent.file_stats(remote_log).await;
        std::fs::write(local_log, &content)?;
        if let Ok(stats) = stats {
            apply_file_stats(local_log, &stats);
        }
    }
    Ok(())
}

fn apply_file_stats(path: &Path, stats: &FileStats) {
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(stats.mode));
    let times = [
        nix::sys::time::TimeVal::new(stats.atime, 0),
        nix::sys::time::TimeVal::new(stats.mtime, 0),
    ];
    let _ = nix::sys::stat::utimes(path, &times[0], &times[1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    /// A scripted agent: the "remote" process stays alive for a fixed
    /// number of polls, appending to an in-memory log.
    struct FakeAgent {
        polls_until_done: AtomicI64,
        log: Mutex<Vec<u8>>,
        final_trailer: String,
    }

    impl FakeAgent {
        fn new(polls: i64, trailer: &str) -> Self {
            Self {
                polls_until_done: AtomicI64::new(polls),
                log: Mutex::new(b"starting\n".to_vec()),
                final_trailer: trailer.to_string(),
            }
        }
    }

    #[async_trait]
    impl RemoteAgent for FakeAgent {
        async fn background_command(
            &self,
            _cmd: &TestCommand,
            _logfile: &str,
            _chdir: Option<&str>,
            _timeout: Option<Duration>,
        ) -> Result<i32, RunnerError> {
            Ok(4242)
        }

        async fn processes(&self, _pid: i32, _fields: &str) -> Result<String, RunnerError> {
            let left = self.polls_until_done.fetch_sub(1, Ordering::SeqCst);
            if left > 0 {
                Ok("   01:23\n".to_string())
            } else {
                let mut log = self.log.lock().unwrap();
                if !self.final_trailer.is_empty() {
                    log.extend_from_slice(self.final_trailer.as_bytes());
                }
                Ok(String::new())
            }
        }

        async fn file_size(&self, _path: &str) -> Result<i64, RunnerError> {
            Ok(self.log.lock().unwrap().len() as i64)
        }

        async fn read_file(&self, _path: &str) -> Result<Vec<u8>, RunnerError> {
            Ok(self.log.lock().unwrap().clone())
        }

        async fn file_stats(&self, _path: &str) -> Result<FileStats, RunnerError> {
            Ok(FileStats {
                mtime: 1700000000,
                atime: 1700000000,
                mode: 0o644,
            })
        }

        async fn machine_info(&self) -> Result<String, RunnerError> {
            Ok("user=u sysname=Linux nodename=fake".to_string())
        }
    }

    fn params(dir: &Path) -> MonitorParams {
        MonitorParams {
            remote_log: "/remote/j.log".to_string(),
            local_log: dir.join("j.log"),
            shared_log: false,
            timeout: Some(Duration::from_secs(60)),
            poll_interval: Duration::from_millis(20),
            exception_print_interval: Duration::from_secs(900),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_recovers_exit_from_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new(2, "Subcommand exit: 0\n");

        let out = monitor_remote(&agent, 4242, &params(dir.path())).await.unwrap();
        assert_eq!(out.result, ResultKind::Pass);
        assert_eq!(out.exit, Some(ExitStatus::Code(0)));

        let text = std::fs::read_to_string(dir.path().join("j.log")).unwrap();
        assert!(text.contains("Subcommand exit: 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_maps_none_trailer_to_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new(1, "Subcommand exit: None\n");

        let out = monitor_remote(&agent, 4242, &params(dir.path())).await.unwrap();
        assert_eq!(out.result, ResultKind::Timeout);
        assert!(out.exit.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_process_without_trailer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::new(1, "");

        let out = monitor_remote(&agent, 4242, &params(dir.path())).await.unwrap();
        assert_eq!(out.result, ResultKind::Fail);
    }

    #[test]
    fn reply_envelopes_parse() {
        let r: PidReply = parse_reply("background_command", br#"{"pid": 4242}"#).unwrap();
        assert_eq!(r.pid, 4242);

        // printf-produced numbers may carry leading whitespace
        let r: SizeReply = parse_reply("file_size", b"{\"size\":  -1}\n").unwrap();
        assert_eq!(r.size, -1);

        let r: StatsReply = parse_reply(
            "file_stats",
            br#"{"mtime": 1700000000, "atime": 1700000001, "mode": "644"}"#,
        )
        .unwrap();
        assert_eq!(u32::from_str_radix(&r.mode, 8).unwrap(), 0o644);

        let r: EtimeReply = parse_reply("processes", br#"{"etime": "   01:23 "}"#).unwrap();
        assert!(!r.etime.trim().is_empty());
    }

    #[test]
    fn malformed_reply_is_a_remote_error() {
        let err = parse_reply::<SizeReply>("file_size", b"wc: no such file").unwrap_err();
        match err {
            RunnerError::Remote { call, detail } => {
                assert_eq!(call, "file_size");
                assert!(detail.contains("bad reply"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

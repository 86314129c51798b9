//! Per-test subprocess launching.
//!
//! Both runners redirect the child's output to a per-run log file named
//! `<name>[-<machine>]-<date>.log` and record a trailer line
//! (`Subcommand exit: <n>`) that monitors can scan to recover the exit
//! status after the fact. [`local`] runs the child in its own process
//! group on this machine; [`remote`] launches and monitors it on another
//! host over SSH.

pub mod local;
pub mod remote;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::status::{ExitStatus, ResultKind};

/// Exit code conventionally used by test scripts to report a diff.
pub const DIFF_EXIT_STATUS: i32 = 64;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("cannot open log file {path}: {source}")]
    Log {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("remote call {call:?} failed: {detail}")]
    Remote { call: String, detail: String },

    #[error("could not connect to {machine} after {attempts} attempts")]
    Connect { machine: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished (or abandoned) execution looked like.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: ResultKind,
    pub exit: Option<ExitStatus>,
    pub runtime_secs: i64,
}

/// A command to launch for one test or job.
#[derive(Debug, Clone, Default)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub chdir: Option<PathBuf>,
}

impl TestCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Parses a shell-style command line into program + args.
    pub fn from_shell(line: &str) -> Option<Self> {
        let words = shell_words::split(line).ok()?;
        let (program, args) = words.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
            chdir: None,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    /// The command as one escaped shell line.
    pub fn to_shell_string(&self) -> String {
        let mut words = vec![self.program.clone()];
        words.extend(self.args.iter().cloned());
        shell_words::join(words.iter().map(String::as_str))
    }

    /// The base name used for job naming and log files.
    pub fn basename(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// Builds the log file name for one execution.
pub fn log_file_name(name: &str, machine: Option<&str>, date: &str) -> String {
    match machine {
        Some(m) => format!("{}-{}-{}.log", name, m, date),
        None => format!("{}-{}.log", name, date),
    }
}

/// The datestamp used in log file names and job ids.
pub fn date_stamp() -> String {
    chrono::Local::now().format("%a_%b_%d_%Y_%H:%M:%S").to_string()
}

/// What a log trailer scan found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitScan {
    /// `Subcommand exit: <value>` with a concrete value.
    Exited(ExitStatus),
    /// `Subcommand exit: None`, the wrapper's marker for a timeout kill.
    TimedOut,
}

/// Scans the tail of a log file for the `Subcommand exit:` trailer.
pub fn scan_exit_trailer(log_path: &Path) -> Option<ExitScan> {
    let data = std::fs::read(log_path).ok()?;
    let tail_start = data.len().saturating_sub(256);
    let tail = String::from_utf8_lossy(&data[tail_start..]);

    let after = tail.rsplit("Subcommand exit:").next()?;
    if after.len() == tail.len() {
        return None; // marker not present
    }
    let value = after.lines().next()?.trim();
    if value.is_empty() {
        return None;
    }
    if value.eq_ignore_ascii_case("none") {
        return Some(ExitScan::TimedOut);
    }
    match value.parse::<i32>() {
        Ok(code) => Some(ExitScan::Exited(ExitStatus::Code(code))),
        Err(_) => Some(ExitScan::Exited(ExitStatus::Text(value.to_string()))),
    }
}

/// Maps an exit status to a test result: 0 is a pass, the diff
/// convention code is a diff, anything else fails.
pub fn result_from_exit(exit: &ExitStatus) -> ResultKind {
    match exit {
        ExitStatus::Code(0) => ResultKind::Pass,
        ExitStatus::Code(DIFF_EXIT_STATUS) => ResultKind::Diff,
        _ => ResultKind::Fail,
    }
}

/// Whether the `COMMAND_DRYRUN` environment variable suppresses real
/// execution for the named job. Empty or `"1"` suppresses everything; a
/// slash-separated name list allows only the named jobs through.
pub fn dryrun_suppressed(name: &str) -> bool {
    match std::env::var("COMMAND_DRYRUN") {
        Err(_) => false,
        Ok(v) => {
            if !v.is_empty() && v != "1" {
                !v.split('/').any(|allowed| allowed == name)
            } else {
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_round_trip() {
        let cmd = TestCommand::new("/usr/bin/solver")
            .arg("--input")
            .arg("mesh file.dat");
        let line = cmd.to_shell_string();
        assert!(line.contains("'mesh file.dat'"));

        let back = TestCommand::from_shell(&line).unwrap();
        assert_eq!(back.program, "/usr/bin/solver");
        assert_eq!(back.args, vec!["--input", "mesh file.dat"]);
        assert_eq!(back.basename(), "solver");
    }

    #[test]
    fn log_names_carry_machine_and_date() {
        assert_eq!(
            log_file_name("heat", None, "Thu_Mar_07_2024_09:15:00"),
            "heat-Thu_Mar_07_2024_09:15:00.log"
        );
        assert_eq!(
            log_file_name("heat", Some("cluster9"), "Thu_Mar_07_2024_09:15:00"),
            "heat-cluster9-Thu_Mar_07_2024_09:15:00.log"
        );
    }

    #[test]
    fn trailer_scan_parses_codes_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t.log");

        std::fs::write(&log, "output...\nSubcommand exit: 0\nFinish Date: x\n").unwrap();
        assert_eq!(
            scan_exit_trailer(&log),
            Some(ExitScan::Exited(ExitStatus::Code(0)))
        );

        std::fs::write(&log, "output...\nSubcommand exit: None\n").unwrap();
        assert_eq!(scan_exit_trailer(&log), Some(ExitScan::TimedOut));

        std::fs::write(&log, "output...\nSubcommand exit: killed\n").unwrap();
        assert_eq!(
            scan_exit_trailer(&log),
            Some(ExitScan::Exited(ExitStatus::Text("killed".into())))
        );

        std::fs::write(&log, "no trailer here\n").unwrap();
        assert_eq!(scan_exit_trailer(&log), None);
    }

    #[test]
    fn only_the_last_trailer_counts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t.log");
        std::fs::write(
            &log,
            "Subcommand exit: 1\nretry...\nSubcommand exit: 0\n",
        )
        .unwrap();
        assert_eq!(
            scan_exit_trailer(&log),
            Some(ExitScan::Exited(ExitStatus::Code(0)))
        );
    }

    #[test]
    fn exit_to_result_mapping() {
        assert_eq!(result_from_exit(&ExitStatus::Code(0)), ResultKind::Pass);
        assert_eq!(result_from_exit(&ExitStatus::Code(64)), ResultKind::Diff);
        assert_eq!(result_from_exit(&ExitStatus::Code(1)), ResultKind::Fail);
        assert_eq!(
            result_from_exit(&ExitStatus::Text("killed".into())),
            ResultKind::Fail
        );
    }
}

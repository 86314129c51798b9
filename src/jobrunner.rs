//! Background job execution.
//!
//! A [`JobRunner`] starts commands in the background - locally or on a
//! remote machine - with output always redirected to a log file, and
//! tracks them in a job database keyed by the `(name, machine, date)`
//! triple. Each job runs in its own worker task; faults during
//! submission, start, or execution land in the job's sticky `exc`
//! attribute and never take the runner down.
//!
//! The runner is an explicit context value: construct one and thread it
//! through `submit`/`poll`/`wait` call sites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::runner::local;
use crate::runner::remote::{monitor_remote, MonitorParams, RemoteAgent, SshAgent};
use crate::runner::{date_stamp, dryrun_suppressed, log_file_name, RunnerError, TestCommand};
use crate::status::ExitStatus;

/// Unique job identity: `(name, machine, date-string)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId {
    pub name: String,
    pub machine: Option<String>,
    pub date: String,
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.machine {
            Some(m) => write!(f, "({}, {}, {})", self.name, m, self.date),
            None => write!(f, "({}, {})", self.name, self.date),
        }
    }
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Construction; staying here means submission failed.
    Setup,
    /// Finalized, possibly parked behind a predecessor.
    Ready,
    /// Worker task running.
    Run,
    /// Worker finished (exit or fault recorded).
    Done,
}

/// Submission request for one background job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub command: TestCommand,
    /// Job name; the command basename when absent.
    pub name: Option<String>,
    /// Run on this machine over SSH instead of locally.
    pub machine: Option<String>,
    pub chdir: Option<PathBuf>,
    /// Where the log file goes; the working directory when absent.
    pub logdir: Option<PathBuf>,
    /// Remote log is already on a shared filesystem; skip pulling.
    pub sharedlog: bool,
    pub timeout: Option<Duration>,
    /// Absolute deadline (epoch seconds); converted to a timeout at
    /// launch.
    pub timeout_date: Option<i64>,
    pub poll_interval: Option<Duration>,
    pub sshexe: Option<String>,
    pub connection_attempts: Option<u32>,
    /// Launch only after this job has completed.
    pub waitforjobid: Option<JobId>,
}

impl JobSpec {
    pub fn new(command: TestCommand) -> Self {
        Self {
            command,
            name: None,
            machine: None,
            chdir: None,
            logdir: None,
            sharedlog: false,
            timeout: None,
            timeout_date: None,
            poll_interval: None,
            sshexe: None,
            connection_attempts: None,
            waitforjobid: None,
        }
    }
}

#[derive(Debug, Default)]
struct JobAttrs {
    state: Option<JobState>,
    exit: Option<ExitStatus>,
    exc: Option<String>,
}

/// A background job; shared between the runner and its worker task.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    logname: String,
    attrs: Mutex<JobAttrs>,
}

impl Job {
    fn new(id: JobId, logname: String, state: JobState) -> Self {
        Self {
            id,
            logname,
            attrs: Mutex::new(JobAttrs {
                state: Some(state),
                ..JobAttrs::default()
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Log file name (no directory).
    pub fn logname(&self) -> &str {
        &self.logname
    }

    pub fn state(&self) -> JobState {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).state.unwrap_or(JobState::Setup)
    }

    pub fn exit(&self) -> Option<ExitStatus> {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).exit.clone()
    }

    pub fn exception(&self) -> Option<String> {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).exc.clone()
    }

    /// Whether the job exited with integer status zero.
    pub fn successful(&self) -> bool {
        matches!(self.exit(), Some(ExitStatus::Code(0)))
    }

    fn set_state(&self, state: JobState) {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).state = Some(state);
    }

    fn set_exit(&self, exit: Option<ExitStatus>) {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).exit = exit;
    }

    fn set_exception(&self, msg: String) {
        self.attrs.lock().unwrap_or_else(|e| e.into_inner()).exc = Some(msg);
    }

    fn is_complete(&self) -> bool {
        matches!(self.state(), JobState::Setup | JobState::Done)
    }
}

/// Runner defaults, overridable per job via [`JobSpec`].
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub poll_interval: Duration,
    pub remote_poll_interval: Duration,
    pub exception_print_interval: Duration,
    pub timeout: Option<Duration>,
    pub chdir: Option<PathBuf>,
    pub sshexe: Option<String>,
    pub connection_attempts: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            remote_poll_interval: Duration::from_secs(5 * 60),
            exception_print_interval: Duration::from_secs(15 * 60),
            timeout: None,
            chdir: None,
            sshexe: None,
            connection_attempts: 10,
        }
    }
}

/// The job database plus waiting list.
#[derive(Debug, Default)]
pub struct JobRunner {
    defaults: JobDefaults,
    jobdb: HashMap<JobId, Arc<Job>>,
    waiting: Vec<(Arc<Job>, JobSpec, JobId)>,
    handles: HashMap<JobId, JoinHandle<()>>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: JobDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    pub fn job(&self, id: &JobId) -> Option<Arc<Job>> {
        self.jobdb.get(id).cloned()
    }

    /// Constructs, finalizes, and launches (or parks) a job. Returns the
    /// job id; inspect the job's state and `exc` for submission faults.
    ///
    /// The runner sleeps one second before returning so that successive
    /// submissions get distinct date stamps (the date is part of the
    /// identity triple).
    pub async fn submit_job(&mut self, spec: JobSpec) -> JobId {
        self.poll_jobs();

        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| spec.command.basename());
        let id = JobId {
            name: name.clone(),
            machine: spec.machine.clone(),
            date: date_stamp(),
        };
        let logname = log_file_name(&name, spec.machine.as_deref(), &id.date);

        info!("submit {}: {}", id, spec.command.to_shell_string());

        // validate before finalizing; a bad waitfor is a submission fault
        if let Some(waitid) = &spec.waitforjobid {
            if !self.jobdb.contains_key(waitid) {
                let job = Arc::new(Job::new(id.clone(), logname, JobState::Setup));
                job.set_exception(format!("waitforjobid not in job list: {}", waitid));
                error!("submission failed for {}: unknown predecessor", id);
                self.jobdb.insert(id.clone(), job);
                tokio::time::sleep(Duration::from_secs(1)).await;
                return id;
            }
        }

        if spec.command.program.is_empty() {
            let job = Arc::new(Job::new(id.clone(), logname, JobState::Setup));
            job.set_exception("empty or no command given".to_string());
            self.jobdb.insert(id.clone(), job);
            tokio::time::sleep(Duration::from_secs(1)).await;
            return id;
        }

        let job = Arc::new(Job::new(id.clone(), logname, JobState::Ready));
        self.jobdb.insert(id.clone(), job.clone());

        match spec.waitforjobid.clone() {
            Some(waitid) => {
                info!("job {} waiting on {}", id, waitid);
                self.waiting.push((job, spec, waitid));
            }
            None => self.launch_job(job, spec),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        id
    }

    fn launch_job(&mut self, job: Arc<Job>, spec: JobSpec) {
        let defaults = self.defaults.clone();
        let id = job.id().clone();
        job.set_state(JobState::Run);

        let worker_job = job.clone();
        let handle = tokio::spawn(async move {
            let outcome = execute_job(&worker_job, &spec, &defaults).await;
            match outcome {
                Ok(exit) => worker_job.set_exit(exit),
                Err(e) => {
                    let msg = e.to_string();
                    error!("job {} faulted: {}", worker_job.id(), msg);
                    worker_job.set_exception(msg);
                }
            }
            worker_job.set_state(JobState::Done);
        });
        self.handles.insert(id, handle);
    }

    /// Reaps finished workers and launches any waiting job whose
    /// predecessor has completed.
    pub fn poll_jobs(&mut self) {
        self.handles.retain(|id, handle| {
            if handle.is_finished() {
                if let Some(job) = self.jobdb.get(id) {
                    info!(
                        "job done {}: exit={:?} exc={:?}",
                        id,
                        job.exit(),
                        job.exception()
                    );
                }
                false
            } else {
                true
            }
        });

        let mut still_waiting = Vec::new();
        let mut to_launch = Vec::new();
        for (job, spec, waitid) in self.waiting.drain(..) {
            let ready = self
                .jobdb
                .get(&waitid)
                .map(|w| w.is_complete())
                .unwrap_or(true);
            if ready {
                to_launch.push((job, spec));
            } else {
                still_waiting.push((job, spec, waitid));
            }
        }
        self.waiting = still_waiting;
        for (job, spec) in to_launch {
            self.launch_job(job, spec);
        }
    }

    /// Whether the job has completed (or failed submission).
    ///
    /// # Panics
    ///
    /// Panics if the job id is unknown.
    pub fn poll_job(&mut self, id: &JobId) -> bool {
        self.poll_jobs();
        self.jobdb
            .get(id)
            .unwrap_or_else(|| panic!("unknown job id: {}", id))
            .is_complete()
    }

    /// Waits for one job, polling at `poll_interval`.
    pub async fn wait_job(&mut self, id: &JobId) -> Arc<Job> {
        let ipoll = self.defaults.poll_interval;
        loop {
            self.poll_jobs();
            let job = self
                .jobdb
                .get(id)
                .unwrap_or_else(|| panic!("unknown job id: {}", id))
                .clone();
            if job.is_complete() {
                return job;
            }
            tokio::time::sleep(ipoll).await;
        }
    }

    /// Waits for the listed jobs, or every submitted job when the list
    /// is empty.
    pub async fn wait_all(&mut self, ids: &[JobId]) -> Vec<Arc<Job>> {
        let ids: Vec<JobId> = if ids.is_empty() {
            self.jobdb
                .iter()
                .filter(|(_, j)| matches!(j.state(), JobState::Ready | JobState::Run))
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            ids.to_vec()
        };

        let mut done = Vec::new();
        for id in &ids {
            done.push(self.wait_job(id).await);
        }
        done
    }

    /// Submit + wait; the job's exit status.
    pub async fn run_wait(&mut self, spec: JobSpec) -> Option<ExitStatus> {
        let id = self.submit_job(spec).await;
        let job = self.wait_job(&id).await;
        job.exit()
    }
}

fn effective_timeout(spec: &JobSpec, defaults: &JobDefaults) -> Option<Duration> {
    if let Some(tmo) = spec.timeout {
        return Some(tmo);
    }
    if let Some(deadline) = spec.timeout_date {
        let now = chrono::Utc::now().timestamp();
        return Some(Duration::from_secs((deadline - now).max(1) as u64));
    }
    defaults.timeout
}

async fn execute_job(
    job: &Job,
    spec: &JobSpec,
    defaults: &JobDefaults,
) -> Result<Option<ExitStatus>, RunnerError> {
    let chdir = spec.chdir.clone().or_else(|| defaults.chdir.clone());
    let logdir = spec.logdir.clone().or_else(|| chdir.clone());
    let local_log = logdir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(job.logname());
    let timeout = effective_timeout(spec, defaults);

    if dryrun_suppressed(&job.id().name) {
        info!("dry run: {} not executed", job.id());
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&local_log)
            .map_err(|source| RunnerError::Log {
                path: local_log.clone(),
                source,
            })?;
        return Ok(Some(ExitStatus::Code(0)));
    }

    match &spec.machine {
        None => {
            let ipoll = spec.poll_interval.unwrap_or(defaults.poll_interval);
            let mut cmd = spec.command.clone();
            if let Some(dir) = &chdir {
                cmd = cmd.chdir(dir.clone());
            }
            let outcome = local::run_with_log(&cmd, &local_log, timeout, ipoll).await?;
            Ok(outcome.exit)
        }
        Some(machine) => {
            let agent = SshAgent::new(
                machine.clone(),
                spec.sshexe
                    .as_deref()
                    .or(defaults.sshexe.as_deref()),
            );
            let attempts = spec
                .connection_attempts
                .unwrap_or(defaults.connection_attempts);
            agent.connect(attempts).await?;

            let remote_log = if spec.sharedlog {
                local_log
                    .canonicalize()
                    .unwrap_or_else(|_| local_log.clone())
                    .display()
                    .to_string()
            } else {
                job.logname().to_string()
            };

            let rpid = agent
                .background_command(
                    &spec.command,
                    &remote_log,
                    chdir.as_deref().map(|p| p.to_str().unwrap_or(".")),
                    timeout,
                )
                .await?;
            info!("job {} remote pid {}", job.id(), rpid);

            let params = MonitorParams {
                remote_log,
                local_log,
                shared_log: spec.sharedlog,
                timeout,
                poll_interval: spec
                    .poll_interval
                    .unwrap_or(defaults.remote_poll_interval),
                exception_print_interval: defaults.exception_print_interval,
            };
            let outcome = monitor_remote(&agent, rpid, &params).await?;
            if outcome.result == crate::status::ResultKind::Timeout {
                warn!("job {} timed out on {}", job.id(), machine);
            }
            Ok(outcome.exit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> TestCommand {
        TestCommand::new("/bin/sh").arg("-c").arg(script)
    }

    fn quick_defaults() -> JobDefaults {
        JobDefaults {
            poll_interval: Duration::from_millis(20),
            ..JobDefaults::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_and_wait_local_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let mut spec = JobSpec::new(sh("echo out; exit 0"));
        spec.name = Some("hello".to_string());
        spec.chdir = Some(dir.path().to_path_buf());

        let id = runner.submit_job(spec).await;
        assert_eq!(id.name, "hello");

        let job = runner.wait_job(&id).await;
        assert_eq!(job.state(), JobState::Done);
        assert!(job.successful());
        assert!(dir.path().join(job.logname()).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_command_is_not_successful() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let mut spec = JobSpec::new(sh("exit 7"));
        spec.name = Some("failing".to_string());
        spec.chdir = Some(dir.path().to_path_buf());

        let id = runner.submit_job(spec).await;
        let job = runner.wait_job(&id).await;
        assert!(!job.successful());
        assert_eq!(job.exit(), Some(ExitStatus::Code(7)));
        assert!(job.exception().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_predecessor_is_a_submission_fault() {
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let ghost = JobId {
            name: "ghost".into(),
            machine: None,
            date: "never".into(),
        };
        let mut spec = JobSpec::new(sh("true"));
        spec.name = Some("blocked".to_string());
        spec.waitforjobid = Some(ghost);

        let id = runner.submit_job(spec).await;
        assert!(runner.poll_job(&id));
        let job = runner.job(&id).unwrap();
        assert_eq!(job.state(), JobState::Setup);
        assert!(job.exception().unwrap().contains("waitforjobid"));
        assert!(!job.successful());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_job_launches_after_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let mut first = JobSpec::new(sh("sleep 0.1; exit 0"));
        first.name = Some("first".to_string());
        first.chdir = Some(dir.path().to_path_buf());
        let first_id = runner.submit_job(first).await;

        let mut second = JobSpec::new(sh("exit 0"));
        second.name = Some("second".to_string());
        second.chdir = Some(dir.path().to_path_buf());
        second.waitforjobid = Some(first_id.clone());
        let second_id = runner.submit_job(second).await;

        let jobs = runner.wait_all(&[first_id, second_id]).await;
        assert!(jobs.iter().all(|j| j.successful()));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_date_stamps_give_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut spec = JobSpec::new(sh("true"));
            spec.name = Some("same-name".to_string());
            spec.chdir = Some(dir.path().to_path_buf());
            ids.push(runner.submit_job(spec).await);
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_wait_returns_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = JobRunner::with_defaults(quick_defaults());

        let mut spec = JobSpec::new(sh("exit 64"));
        spec.name = Some("differ".to_string());
        spec.chdir = Some(dir.path().to_path_buf());

        let exit = runner.run_wait(spec).await;
        assert_eq!(exit, Some(ExitStatus::Code(64)));
    }
}

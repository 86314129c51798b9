//! The in-process pool scheduling loop.
//!
//! One control loop owns all scheduling decisions and status updates:
//! it pops the longest ready test that fits the free processors and
//! devices, allocates from the platform pools, and hands the launch to a
//! worker task. Workers only run the child and report back; every map
//! mutation happens on the loop. A soft cancel stops new launches and
//! waits for the running tests to drain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::list::TestList;
use crate::platform::{JobInfo, Platform};
use crate::runner::local::{run_tracked, ProcessGroups};
use crate::runner::{date_stamp, log_file_name, RunOutcome, RunnerError, TestCommand};
use crate::status::ResultKind;

use super::TestExecList;

/// Pool-loop knobs.
#[derive(Debug, Clone)]
pub struct PoolParams {
    /// Directory tests execute under; each test runs in
    /// `<test_dir>/<exec-dir>`.
    pub test_dir: PathBuf,
    /// Sleep between scheduling passes when nothing can launch.
    pub poll_interval: Duration,
    /// Timeout for tests that declare none; zero disables.
    pub default_timeout_secs: u64,
    /// Run only the analyze portion of each test.
    pub analyze_only: bool,
    /// Run baseline handling instead of execution.
    pub baseline: bool,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("."),
            poll_interval: Duration::from_secs(15),
            default_timeout_secs: super::DEFAULT_TIMEOUT_SECS,
            analyze_only: false,
            baseline: false,
        }
    }
}

/// Tallies for a completed pool run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub num_pass: usize,
    pub num_diff: usize,
    pub num_fail: usize,
    pub num_timeout: usize,
    pub num_notrun: usize,
    pub finished: usize,
}

impl RunSummary {
    fn count(&mut self, result: ResultKind) {
        match result {
            ResultKind::Pass => self.num_pass += 1,
            ResultKind::Diff => self.num_diff += 1,
            ResultKind::Fail => self.num_fail += 1,
            ResultKind::Timeout => self.num_timeout += 1,
            _ => self.num_notrun += 1,
        }
        self.finished += 1;
    }

    pub fn all_passed(&self) -> bool {
        self.num_diff == 0 && self.num_fail == 0 && self.num_timeout == 0 && self.num_notrun == 0
    }
}

/// Builds the launch command for one test.
///
/// The test's source file is the executable; the binding it needs comes
/// through the environment: its execute directory, granted resources,
/// mpi options, and the locations of completed dependencies.
fn build_command(tlist: &TestList, exec_dir: &str, job: &JobInfo, params: &PoolParams) -> Option<TestCommand> {
    let case = tlist.case(exec_dir)?;
    let spec = case.spec();

    let program = spec.root().join(spec.filepath());
    let rundir = params.test_dir.join(exec_dir);

    let mut cmd = TestCommand::new(program.display().to_string()).chdir(rundir);

    if params.analyze_only || spec.is_analyze() {
        cmd = cmd.arg("--execute-analysis-sections");
    }
    if params.baseline {
        cmd = cmd.arg("--baseline");
    }

    cmd = cmd
        .env("VVT_TEST_NAME", spec.name())
        .env("VVT_EXEC_DIR", exec_dir)
        .env("VVT_NUM_PROCS", job.procs.len().to_string())
        .env(
            "VVT_PROC_IDS",
            job.procs
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    if let Some(devices) = &job.devices {
        cmd = cmd.env(
            "VVT_DEVICE_IDS",
            devices
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if !job.mpi_opts.is_empty() {
        cmd = cmd.env("VVT_MPI_OPTS", job.mpi_opts.clone());
    }

    let depdirs = case.dep_directories();
    if !depdirs.is_empty() {
        let joined: Vec<String> = depdirs
            .iter()
            .map(|(pat, xdir)| format!("{}={}", pat, params.test_dir.join(xdir).display()))
            .collect();
        cmd = cmd.env("VVT_DEPDIRS", joined.join(":"));
    }

    Some(cmd)
}

/// Prepares the run directory for a launch: creates it and writes the
/// machine file when the platform asked for one.
fn prepare_rundir(rundir: &PathBuf, job: &JobInfo) -> std::io::Result<()> {
    std::fs::create_dir_all(rundir)?;
    if let Some(content) = &job.machinefile {
        std::fs::write(rundir.join("machinefile"), content)?;
    }
    Ok(())
}

/// Runs the active tests to completion under the platform's resource
/// limits. Returns the tally; individual outcomes land on each test's
/// status and in the results file.
pub async fn run_pool(
    tlist: &mut TestList,
    xlist: &mut TestExecList,
    platform: &mut Platform,
    params: &PoolParams,
    cancel: CancellationToken,
    pgroups: ProcessGroups,
) -> Result<RunSummary, RunnerError> {
    let mut summary = RunSummary::default();
    let mut workers: JoinSet<(String, Result<RunOutcome, RunnerError>)> = JoinSet::new();
    let mut held: HashMap<String, JobInfo> = HashMap::new();

    loop {
        // launch everything that fits right now
        while !cancel.is_cancelled() {
            let free = platform.size_available();
            let Some(entry) = xlist.pop_next(tlist, free) else {
                break;
            };
            let xdir = entry.exec_dir.clone();

            // a popped test may still be doomed by its dependencies
            let never = tlist
                .case(&xdir)
                .map(|c| tlist.will_never_run(c))
                .unwrap_or(true);
            if never {
                let reason = tlist
                    .case(&xdir)
                    .and_then(|c| tlist.blocked_reason(c))
                    .unwrap_or_else(|| "unbuildable test".to_string());
                warn!("{} will never run: {}", xdir, reason);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_not_run();
                }
                let _ = tlist.append_test_result(&xdir);
                xlist.mark_stopped(&xdir);
                summary.count(ResultKind::NotRun);
                continue;
            }

            let (np, nd) = tlist.case(&xdir).map(|c| c.size()).unwrap_or((1, 0));
            let job = platform.get_resources(np, if nd > 0 { Some(nd) } else { None });

            let Some(cmd) = build_command(tlist, &xdir, &job, params) else {
                platform.return_resources(job);
                xlist.mark_stopped(&xdir);
                continue;
            };

            let rundir = params.test_dir.join(&xdir);
            if let Err(e) = prepare_rundir(&rundir, &job) {
                warn!("cannot prepare {}: {}", rundir.display(), e);
                platform.return_resources(job);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_not_run();
                }
                let _ = tlist.append_test_result(&xdir);
                xlist.mark_stopped(&xdir);
                summary.count(ResultKind::NotRun);
                continue;
            }

            let timeout = tlist
                .case(&xdir)
                .and_then(|c| c.spec().timeout())
                .unwrap_or(params.default_timeout_secs);
            let timeout = (timeout > 0).then(|| Duration::from_secs(timeout));

            let name = tlist
                .case(&xdir)
                .map(|c| c.spec().name().to_string())
                .unwrap_or_else(|| xdir.clone());
            let log_path = rundir.join(log_file_name(&name, None, &date_stamp()));

            info!("starting {} (np={} nd={})", xdir, np, nd);
            if let Some(case) = tlist.case_mut(&xdir) {
                case.status_mut().mark_started(chrono::Utc::now().timestamp());
            }
            xlist.mark_started(&xdir);
            held.insert(xdir.clone(), job);

            let poll = params.poll_interval.min(Duration::from_secs(1));
            let groups = pgroups.clone();
            workers.spawn(async move {
                let outcome = run_tracked(&cmd, &log_path, timeout, poll, Some(&groups)).await;
                (xdir, outcome)
            });
        }

        if workers.is_empty() {
            if cancel.is_cancelled() || xlist.backlog_len() == 0 {
                break;
            }
            // remaining tests are permanently blocked; drain them
            for entry in xlist.pop_remaining() {
                let xdir = entry.exec_dir;
                let reason = tlist
                    .case(&xdir)
                    .and_then(|c| tlist.blocked_reason(c))
                    .unwrap_or_else(|| "blocked dependency".to_string());
                warn!("{} not run: {}", xdir, reason);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_not_run();
                }
                let _ = tlist.append_test_result(&xdir);
                xlist.mark_stopped(&xdir);
                summary.count(ResultKind::NotRun);
            }
            break;
        }

        // wait for one completion, then loop back to launch more
        let Some(joined) = workers.join_next().await else {
            continue;
        };

        match joined {
            Ok((xdir, outcome)) => {
                if let Some(job) = held.remove(&xdir) {
                    platform.return_resources(job);
                }
                let outcome = match outcome {
                    Ok(o) => o,
                    Err(e) => {
                        warn!("{} runner fault: {}", xdir, e);
                        RunOutcome {
                            result: ResultKind::Fail,
                            exit: None,
                            runtime_secs: 0,
                        }
                    }
                };
                info!("finished {}: {}", xdir, outcome.result);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_done(
                        outcome.result,
                        outcome.exit.clone(),
                        outcome.runtime_secs,
                    );
                }
                let _ = tlist.append_test_result(&xdir);
                xlist.mark_stopped(&xdir);
                summary.count(outcome.result);
            }
            Err(join_err) => {
                // a worker panic poisons only that test, never the loop
                warn!("worker task fault: {}", join_err);
            }
        }
    }

    if cancel.is_cancelled() {
        info!(
            "cancelled with {} tests left in the backlog",
            xlist.backlog_len()
        );
    }

    Ok(summary)
}

//! Batch submission of test groups to an external resource manager.
//!
//! Ready tests are packed into jobs sized to fit a node allocation, each
//! job gets a generated submit script that re-invokes the harness
//! against a sub-test-list, and the layer polls queue state until every
//! job drains, folding each job's appended result log back into the
//! master list. The resource manager itself is behind the
//! [`BatchInterface`] contract; [`slurm`] is the bundled implementation.

pub mod slurm;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::exec::backlog::{SortMode, TestBacklog};
use crate::list::TestList;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("cannot write batch file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("batch submission failed for job {jobname}: {detail}")]
    Submit { jobname: String, detail: String },

    #[error("list IO during reconciliation: {0}")]
    ListIo(#[from] crate::list::io::ListIoError),
}

/// Queue state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Running,
    /// Not listed, or listed in a state we do not track: done or
    /// unknown.
    DoneOrUnknown,
}

/// Result of a submission attempt: the command run, its output, and the
/// job id when one could be parsed.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub cmd: String,
    pub stdout: String,
    pub jobid: Option<String>,
    pub error: String,
}

/// Result of a queue query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub cmd: String,
    pub stdout: String,
    pub error: String,
    pub states: HashMap<String, QueueState>,
}

/// The pluggable resource-manager contract.
#[async_trait]
pub trait BatchInterface: Send + Sync {
    /// Directive lines for the top of a submit script.
    fn header(&self, size: (u32, u32), qtime_secs: i64, outfile: &Path) -> String;

    /// Submits a script; never errors at the transport level - failures
    /// are reported in the outcome.
    async fn submit(
        &self,
        script: &Path,
        workdir: &Path,
        outfile: &Path,
        queue: Option<&str>,
        account: Option<&str>,
    ) -> SubmitOutcome;

    /// Queries the state of the given job ids.
    async fn query(&self, jobids: &[String]) -> QueryOutcome;

    /// Best-effort cancel.
    async fn cancel(&self, jobid: &str);
}

/// Nodes needed for `(np, nd)` given the node shape; always at least
/// one.
pub fn compute_num_nodes(size: (u32, u32), ppn: u32, dpn: u32) -> u32 {
    let (np, nd) = size;
    let ppn = ppn.max(1);
    let proc_nodes = np.div_ceil(ppn);
    let dev_nodes = if dpn > 0 { nd.div_ceil(dpn) } else { 0 };
    proc_nodes.max(dev_nodes).max(1)
}

/// One packed batch job.
#[derive(Debug)]
pub struct BatchJob {
    /// Small sequential number used in file names.
    pub batch_num: usize,
    /// Execute directories of the tests in this job.
    pub tests: Vec<String>,
    /// Widest test in the job.
    pub size: (u32, u32),
    /// Sum of the member timeouts plus margin, in seconds.
    pub qtime_secs: i64,
    /// Queue job id once submitted.
    pub jobid: Option<String>,
    /// Files under the batch area.
    pub sub_list: PathBuf,
    pub script: PathBuf,
    pub outfile: PathBuf,
    /// The results suffix the job's harness run was told to use.
    pub results_suffix: String,
}

/// Packing and pacing knobs.
#[derive(Debug, Clone)]
pub struct BatchParams {
    /// Processors per node.
    pub ppn: u32,
    /// Devices per node.
    pub dpn: u32,
    /// Upper bound on nodes per job, when the queue's quality of
    /// service imposes one.
    pub max_nodes: Option<u32>,
    /// Target wallclock budget per job, seconds.
    pub max_job_seconds: i64,
    /// Margin added to each job's wallclock.
    pub qtime_margin_secs: i64,
    /// Concurrent submission cap (the `maxsubs` attribute).
    pub max_concurrent: u32,
    /// Queue poll interval.
    pub poll_interval: Duration,
    /// Queue and account to submit under.
    pub queue: Option<String>,
    pub account: Option<String>,
    /// Command line that re-enters the harness; the sub-test-list path
    /// is appended.
    pub harness_argv: Vec<String>,
    /// Directory for batch scripts, sub lists, and job output.
    pub batch_dir: PathBuf,
}

impl BatchParams {
    pub fn new(ppn: u32, batch_dir: PathBuf) -> Self {
        Self {
            ppn,
            dpn: 0,
            max_nodes: None,
            max_job_seconds: 3600,
            qtime_margin_secs: 15 * 60,
            max_concurrent: 5,
            poll_interval: Duration::from_secs(30),
            queue: None,
            account: None,
            harness_argv: vec!["gantry".to_string(), "run".to_string()],
            batch_dir,
        }
    }
}

/// Packs the backlog into batch jobs.
///
/// Tests come off the backlog widest-and-longest first. A job is grown
/// while the next test fits the job's node footprint and the summed
/// timeout stays inside the wallclock budget; a test wider than
/// anything packed so far starts a new job.
pub fn pack_jobs(
    backlog: &mut TestBacklog,
    params: &BatchParams,
    results_suffix: &str,
) -> Vec<BatchJob> {
    backlog.sort(SortMode::Timeout);

    let mut jobs: Vec<BatchJob> = Vec::new();
    let mut current: Option<(Vec<String>, (u32, u32), i64)> = None;

    let flush = |jobs: &mut Vec<BatchJob>, packed: (Vec<String>, (u32, u32), i64)| {
        let (tests, size, tsum) = packed;
        let batch_num = jobs.len();
        let base = params.batch_dir.join(format!("batch{:03}", batch_num));
        jobs.push(BatchJob {
            batch_num,
            tests,
            size,
            qtime_secs: tsum + params.qtime_margin_secs,
            jobid: None,
            sub_list: base.join("testlist"),
            script: base.join("submit.sh"),
            outfile: base.join("qsub.out"),
            results_suffix: results_suffix.to_string(),
        });
    };

    for entry in backlog.consume() {
        let np = entry.np.max(1);
        let nd = entry.nd;
        let timeout = entry.timeout.max(0);

        match current.as_mut() {
            Some((tests, size, tsum))
                if np <= size.0 && *tsum + timeout <= params.max_job_seconds =>
            {
                tests.push(entry.exec_dir);
                *tsum += timeout;
                size.1 = size.1.max(nd);
            }
            _ => {
                if let Some(packed) = current.take() {
                    flush(&mut jobs, packed);
                }
                current = Some((vec![entry.exec_dir], (np, nd), timeout));
            }
        }
    }
    if let Some(packed) = current.take() {
        flush(&mut jobs, packed);
    }

    // a single test can demand more nodes than the queue allows; it
    // still gets its own job, but the operator should hear about it
    if let Some(cap) = params.max_nodes {
        for job in &jobs {
            let nodes = compute_num_nodes(job.size, params.ppn, params.dpn);
            if nodes > cap {
                warn!(
                    "batch job {} needs {} nodes, over the queue cap of {}",
                    job.batch_num, nodes, cap
                );
            }
        }
    }

    info!("packed {} batch jobs", jobs.len());
    jobs
}

/// Writes a job's sub-test-list and submit script.
pub fn write_job_files(
    job: &BatchJob,
    tlist: &TestList,
    batch: &dyn BatchInterface,
    params: &BatchParams,
) -> Result<(), BatchError> {
    let write_err = |path: &Path, source: std::io::Error| BatchError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = job.script.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;

    crate::list::io::write_test_list(
        &job.sub_list,
        Some(&job.results_suffix),
        job.tests.iter().filter_map(|x| tlist.case(x)),
    )?;

    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&batch.header(job.size, job.qtime_secs, &job.outfile));
    script.push('\n');
    script.push_str(&format!("cd {} || exit 1\n", shell_words::quote(&dir.display().to_string())));
    script.push_str("echo \"job start: $(date)\"\n");

    let mut argv = params.harness_argv.clone();
    argv.push("--test-list".to_string());
    argv.push(job.sub_list.display().to_string());
    argv.push("--results-suffix".to_string());
    argv.push(job.results_suffix.clone());
    script.push_str(&shell_words::join(argv.iter().map(String::as_str)));
    script.push('\n');
    script.push_str("echo \"job finish: $(date)\"\n");

    let mut fp = std::fs::File::create(&job.script).map_err(|e| write_err(&job.script, e))?;
    fp.write_all(script.as_bytes())
        .map_err(|e| write_err(&job.script, e))?;

    Ok(())
}

/// Summary of a batch run.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub num_jobs: usize,
    pub num_submit_failures: usize,
    pub num_tests_notrun: usize,
}

/// Submits packed jobs under the concurrency cap, polls queue state,
/// and reconciles each finished job's results into the master list.
pub async fn run_batch(
    jobs: &mut [BatchJob],
    tlist: &mut TestList,
    batch: &dyn BatchInterface,
    params: &BatchParams,
) -> Result<BatchSummary, BatchError> {
    let mut summary = BatchSummary {
        num_jobs: jobs.len(),
        ..BatchSummary::default()
    };

    let mut next_to_submit = 0;
    let mut inflight: Vec<usize> = Vec::new();
    let mut finished: Vec<usize> = Vec::new();
    let mut failed: Vec<usize> = Vec::new();

    while finished.len() + failed.len() < jobs.len() {
        // top up submissions
        while next_to_submit < jobs.len() && inflight.len() < params.max_concurrent as usize {
            let idx = next_to_submit;
            next_to_submit += 1;

            write_job_files(&jobs[idx], tlist, batch, params)?;
            let dir = jobs[idx]
                .script
                .parent()
                .unwrap_or(Path::new("."))
                .to_path_buf();
            let outcome = batch
                .submit(
                    &jobs[idx].script,
                    &dir,
                    &jobs[idx].outfile,
                    params.queue.as_deref(),
                    params.account.as_deref(),
                )
                .await;

            match outcome.jobid {
                Some(id) => {
                    info!("batch job {} submitted as {}", jobs[idx].batch_num, id);
                    jobs[idx].jobid = Some(id);
                    inflight.push(idx);
                }
                None => {
                    warn!(
                        "batch job {} submission failed: {}",
                        jobs[idx].batch_num, outcome.error
                    );
                    summary.num_submit_failures += 1;
                    mark_tests_not_run(tlist, &jobs[idx], &mut summary);
                    failed.push(idx);
                }
            }

            // pace successive submissions
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if inflight.is_empty() {
            continue;
        }

        tokio::time::sleep(params.poll_interval).await;

        let ids: Vec<String> = inflight
            .iter()
            .filter_map(|&i| jobs[i].jobid.clone())
            .collect();
        let query = batch.query(&ids).await;
        if !query.error.is_empty() {
            warn!("queue query problem: {}", query.error);
        }

        let mut still_inflight = Vec::new();
        for idx in inflight {
            let id = jobs[idx].jobid.clone().unwrap_or_default();
            match query.states.get(&id).copied() {
                Some(QueueState::Pending) | Some(QueueState::Running) => {
                    still_inflight.push(idx)
                }
                _ => {
                    reconcile_job(tlist, &jobs[idx], &mut summary);
                    finished.push(idx);
                }
            }
        }
        inflight = still_inflight;
    }

    Ok(summary)
}

/// Reads a finished job's appended result file and copies per-test
/// results into the master list; members still not done afterwards are
/// marked not run.
fn reconcile_job(tlist: &mut TestList, job: &BatchJob, summary: &mut BatchSummary) {
    let result_file = PathBuf::from(format!(
        "{}.{}",
        job.sub_list.display(),
        job.results_suffix
    ));
    if result_file.exists() {
        if let Err(e) = tlist.read_results_file(&result_file) {
            warn!(
                "batch job {}: unreadable result file {}: {}",
                job.batch_num,
                result_file.display(),
                e
            );
        }
    } else {
        warn!(
            "batch job {}: no result file at {}",
            job.batch_num,
            result_file.display()
        );
    }

    mark_tests_not_run(tlist, job, summary);
}

fn mark_tests_not_run(tlist: &mut TestList, job: &BatchJob, summary: &mut BatchSummary) {
    for xdir in &job.tests {
        if let Some(case) = tlist.case_mut(xdir) {
            if !case.status().is_done() && !case.status().skip_test() {
                case.status_mut().mark_not_run();
                summary.num_tests_notrun += 1;
            }
        }
    }
}

//! Slurm batch interface.
//!
//! Drives `sbatch`, `squeue`, and `scancel`. Submission output is parsed
//! for the `Submitted batch job <id>` line; queue state comes from
//! `squeue --noheader -o '%i %t'` with `R` mapping to running, `PD` to
//! pending, and anything else (including absence) to done-or-unknown.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{compute_num_nodes, BatchInterface, QueryOutcome, QueueState, SubmitOutcome};

/// Slurm bindings plus the node shape used for `--nodes` computation.
#[derive(Debug, Clone)]
pub struct SlurmBatch {
    ppn: u32,
    dpn: u32,
    qos: Option<String>,
    extra_flags: Vec<String>,
}

impl SlurmBatch {
    pub fn new(ppn: u32) -> Self {
        Self {
            ppn: ppn.max(1),
            dpn: 0,
            qos: None,
            extra_flags: Vec::new(),
        }
    }

    pub fn with_dpn(mut self, dpn: u32) -> Self {
        self.dpn = dpn;
        self
    }

    pub fn with_qos(mut self, qos: Option<String>) -> Self {
        self.qos = qos;
        self
    }

    /// Extra flags appended to every `sbatch` invocation, parsed
    /// shell-style.
    pub fn with_extra_flags(mut self, flags: Option<&str>) -> Self {
        self.extra_flags = flags
            .and_then(|f| shell_words::split(f).ok())
            .unwrap_or_default();
        self
    }
}

/// `H:MM:SS` formatting (or `M:SS` under an hour). Strings already
/// containing a colon pass through untouched.
pub fn hms_format(qtime: i64) -> String {
    let secs = qtime.max(0);
    let hours = secs / 3600;
    let rem = secs - hours * 3600;
    let mins = rem / 60;
    let s = rem - mins * 60;
    if hours == 0 {
        format!("{}:{:02}", mins, s)
    } else {
        format!("{}:{:02}:{:02}", hours, mins, s)
    }
}

/// Extracts the job id from `sbatch` stdout.
pub fn parse_submit_output(stdout: &str) -> Option<String> {
    let idx = stdout.find("Submitted batch job")?;
    let rest = &stdout[idx..];
    let word = rest.split_whitespace().nth(3)?;
    let word = word.trim();
    if word.is_empty() {
        None
    } else {
        Some(word.to_string())
    }
}

/// Parses `squeue --noheader -o '%i %t'` output into per-id states.
/// Ids not mentioned stay done-or-unknown. Returns an error string for
/// unparsable lines.
pub fn parse_squeue_output(stdout: &str, jobids: &[String]) -> (HashMap<String, QueueState>, String) {
    let mut states: HashMap<String, QueueState> = jobids
        .iter()
        .map(|id| (id.clone(), QueueState::DoneOrUnknown))
        .collect();

    let mut error = String::new();
    for line in stdout.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        if words.len() < 2 {
            error = format!("failed to parse squeue output line: {:?}", line);
            continue;
        }
        let (id, st) = (words[0], words[1]);
        if let Some(slot) = states.get_mut(id) {
            *slot = match st {
                "R" => QueueState::Running,
                "PD" => QueueState::Pending,
                _ => QueueState::DoneOrUnknown,
            };
        }
    }
    (states, error)
}

async fn run_command(argv: &[String], workdir: Option<&Path>) -> (String, String, Option<i32>) {
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(std::process::Stdio::null());

    match cmd.output().await {
        Ok(out) => (
            String::from_utf8_lossy(&out.stdout).to_string(),
            String::from_utf8_lossy(&out.stderr).to_string(),
            out.status.code(),
        ),
        Err(e) => (String::new(), e.to_string(), None),
    }
}

#[async_trait]
impl BatchInterface for SlurmBatch {
    fn header(&self, size: (u32, u32), qtime_secs: i64, outfile: &Path) -> String {
        let nnodes = compute_num_nodes(size, self.ppn, self.dpn);

        let mut hdr = format!(
            "#SBATCH --time={}\n#SBATCH --nodes={}\n#SBATCH --output={}\n#SBATCH --error={}\n",
            hms_format(qtime_secs),
            nnodes,
            outfile.display(),
            outfile.display(),
        );
        if let Some(qos) = &self.qos {
            hdr.push_str(&format!("#SBATCH --qos={}\n", qos));
        }
        hdr
    }

    async fn submit(
        &self,
        script: &Path,
        workdir: &Path,
        outfile: &Path,
        queue: Option<&str>,
        account: Option<&str>,
    ) -> SubmitOutcome {
        let mut argv = vec!["sbatch".to_string()];
        argv.extend(self.extra_flags.iter().cloned());
        if let Some(q) = queue {
            argv.push(format!("--partition={}", q));
        }
        if let Some(a) = account {
            argv.push(format!("--account={}", a));
        }
        if let Some(qos) = &self.qos {
            argv.push(format!("--qos={}", qos));
        }
        argv.push(format!("--output={}", outfile.display()));
        argv.push(format!("--error={}", outfile.display()));
        argv.push(format!("--chdir={}", workdir.display()));
        argv.push(script.display().to_string());

        let cmd = shell_words::join(argv.iter().map(String::as_str));
        let (stdout, stderr, _code) = run_command(&argv, Some(workdir)).await;

        match parse_submit_output(&stdout) {
            Some(jobid) => {
                info!("sbatch accepted job {}", jobid);
                SubmitOutcome {
                    cmd,
                    stdout,
                    jobid: Some(jobid),
                    error: String::new(),
                }
            }
            None => SubmitOutcome {
                cmd,
                stdout: format!("{}{}", stdout, stderr),
                jobid: None,
                error: "batch submission failed or could not parse output to obtain the job id"
                    .to_string(),
            },
        }
    }

    async fn query(&self, jobids: &[String]) -> QueryOutcome {
        let mut argv = vec![
            "squeue".to_string(),
            "--noheader".to_string(),
            "-o".to_string(),
            "%i %t".to_string(),
        ];
        if !jobids.is_empty() {
            argv.push(format!("--jobs={}", jobids.join(",")));
        }

        let cmd = shell_words::join(argv.iter().map(String::as_str));
        let (stdout, stderr, code) = run_command(&argv, None).await;

        let (states, mut error) = parse_squeue_output(&stdout, jobids);
        if error.is_empty() && code != Some(0) && !stderr.is_empty() {
            error = stderr.trim().to_string();
        }

        QueryOutcome {
            cmd,
            stdout,
            error,
            states,
        }
    }

    async fn cancel(&self, jobid: &str) {
        info!("scancel {}", jobid);
        let argv = vec!["scancel".to_string(), jobid.to_string()];
        let (_out, stderr, code) = run_command(&argv, None).await;
        if code != Some(0) {
            warn!("scancel {} problem: {}", jobid, stderr.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_output_parsing() {
        assert_eq!(
            parse_submit_output("sbatch: Submitted batch job 291041\n"),
            Some("291041".to_string())
        );
        assert_eq!(
            parse_submit_output("Submitted batch job 17\n"),
            Some("17".to_string())
        );
        assert_eq!(parse_submit_output("sbatch: error: bad\n"), None);
        assert_eq!(parse_submit_output(""), None);
        assert_eq!(parse_submit_output("Submitted batch job"), None);
    }

    #[test]
    fn squeue_parsing_maps_states() {
        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let out = "1 R\n2 PD\n9 R\n";
        let (states, err) = parse_squeue_output(out, &ids);

        assert!(err.is_empty());
        assert_eq!(states["1"], QueueState::Running);
        assert_eq!(states["2"], QueueState::Pending);
        // not listed means done-or-unknown
        assert_eq!(states["3"], QueueState::DoneOrUnknown);
    }

    #[test]
    fn squeue_parsing_tolerates_other_states() {
        let ids = vec!["5".to_string()];
        let (states, _err) = parse_squeue_output("5 CG\n", &ids);
        assert_eq!(states["5"], QueueState::DoneOrUnknown);
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(hms_format(0), "0:00");
        assert_eq!(hms_format(59), "0:59");
        assert_eq!(hms_format(60), "1:00");
        assert_eq!(hms_format(3599), "59:59");
        assert_eq!(hms_format(3600), "1:00:00");
        assert_eq!(hms_format(7325), "2:02:05");
    }

    #[test]
    fn header_contains_directives() {
        let slurm = SlurmBatch::new(16).with_qos(Some("long".to_string()));
        let hdr = slurm.header((20, 0), 3600, Path::new("/tmp/out.txt"));

        assert!(hdr.contains("#SBATCH --time=1:00:00"));
        assert!(hdr.contains("#SBATCH --nodes=2"));
        assert!(hdr.contains("#SBATCH --output=/tmp/out.txt"));
        assert!(hdr.contains("#SBATCH --error=/tmp/out.txt"));
        assert!(hdr.contains("#SBATCH --qos=long"));
    }

    #[test]
    fn extra_flags_are_split_shell_style() {
        let slurm = SlurmBatch::new(8).with_extra_flags(Some("--exclusive -C 'haswell'"));
        assert_eq!(slurm.extra_flags, vec!["--exclusive", "-C", "haswell"]);
    }
}

//! Runtime configuration.
//!
//! Two records feed the engine: [`RuntimeConfig`] carries the filter
//! criteria assembled from the command line (keyword/parameter
//! expressions, runtime bounds, scope), and [`PlatformAttrs`] carries the
//! platform-level knobs (queue, account, node shape) set by `--platopt`
//! pairs, the platform plugin, or the optional `gantry.toml` defaults
//! file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exprs::WordExpression;
use crate::params::ParamMap;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid --platopt value {0:?} (expected key=value)")]
    BadPlatOpt(String),
}

/// Filter criteria for a run.
#[derive(Debug, Default, Clone)]
pub struct RuntimeConfig {
    /// Platform name tests are filtered against.
    pub platform_name: String,

    /// On options (`-o`), tokens for option enable expressions.
    pub on_options: Vec<String>,

    /// Off options (`-O`); an option expression mentioning one fails.
    pub off_options: Vec<String>,

    /// Keyword expression over test keywords (plus results keywords on
    /// restarts).
    pub keyword_expr: Option<WordExpression>,

    /// Parameter expression over `name=value` tokens.
    pub param_expr: Option<WordExpression>,

    /// Runtime bounds in seconds (min, max).
    pub runtime_min: Option<i64>,
    pub runtime_max: Option<i64>,

    /// Cumulative-runtime cutoff in seconds.
    pub runtime_sum: Option<i64>,

    /// Upper bound on a test's processor request.
    pub maxprocs: Option<u32>,

    /// Whether TDD-keyword tests are included.
    pub include_tdd: bool,

    /// Content regexes for file-search filtering; empty means no search
    /// filtering.
    pub search_regexes: Vec<regex::Regex>,

    /// Accept everything (batch jobs re-run an already-filtered list).
    pub include_all: bool,

    /// Restart scope: only tests under this subdirectory stay active.
    pub subdir: Option<String>,

    /// Only run analyze aggregators (their siblings already ran).
    pub analyze_only: bool,

    /// Baseline mode: only tests with baseline handling stay active.
    pub baseline: bool,
}

impl RuntimeConfig {
    pub fn new(platform_name: impl Into<String>) -> Self {
        Self {
            platform_name: platform_name.into(),
            ..Self::default()
        }
    }

    /// Evaluates an option enable expression from a test: on options are
    /// true words, off options are false even when also listed on.
    pub fn evaluate_option_expr(&self, expr: &WordExpression) -> bool {
        expr.evaluate(|word| {
            !self.off_options.iter().any(|o| o == word)
                && self.on_options.iter().any(|o| o == word)
        })
    }

    /// Evaluates the CLI keyword expression against a token list.
    pub fn satisfies_keywords(&self, tokens: &[&str]) -> bool {
        match &self.keyword_expr {
            Some(expr) => expr.evaluate_tokens(tokens),
            None => true,
        }
    }

    /// Evaluates the CLI parameter expression against a binding.
    pub fn evaluate_parameters(&self, params: &ParamMap) -> bool {
        match &self.param_expr {
            Some(expr) => {
                let tokens: Vec<String> =
                    params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
                expr.evaluate_tokens(&refs)
            }
            None => true,
        }
    }

    pub fn evaluate_runtime(&self, secs: i64) -> bool {
        if let Some(min) = self.runtime_min {
            if secs < min {
                return false;
            }
        }
        if let Some(max) = self.runtime_max {
            if secs > max {
                return false;
            }
        }
        true
    }

    pub fn evaluate_maxprocs(&self, np: u32) -> bool {
        match self.maxprocs {
            Some(mx) => np <= mx,
            None => true,
        }
    }
}

/// Platform attributes: the enumerated keys plus a catch-all map for
/// anything a plugin sets beyond them.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformAttrs {
    pub queue: Option<String>,
    pub account: Option<String>,
    pub walltime: Option<String>,
    #[serde(rename = "QoS")]
    pub qos: Option<String>,
    pub ppn: Option<u32>,
    pub dpn: Option<u32>,
    pub mpifile: Option<String>,
    pub mpiopts: Option<String>,
    pub maxprocs: Option<u32>,
    pub maxdevices: Option<u32>,
    pub testingdir: Option<PathBuf>,
    pub maxsubs: Option<u32>,
    pub extra_flags: Option<String>,
    pub misc: BTreeMap<String, String>,
}

impl PlatformAttrs {
    /// Applies one `--platopt key=value` pair, honoring the documented
    /// aliases (`q`, `PT`, `processors_per_node`, `devices_per_node`).
    pub fn apply_platopt(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad = |k: &str| ConfigError::BadPlatOpt(format!("{}={}", k, value));
        match key {
            "queue" | "q" => self.queue = Some(value.to_string()),
            "account" | "PT" => self.account = Some(value.to_string()),
            "walltime" => self.walltime = Some(value.to_string()),
            "QoS" => self.qos = Some(value.to_string()),
            "ppn" | "processors_per_node" => {
                let n: u32 = value.parse().map_err(|_| bad(key))?;
                if n == 0 {
                    return Err(bad(key));
                }
                self.ppn = Some(n);
            }
            "dpn" | "devices_per_node" => {
                let n: u32 = value.parse().map_err(|_| bad(key))?;
                if n == 0 {
                    return Err(bad(key));
                }
                self.dpn = Some(n);
            }
            "extra_flags" => self.extra_flags = Some(value.to_string()),
            other => {
                self.misc.insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Parses a comma-separated `--platopt` argument
    /// (`queue=batch,PT=acct123`).
    pub fn apply_platopt_arg(&mut self, arg: &str) -> Result<(), ConfigError> {
        for piece in arg.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            match piece.split_once('=') {
                Some((k, v)) => self.apply_platopt(k.trim(), v.trim())?,
                None => return Err(ConfigError::BadPlatOpt(piece.to_string())),
            }
        }
        Ok(())
    }

    /// The testing directory, with the `TESTING_DIRECTORY` environment
    /// variable taking precedence over the attribute.
    pub fn testing_directory(&self) -> Option<PathBuf> {
        std::env::var_os("TESTING_DIRECTORY")
            .map(PathBuf::from)
            .or_else(|| self.testingdir.clone())
    }

    /// Batch submission concurrency cap; five unless configured.
    pub fn default_submit_limit(&self) -> u32 {
        self.maxsubs.unwrap_or(5)
    }
}

/// Optional defaults read from a `gantry.toml` file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Default platform name when `--plat` is absent.
    pub platform: Option<String>,

    /// Default platform attributes, same keys as `--platopt`.
    pub platopts: BTreeMap<String, String>,

    /// Default per-test timeout in seconds when a test declares none.
    pub test_timeout_secs: Option<u64>,

    /// Scheduler poll interval in seconds.
    pub poll_interval_secs: Option<u64>,
}

/// Loads the defaults file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platopt_aliases() {
        let mut attrs = PlatformAttrs::default();
        attrs
            .apply_platopt_arg("q=short,PT=wg-123,walltime=2:00:00,QoS=long,ppn=16,dpn=4")
            .unwrap();
        assert_eq!(attrs.queue.as_deref(), Some("short"));
        assert_eq!(attrs.account.as_deref(), Some("wg-123"));
        assert_eq!(attrs.walltime.as_deref(), Some("2:00:00"));
        assert_eq!(attrs.qos.as_deref(), Some("long"));
        assert_eq!(attrs.ppn, Some(16));
        assert_eq!(attrs.dpn, Some(4));
    }

    #[test]
    fn unknown_platopts_land_in_misc() {
        let mut attrs = PlatformAttrs::default();
        attrs.apply_platopt_arg("nodetype=knl").unwrap();
        assert_eq!(attrs.misc.get("nodetype").map(String::as_str), Some("knl"));
    }

    #[test]
    fn bad_platopts_are_rejected() {
        let mut attrs = PlatformAttrs::default();
        assert!(attrs.apply_platopt_arg("ppn=zero").is_err());
        assert!(attrs.apply_platopt_arg("ppn=0").is_err());
        assert!(attrs.apply_platopt_arg("justakey").is_err());
    }

    #[test]
    fn option_expressions_respect_off_options() {
        let mut rtc = RuntimeConfig::new("Linux");
        rtc.on_options = vec!["dbg".into(), "mpi".into()];
        rtc.off_options = vec!["mpi".into()];

        let dbg = WordExpression::parse("dbg").unwrap();
        let mpi = WordExpression::parse("mpi").unwrap();
        assert!(rtc.evaluate_option_expr(&dbg));
        assert!(!rtc.evaluate_option_expr(&mpi));
    }

    #[test]
    fn parameter_expression_over_bindings() {
        let mut rtc = RuntimeConfig::new("Linux");
        rtc.param_expr = Some(WordExpression::parse("np=4 or np=8").unwrap());

        let mut params = ParamMap::new();
        params.insert("np".into(), "4".into());
        assert!(rtc.evaluate_parameters(&params));

        params.insert("np".into(), "2".into());
        assert!(!rtc.evaluate_parameters(&params));
    }

    #[test]
    fn runtime_and_maxprocs_bounds() {
        let mut rtc = RuntimeConfig::new("Linux");
        rtc.runtime_min = Some(10);
        rtc.runtime_max = Some(100);
        rtc.maxprocs = Some(8);

        assert!(rtc.evaluate_runtime(50));
        assert!(!rtc.evaluate_runtime(5));
        assert!(!rtc.evaluate_runtime(500));
        assert!(rtc.evaluate_maxprocs(8));
        assert!(!rtc.evaluate_maxprocs(9));
    }

    #[test]
    fn file_config_round_trip() {
        let text = r#"
platform = "CrayXC"
test_timeout_secs = 3600

[platopts]
queue = "batch"
ppn = "32"
"#;
        let cfg: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.platform.as_deref(), Some("CrayXC"));
        assert_eq!(cfg.test_timeout_secs, Some(3600));

        let mut attrs = PlatformAttrs::default();
        for (k, v) in &cfg.platopts {
            attrs.apply_platopt(k, v).unwrap();
        }
        assert_eq!(attrs.ppn, Some(32));
    }
}

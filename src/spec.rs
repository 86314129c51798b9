//! Static test descriptions.
//!
//! A [`TestSpec`] is the frozen description of one test instance: where it
//! came from, its parameter binding, the enable expressions that gate it,
//! and its declared dependencies. Specs are produced by a source parser
//! behind the [`SpecSource`] trait and never mutated afterwards; all
//! execution state lives in [`crate::status::TestStatus`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::exprs::WordExpression;
use crate::params::{ParamMap, ParameterSet};

/// Errors raised while discovering test specs.
///
/// A malformed source file is reported and skipped; scanning continues.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid test source {path}: {reason}")]
    BadSource { path: PathBuf, reason: String },

    #[error("IO error while scanning: {0}")]
    Io(#[from] std::io::Error),
}

/// A dependency declared in a test source: a shell wildcard pattern over
/// execute directories, optionally gated on the dependee's result.
#[derive(Debug, Clone)]
pub struct DepSpec {
    /// Shell wildcard matched against known execute directories.
    pub pattern: String,
    /// Result expression the dependee must satisfy once done; `None`
    /// means the default "pass or diff".
    pub result_expr: Option<WordExpression>,
}

/// The immutable description of one test instance.
#[derive(Debug, Clone)]
pub struct TestSpec {
    root: PathBuf,
    filepath: PathBuf,
    name: String,
    exec_dir: String,
    parameters: ParamMap,
    keywords: BTreeSet<String>,
    dependencies: Vec<DepSpec>,
    platform_enable: Vec<WordExpression>,
    option_enable: Vec<WordExpression>,
    file_search: Vec<String>,
    timeout: Option<u64>,
    analyze: bool,
    baseline: bool,
    paramset: Option<ParameterSet>,
}

impl TestSpec {
    /// The scan root this spec was discovered under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source file path relative to the scan root.
    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The execute directory: the spec's identity key. Derived
    /// deterministically from the source location, test name, and
    /// parameter binding.
    pub fn exec_dir(&self) -> &str {
        &self.exec_dir
    }

    pub fn parameters(&self) -> &ParamMap {
        &self.parameters
    }

    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    pub fn has_keyword(&self, kw: &str) -> bool {
        self.keywords.contains(kw)
    }

    pub fn dependencies(&self) -> &[DepSpec] {
        &self.dependencies
    }

    pub fn platform_enable(&self) -> &[WordExpression] {
        &self.platform_enable
    }

    pub fn option_enable(&self) -> &[WordExpression] {
        &self.option_enable
    }

    /// Glob patterns that must match at least one file near the source for
    /// the test to be enabled.
    pub fn file_search(&self) -> &[String] {
        &self.file_search
    }

    /// Declared timeout in seconds. Zero means "no timeout"; `None` means
    /// the platform default applies.
    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    /// Whether this is the analyze (aggregator) member of its parameter
    /// group.
    pub fn is_analyze(&self) -> bool {
        self.analyze
    }

    /// Whether the test declares baseline handling.
    pub fn has_baseline(&self) -> bool {
        self.baseline
    }

    /// The parameter expansion this spec came from. Present on analyze
    /// tests, whose instances are narrowed to the surviving siblings.
    pub fn paramset(&self) -> Option<&ParameterSet> {
        self.paramset.as_ref()
    }

    pub fn paramset_mut(&mut self) -> Option<&mut ParameterSet> {
        self.paramset.as_mut()
    }

    /// Requested processor count, defaulting to 0 when unparameterized.
    pub fn np(&self) -> u32 {
        param_u32(&self.parameters, "np")
    }

    /// Requested device count, when parameterized.
    pub fn ndevice(&self) -> Option<u32> {
        self.parameters
            .get("ndevice")
            .map(|_| param_u32(&self.parameters, "ndevice"))
    }

    /// Requested node count, when parameterized.
    pub fn nnode(&self) -> Option<u32> {
        self.parameters
            .get("nnode")
            .map(|_| param_u32(&self.parameters, "nnode"))
    }
}

fn param_u32(params: &ParamMap, name: &str) -> u32 {
    params
        .get(name)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Derives the execute directory for a test.
///
/// The directory of the source file is joined with
/// `<name>.<p1=v1>.<p2=v2>...`, parameter components sorted by name; a
/// test with no parameters gets just `<name>`.
pub fn make_exec_dir(filepath: &Path, name: &str, params: &ParamMap) -> String {
    let mut leaf = name.to_string();
    for (k, v) in params {
        leaf.push('.');
        leaf.push_str(k);
        leaf.push('=');
        leaf.push_str(v);
    }

    match filepath.parent() {
        Some(dir) if dir != Path::new("") && dir != Path::new(".") => {
            format!("{}/{}", dir.display(), leaf)
        }
        _ => leaf,
    }
}

/// Builder for [`TestSpec`], used by source parsers and by tests.
#[derive(Debug, Clone)]
pub struct TestSpecBuilder {
    root: PathBuf,
    filepath: PathBuf,
    name: String,
    parameters: ParamMap,
    keywords: BTreeSet<String>,
    dependencies: Vec<DepSpec>,
    platform_enable: Vec<WordExpression>,
    option_enable: Vec<WordExpression>,
    file_search: Vec<String>,
    timeout: Option<u64>,
    analyze: bool,
    baseline: bool,
    paramset: Option<ParameterSet>,
}

impl TestSpecBuilder {
    pub fn new(root: impl Into<PathBuf>, filepath: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            filepath: filepath.into(),
            name: name.into(),
            parameters: ParamMap::new(),
            keywords: BTreeSet::new(),
            dependencies: Vec::new(),
            platform_enable: Vec::new(),
            option_enable: Vec::new(),
            file_search: Vec::new(),
            timeout: None,
            analyze: false,
            baseline: false,
            paramset: None,
        }
    }

    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.to_string(), value.to_string());
        self
    }

    pub fn params(mut self, params: ParamMap) -> Self {
        self.parameters = params;
        self
    }

    pub fn keyword(mut self, kw: &str) -> Self {
        self.keywords.insert(kw.to_string());
        self
    }

    pub fn depends_on(mut self, pattern: &str, result_expr: Option<WordExpression>) -> Self {
        self.dependencies.push(DepSpec {
            pattern: pattern.to_string(),
            result_expr,
        });
        self
    }

    pub fn enable_platform(mut self, expr: WordExpression) -> Self {
        self.platform_enable.push(expr);
        self
    }

    pub fn enable_option(mut self, expr: WordExpression) -> Self {
        self.option_enable.push(expr);
        self
    }

    pub fn file_search(mut self, pattern: &str) -> Self {
        self.file_search.push(pattern.to_string());
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn analyze(mut self) -> Self {
        self.analyze = true;
        self
    }

    pub fn baseline(mut self) -> Self {
        self.baseline = true;
        self
    }

    pub fn paramset(mut self, pset: ParameterSet) -> Self {
        self.paramset = Some(pset);
        self
    }

    pub fn build(self) -> TestSpec {
        let exec_dir = make_exec_dir(&self.filepath, &self.name, &self.parameters);
        TestSpec {
            root: self.root,
            filepath: self.filepath,
            name: self.name,
            exec_dir,
            parameters: self.parameters,
            keywords: self.keywords,
            dependencies: self.dependencies,
            platform_enable: self.platform_enable,
            option_enable: self.option_enable,
            file_search: self.file_search,
            timeout: self.timeout,
            analyze: self.analyze,
            baseline: self.baseline,
            paramset: self.paramset,
        }
    }
}

/// Source of test specs.
///
/// Implementations parse test source files under a scan root and yield the
/// full (unfiltered) universe of parameterized instances plus any analyze
/// aggregators. Parse faults in a single file are reported by the
/// implementation and scanning continues; only infrastructure faults
/// surface as errors.
#[async_trait]
pub trait SpecSource: Send + Sync {
    async fn discover(&self, root: &Path) -> Result<Vec<TestSpec>, ScanError>;
}

//! Runtime test cases and dependency edges.
//!
//! A [`TestCase`] pairs an immutable [`TestSpec`] with its mutable
//! [`TestStatus`] and carries the dependency edges resolved against the
//! universe of known execute directories. Cases live in the
//! [`crate::list::TestList`] registry and are referenced by execute
//! directory; an edge therefore stores the dependee's directory rather
//! than a pointer, and the blocking predicates take the dependee case as
//! an argument.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::exprs::WordExpression;
use crate::params::ParamMap;
use crate::spec::TestSpec;
use crate::status::{ResultKind, TestStatus};

/// What a dependency edge points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepTarget {
    /// A known test case, by execute directory.
    Case(String),
    /// A declared pattern that matched nothing; the dependent can never
    /// run.
    Unmatched(String),
}

/// A resolved dependency edge from a dependent test to a dependee.
#[derive(Debug, Clone)]
pub struct TestDependency {
    target: DepTarget,
    /// The declared wildcard that produced this edge; `None` for the
    /// implicit analyze-to-sibling edges.
    pattern: Option<String>,
    /// Result expression the dependee must satisfy; default is
    /// "pass or diff".
    result_expr: Option<WordExpression>,
}

impl TestDependency {
    pub fn new(target: DepTarget, pattern: Option<String>, result_expr: Option<WordExpression>) -> Self {
        Self {
            target,
            pattern,
            result_expr,
        }
    }

    pub fn target(&self) -> &DepTarget {
        &self.target
    }

    /// Identity used for overwrite-on-re-add: the dependee directory, or
    /// the pattern for an unmatched edge.
    pub fn target_id(&self) -> &str {
        match &self.target {
            DepTarget::Case(xdir) => xdir,
            DepTarget::Unmatched(pat) => pat,
        }
    }

    /// `(pattern, execute-dir)` for a matched edge, used to expose the
    /// dependee's location to the child environment.
    pub fn match_directory(&self) -> Option<(&str, &str)> {
        match &self.target {
            DepTarget::Case(xdir) => Some((self.pattern.as_deref().unwrap_or(""), xdir)),
            DepTarget::Unmatched(_) => None,
        }
    }

    fn result_satisfied(&self, result: ResultKind) -> bool {
        match &self.result_expr {
            Some(expr) => expr.evaluate(|w| w == result.as_str()),
            None => matches!(result, ResultKind::Pass | ResultKind::Diff),
        }
    }

    /// Whether this edge currently prevents the dependent from launching:
    /// the dependee has not finished, or finished with an unsatisfying
    /// result, or can never run at all.
    pub fn is_blocking(&self, dependee: Option<&TestCase>) -> bool {
        let Some(dep) = dependee else {
            return true; // unmatched or unknown dependee never unblocks
        };

        if dep.status().skip_test() || dep.construction_error().is_some() {
            return true;
        }

        match dep.status().result() {
            _ if !dep.status().is_done() => true,
            Some(result) => !self.result_satisfied(result),
            None => true,
        }
    }

    /// Whether the dependee's fate is already sealed against this edge:
    /// it was skipped, can never be built, or finished with a result the
    /// edge rejects.
    pub fn will_never_run(&self, dependee: Option<&TestCase>) -> bool {
        let Some(dep) = dependee else {
            return true;
        };

        if dep.status().skip_test() || dep.construction_error().is_some() {
            return true;
        }

        if dep.status().is_done() {
            match dep.status().result() {
                Some(result) => !self.result_satisfied(result),
                None => true,
            }
        } else {
            false
        }
    }

    /// Whether the dependee ran, is running, or still could run.
    pub fn ran_or_could_run(&self, dependee: Option<&TestCase>) -> bool {
        !self.will_never_run(dependee)
    }

    /// Human-readable reason used when a blocked test is abandoned.
    pub fn blocked_reason(&self) -> String {
        match &self.target {
            DepTarget::Case(xdir) => format!("dependency {}", xdir),
            DepTarget::Unmatched(pat) => {
                format!("dependency pattern {:?} matched no test", pat)
            }
        }
    }
}

/// A test spec plus its execution state and dependency edges.
#[derive(Debug, Clone)]
pub struct TestCase {
    spec: Arc<TestSpec>,
    status: TestStatus,
    nodesize: Option<u32>,
    deps: Vec<TestDependency>,
    depdirs: BTreeMap<String, String>, // exec dir -> match pattern
    has_dependent: bool,
    construction_error: Option<String>,
    /// For analyze tests: the group's parameter expansion, narrowed by
    /// filtering to the surviving siblings. The spec's own copy stays
    /// frozen.
    analyze_params: Option<crate::params::ParameterSet>,
}

impl TestCase {
    pub fn new(spec: Arc<TestSpec>, nodesize: Option<u32>) -> Self {
        let analyze_params = if spec.is_analyze() {
            spec.paramset().cloned()
        } else {
            None
        };
        Self {
            spec,
            status: TestStatus::new(),
            nodesize,
            deps: Vec::new(),
            depdirs: BTreeMap::new(),
            has_dependent: false,
            construction_error: None,
            analyze_params,
        }
    }

    pub fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub fn spec_arc(&self) -> Arc<TestSpec> {
        Arc::clone(&self.spec)
    }

    pub fn spec_mut(&mut self) -> Option<&mut TestSpec> {
        Arc::get_mut(&mut self.spec)
    }

    pub fn exec_dir(&self) -> &str {
        self.spec.exec_dir()
    }

    pub fn status(&self) -> &TestStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut TestStatus {
        &mut self.status
    }

    /// `(processors, devices)` needed to launch this test, folding the
    /// node-count parameter into processors when a node size is known.
    pub fn size(&self) -> (u32, u32) {
        compute_test_size(self.spec.parameters(), self.nodesize)
    }

    pub fn set_has_dependent(&mut self) {
        self.has_dependent = true;
    }

    pub fn has_dependent(&self) -> bool {
        self.has_dependent
    }

    /// Adds an edge; an edge to the same dependee replaces the old one.
    pub fn add_dependency(&mut self, dep: TestDependency) {
        if let Some(existing) = self
            .deps
            .iter_mut()
            .find(|d| d.target_id() == dep.target_id())
        {
            *existing = dep;
        } else {
            self.deps.push(dep);
        }
    }

    pub fn dependencies(&self) -> &[TestDependency] {
        &self.deps
    }

    pub fn num_dependencies(&self) -> usize {
        self.deps.len()
    }

    /// Records a completed-sibling location for the child environment.
    pub fn add_dep_directory(&mut self, pattern: &str, exec_dir: &str) {
        if !exec_dir.is_empty() {
            self.depdirs
                .insert(exec_dir.to_string(), pattern.to_string());
        }
    }

    /// `(pattern, exec-dir)` pairs of dependencies that ran or could run.
    pub fn dep_directories(&self) -> Vec<(String, String)> {
        self.depdirs
            .iter()
            .map(|(xdir, pat)| (pat.clone(), xdir.clone()))
            .collect()
    }

    /// Marks the case unbuildable (dependency cycle, unmatched pattern).
    pub fn set_construction_error(&mut self, reason: impl Into<String>) {
        self.construction_error = Some(reason.into());
    }

    pub fn construction_error(&self) -> Option<&str> {
        self.construction_error.as_deref()
    }

    /// The analyze test's parameter expansion, narrowed by filtering.
    pub fn analyze_params(&self) -> Option<&crate::params::ParameterSet> {
        self.analyze_params.as_ref()
    }

    pub fn analyze_params_mut(&mut self) -> Option<&mut crate::params::ParameterSet> {
        self.analyze_params.as_mut()
    }
}

/// Computes `(np, nd)` for a parameter binding.
///
/// `np` and `nnode` are floored at 1 when present; with a known node size
/// the node request is converted to processors and the larger figure
/// wins. A test with neither parameter needs one processor.
pub fn compute_test_size(params: &ParamMap, nodesize: Option<u32>) -> (u32, u32) {
    let get = |name: &str| -> u32 {
        params
            .get(name)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
    };

    let mut np = if params.contains_key("np") { get("np").max(1) } else { 0 };
    let nn = if params.contains_key("nnode") { get("nnode").max(1) } else { 0 };

    if let Some(size) = nodesize {
        if np > 0 && nn > 0 {
            np = np.max(nn * size);
        } else if nn > 0 {
            np = nn * size;
        }
    }
    if np == 0 {
        np = 1;
    }

    let nd = get("ndevice");

    (np, nd)
}

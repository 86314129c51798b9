//! Mutable execution state attached to a test.
//!
//! A [`TestStatus`] records what the scheduler and runners learn about a
//! test over a run: whether filtering excluded it (and why), when it
//! started, how long it ran, its result, and the child exit. The
//! attribute-map conversion at the bottom is the contract shared with the
//! test-list file format and the runtime databases.

use std::collections::BTreeMap;
use std::fmt;

/// Coarse execution state of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Never started in this run.
    NotRun,
    /// Started but not finished (running, or interrupted mid-run).
    NotDone,
    /// Finished; a result is recorded.
    Done,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotRun => "notrun",
            RunState::NotDone => "notdone",
            RunState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notrun" => Some(RunState::NotRun),
            "notdone" => Some(RunState::NotDone),
            "done" => Some(RunState::Done),
            _ => None,
        }
    }
}

/// Final outcome of a test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Pass,
    Diff,
    Fail,
    Timeout,
    NotRun,
    NotDone,
    Skip,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Pass => "pass",
            ResultKind::Diff => "diff",
            ResultKind::Fail => "fail",
            ResultKind::Timeout => "timeout",
            ResultKind::NotRun => "notrun",
            ResultKind::NotDone => "notdone",
            ResultKind::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(ResultKind::Pass),
            "diff" => Some(ResultKind::Diff),
            "fail" => Some(ResultKind::Fail),
            "timeout" => Some(ResultKind::Timeout),
            "notrun" => Some(ResultKind::NotRun),
            "notdone" => Some(ResultKind::NotDone),
            "skip" => Some(ResultKind::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why filtering excluded a test.
///
/// The parameter variant is distinguished: analyze aggregators ignore
/// siblings excluded by parameter when deciding their own fate, and group
/// rebuilds drop parameter-skipped tests entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Parameter,
    RestartParameter,
    Platform,
    Option,
    Keyword,
    ResultsKeyword,
    Tdd,
    FileSearch,
    MaxProcessors,
    Runtime,
    /// Cumulative-runtime cutoff. The display text preserves the
    /// long-standing spelling from the original results files.
    CumulativeRuntime,
    AnalyzeDependency,
    Subdir,
    NoBaseline,
    UserValidation(String),
}

impl SkipReason {
    pub fn as_text(&self) -> &str {
        match self {
            SkipReason::Parameter => "parameter expression",
            SkipReason::RestartParameter => "restart parameter expression failed",
            SkipReason::Platform => "platform expression",
            SkipReason::Option => "option expression",
            SkipReason::Keyword => "keyword expression",
            SkipReason::ResultsKeyword => "results keyword expression",
            SkipReason::Tdd => "TDD keyword",
            SkipReason::FileSearch => "file search",
            SkipReason::MaxProcessors => "exceeds max processors",
            SkipReason::Runtime => "runtime bounds",
            SkipReason::CumulativeRuntime => "cummulative runtime threshhold",
            SkipReason::AnalyzeDependency => "analyze dependency skipped",
            SkipReason::Subdir => "subdir",
            SkipReason::NoBaseline => "no baseline handling",
            SkipReason::UserValidation(msg) => msg,
        }
    }

    /// Whether this reason is the distinguished by-parameter exclusion.
    pub fn is_parameter(&self) -> bool {
        matches!(self, SkipReason::Parameter | SkipReason::RestartParameter)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_text())
    }
}

/// Child exit as observed by a runner. Remote monitors can only recover
/// the trailer text, which is not always an integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Text(String),
}

impl ExitStatus {
    pub fn as_code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(c) => Some(*c),
            ExitStatus::Text(_) => None,
        }
    }
}

/// Mutable execution state for one test.
#[derive(Debug, Clone, Default)]
pub struct TestStatus {
    skip: Option<SkipReason>,
    state: Option<RunState>,
    result: Option<ResultKind>,
    /// Epoch seconds at start of the most recent execution.
    xdate: Option<i64>,
    /// Runtime in seconds of the most recent execution.
    xtime: Option<i64>,
    /// Runtime estimate from a prior run or the timings database.
    estimate: Option<i64>,
    exit: Option<ExitStatus>,
}

impl TestStatus {
    pub fn new() -> Self {
        Self::default()
    }

    // -- filtering ---------------------------------------------------------

    pub fn mark_skip(&mut self, reason: SkipReason) {
        self.skip = Some(reason);
    }

    pub fn clear_skip(&mut self) {
        self.skip = None;
    }

    /// Whether the test is excluded from this run.
    pub fn skip_test(&self) -> bool {
        self.skip.is_some()
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        self.skip.as_ref()
    }

    pub fn skipped_by_parameter(&self) -> bool {
        self.skip.as_ref().map(|r| r.is_parameter()).unwrap_or(false)
    }

    /// Whether this exclusion forces the group's analyze test to be
    /// skipped as well. Parameter exclusions do not; everything else does.
    pub fn skip_causes_analyze_skip(&self) -> bool {
        self.skip
            .as_ref()
            .map(|r| !r.is_parameter())
            .unwrap_or(false)
    }

    // -- execution ---------------------------------------------------------

    pub fn mark_started(&mut self, epoch_secs: i64) {
        self.xdate = Some(epoch_secs);
        self.state = Some(RunState::NotDone);
        self.result = None;
        self.exit = None;
        self.xtime = None;
    }

    pub fn mark_done(&mut self, result: ResultKind, exit: Option<ExitStatus>, runtime_secs: i64) {
        self.state = Some(RunState::Done);
        self.result = Some(result);
        self.exit = exit;
        self.xtime = Some(runtime_secs.max(0));
    }

    pub fn mark_timed_out(&mut self, runtime_secs: i64) {
        self.mark_done(ResultKind::Timeout, None, runtime_secs);
    }

    pub fn mark_not_run(&mut self) {
        self.state = Some(RunState::NotRun);
        self.result = Some(ResultKind::NotRun);
    }

    pub fn is_done(&self) -> bool {
        self.state == Some(RunState::Done)
    }

    pub fn is_not_done(&self) -> bool {
        self.state == Some(RunState::NotDone)
    }

    pub fn is_not_run(&self) -> bool {
        self.state.map(|s| s == RunState::NotRun).unwrap_or(true)
    }

    pub fn state(&self) -> Option<RunState> {
        self.state
    }

    pub fn result(&self) -> Option<ResultKind> {
        self.result
    }

    pub fn exit(&self) -> Option<&ExitStatus> {
        self.exit.as_ref()
    }

    pub fn start_date(&self) -> Option<i64> {
        self.xdate
    }

    /// Measured runtime of the most recent execution, in seconds.
    pub fn runtime(&self) -> Option<i64> {
        self.xtime
    }

    /// Best available runtime figure: a measured runtime, else the
    /// estimate from prior results, else `default`.
    pub fn runtime_estimate(&self, default: i64) -> i64 {
        self.xtime.or(self.estimate).unwrap_or(default)
    }

    pub fn set_runtime_estimate(&mut self, secs: i64) {
        self.estimate = Some(secs);
    }

    /// Keywords contributed by execution state, used by results-keyword
    /// filtering on restarts (`"fail or diff"`, `"notrun"`, ...).
    pub fn results_keywords(&self) -> Vec<&'static str> {
        match self.state {
            None | Some(RunState::NotRun) => vec!["notrun"],
            Some(RunState::NotDone) => vec!["notdone", "running"],
            Some(RunState::Done) => {
                let mut kws = vec!["done"];
                if let Some(res) = self.result {
                    kws.push(res.as_str());
                }
                kws
            }
        }
    }

    // -- attribute map -----------------------------------------------------

    /// Exports the persistent attributes (`xdate`, `xtime`, `state`,
    /// `result`) for the list and timings file writers.
    pub fn to_attrs(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Some(d) = self.xdate {
            attrs.insert("xdate".into(), d.to_string());
        }
        if let Some(t) = self.xtime {
            attrs.insert("xtime".into(), t.to_string());
        }
        if let Some(s) = self.state {
            attrs.insert("state".into(), s.as_str().to_string());
        }
        if let Some(r) = self.result {
            attrs.insert("result".into(), r.as_str().to_string());
        }
        attrs
    }

    /// Merges persisted attributes back in, overwriting only when the
    /// incoming start date is at least as recent as the recorded one.
    pub fn absorb_attrs(&mut self, attrs: &BTreeMap<String, String>) {
        let incoming_date = attrs.get("xdate").and_then(|v| v.parse::<i64>().ok());
        if let (Some(new), Some(old)) = (incoming_date, self.xdate) {
            if new < old {
                return;
            }
        }

        if let Some(d) = incoming_date {
            self.xdate = Some(d);
        }
        if let Some(t) = attrs.get("xtime").and_then(|v| v.parse::<i64>().ok()) {
            self.xtime = Some(t);
        }
        if let Some(s) = attrs.get("state").and_then(|v| RunState::parse(v)) {
            self.state = Some(s);
        }
        if let Some(r) = attrs.get("result").and_then(|v| ResultKind::parse(v)) {
            self.result = Some(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut st = TestStatus::new();
        assert!(st.is_not_run());

        st.mark_started(1000);
        assert!(st.is_not_done());
        assert_eq!(st.results_keywords(), vec!["notdone", "running"]);

        st.mark_done(ResultKind::Pass, Some(ExitStatus::Code(0)), 42);
        assert!(st.is_done());
        assert_eq!(st.result(), Some(ResultKind::Pass));
        assert_eq!(st.runtime(), Some(42));
        assert_eq!(st.results_keywords(), vec!["done", "pass"]);
    }

    #[test]
    fn parameter_skip_does_not_force_analyze_skip() {
        let mut st = TestStatus::new();
        st.mark_skip(SkipReason::Parameter);
        assert!(st.skip_test());
        assert!(st.skipped_by_parameter());
        assert!(!st.skip_causes_analyze_skip());

        let mut st = TestStatus::new();
        st.mark_skip(SkipReason::CumulativeRuntime);
        assert!(st.skip_causes_analyze_skip());
        assert_eq!(st.skip_reason().unwrap().as_text(), "cummulative runtime threshhold");
    }

    #[test]
    fn attr_round_trip() {
        let mut st = TestStatus::new();
        st.mark_started(1700000000);
        st.mark_done(ResultKind::Diff, Some(ExitStatus::Code(5)), 17);

        let attrs = st.to_attrs();
        let mut copy = TestStatus::new();
        copy.absorb_attrs(&attrs);

        assert!(copy.is_done());
        assert_eq!(copy.result(), Some(ResultKind::Diff));
        assert_eq!(copy.runtime(), Some(17));
        assert_eq!(copy.start_date(), Some(1700000000));
    }

    #[test]
    fn absorb_ignores_older_results() {
        let mut st = TestStatus::new();
        st.mark_started(2000);
        st.mark_done(ResultKind::Pass, None, 5);

        let mut stale = BTreeMap::new();
        stale.insert("xdate".to_string(), "1000".to_string());
        stale.insert("result".to_string(), "fail".to_string());
        st.absorb_attrs(&stale);

        assert_eq!(st.result(), Some(ResultKind::Pass));
    }

    #[test]
    fn estimate_falls_back() {
        let mut st = TestStatus::new();
        assert_eq!(st.runtime_estimate(0), 0);
        st.set_runtime_estimate(30);
        assert_eq!(st.runtime_estimate(0), 30);
        st.mark_started(1);
        st.mark_done(ResultKind::Pass, None, 12);
        assert_eq!(st.runtime_estimate(0), 12);
    }
}

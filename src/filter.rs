//! Multi-pass test filtering.
//!
//! Filtering runs in two phases. The permanent filter runs once after the
//! scan: user validation, the parameter expression (analyze tests are
//! exempt), then the platform / option / keyword / TDD / file-search /
//! max-processors / runtime predicates, the cumulative-runtime cutoff,
//! and finally the analyze-group pass. The restart filter runs on resumed
//! or re-scoped runs and adds the subdirectory scope, the results-keyword
//! expression, and baseline screening.
//!
//! A rejected test is never an error: the reason lands on its status and
//! the test stays visible to reports while invisible to the scheduler.

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::groups::ParamAnalyzeGroups;
use crate::list::TestList;
use crate::params::ParamMap;
use crate::plugin::{PluginSet, ValidateSpecs};
use crate::spec::TestSpec;
use crate::status::{SkipReason, TestStatus};

/// The individual enable-expression predicates, composed by the two
/// filter passes below.
pub struct TestFilter<'a> {
    rtc: &'a RuntimeConfig,
}

impl<'a> TestFilter<'a> {
    pub fn new(rtc: &'a RuntimeConfig) -> Self {
        Self { rtc }
    }

    /// Every platform enable expression must accept the platform name.
    pub fn check_platform(&self, spec: &TestSpec) -> bool {
        spec.platform_enable()
            .iter()
            .all(|wx| wx.evaluate(|tok| tok == self.rtc.platform_name))
    }

    /// Every option enable expression must be satisfied by the on/off
    /// option sets.
    pub fn check_options(&self, spec: &TestSpec) -> bool {
        spec.option_enable()
            .iter()
            .all(|wx| self.rtc.evaluate_option_expr(wx))
    }

    /// The CLI keyword expression over the test's keywords, optionally
    /// extended with the keywords contributed by prior results.
    pub fn check_keywords(&self, spec: &TestSpec, status: &TestStatus, results: bool) -> bool {
        let mut tokens: Vec<&str> = spec.keywords().iter().map(String::as_str).collect();
        if results {
            tokens.extend(status.results_keywords());
        }
        self.rtc.satisfies_keywords(&tokens)
    }

    pub fn check_tdd(&self, spec: &TestSpec) -> bool {
        self.rtc.include_tdd || !spec.has_keyword("TDD")
    }

    /// Analyze tests are exempt from the parameter expression.
    pub fn check_parameters(&self, spec: &TestSpec) -> bool {
        spec.is_analyze() || self.rtc.evaluate_parameters(spec.parameters())
    }

    /// When content searches are configured, at least one of the test's
    /// declared search files must match one of the regexes.
    pub fn check_file_search(&self, spec: &TestSpec) -> bool {
        if self.rtc.search_regexes.is_empty() {
            return true;
        }

        let srcdir = spec.root().join(
            spec.filepath()
                .parent()
                .unwrap_or_else(|| std::path::Path::new("")),
        );
        for pattern in spec.file_search() {
            let path = srcdir.join(pattern);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if self
                .rtc
                .search_regexes
                .iter()
                .any(|re| re.is_match(&content))
            {
                return true;
            }
        }
        false
    }

    pub fn check_max_processors(&self, spec: &TestSpec) -> bool {
        self.rtc.evaluate_maxprocs(spec.np().max(1))
    }

    /// A test with a known runtime figure must fall inside the bounds;
    /// a test with no figure always passes.
    pub fn check_runtime(&self, status: &TestStatus) -> bool {
        let tm = status.runtime_estimate(-1);
        tm < 0 || self.rtc.evaluate_runtime(tm)
    }
}

/// The permanent filter pass (spec scan time).
pub fn apply_permanent_filters(
    tlist: &mut TestList,
    groups: &mut ParamAnalyzeGroups,
    rtc: &RuntimeConfig,
    plugins: &PluginSet,
) {
    let filt = TestFilter::new(rtc);

    if !rtc.include_all {
        let xdirs = tlist.exec_dirs();
        for xdir in xdirs {
            let Some(case) = tlist.case(&xdir) else { continue };
            let spec = case.spec();
            let status = case.status();

            let reason = permanent_reason(&filt, spec, status, plugins);
            if let Some(reason) = reason {
                debug!("skip {}: {}", xdir, reason);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_skip(reason);
                }
            }
        }

        if let Some(rtsum) = rtc.runtime_sum {
            filter_by_cumulative_runtime(tlist, rtsum);
        }
    }

    groups.rebuild(tlist);
    filter_analyze_tests(tlist, groups);
    tlist.recount_active();
}

fn permanent_reason(
    filt: &TestFilter<'_>,
    spec: &TestSpec,
    status: &TestStatus,
    plugins: &PluginSet,
) -> Option<SkipReason> {
    if status.skip_test() {
        return None; // already-filtered tests keep their reason
    }

    let specs = ValidateSpecs {
        name: spec.name().to_string(),
        keywords: spec.keywords().iter().cloned().collect(),
        parameters: spec.parameters().clone(),
    };
    if let Some(msg) = plugins.validate_test(&specs) {
        return Some(SkipReason::UserValidation(msg));
    }

    if !filt.check_parameters(spec) {
        return Some(SkipReason::Parameter);
    }
    if !filt.check_platform(spec) {
        return Some(SkipReason::Platform);
    }
    if !filt.check_options(spec) {
        return Some(SkipReason::Option);
    }
    if !filt.check_keywords(spec, status, false) {
        return Some(SkipReason::Keyword);
    }
    if !filt.check_tdd(spec) {
        return Some(SkipReason::Tdd);
    }
    if !filt.check_file_search(spec) {
        return Some(SkipReason::FileSearch);
    }
    if !filt.check_max_processors(spec) {
        return Some(SkipReason::MaxProcessors);
    }
    if !filt.check_runtime(status) {
        return Some(SkipReason::Runtime);
    }
    None
}

/// The restart filter pass (resumed or re-scoped runs).
pub fn apply_restart_filters(
    tlist: &mut TestList,
    groups: &mut ParamAnalyzeGroups,
    rtc: &RuntimeConfig,
) {
    let filt = TestFilter::new(rtc);

    let subdir = rtc.subdir.as_deref().and_then(|s| {
        let norm = s.trim_end_matches('/');
        if norm.is_empty() || norm == "." {
            None
        } else {
            Some(norm.to_string())
        }
    });

    if !rtc.include_all {
        let xdirs = tlist.exec_dirs();
        for xdir in xdirs {
            let Some(case) = tlist.case(&xdir) else { continue };
            if case.status().skip_test() {
                continue;
            }
            let spec = case.spec();
            let status = case.status();

            let reason = restart_reason(&filt, rtc, spec, status, &xdir, subdir.as_deref());
            if let Some(reason) = reason {
                debug!("skip {}: {}", xdir, reason);
                if let Some(case) = tlist.case_mut(&xdir) {
                    case.status_mut().mark_skip(reason);
                }
            }
        }

        if let Some(rtsum) = rtc.runtime_sum {
            filter_by_cumulative_runtime(tlist, rtsum);
        }
    }

    if !rtc.baseline {
        groups.rebuild(tlist);
        filter_analyze_tests(tlist, groups);
    }
    tlist.recount_active();
}

fn restart_reason(
    filt: &TestFilter<'_>,
    rtc: &RuntimeConfig,
    spec: &TestSpec,
    status: &TestStatus,
    xdir: &str,
    subdir: Option<&str>,
) -> Option<SkipReason> {
    if let Some(sub) = subdir {
        if xdir != sub && !is_subdir(sub, xdir) {
            return Some(SkipReason::Subdir);
        }
    }
    if !filt.check_keywords(spec, status, true) {
        return Some(SkipReason::ResultsKeyword);
    }
    if !filt.check_parameters(spec) {
        return Some(SkipReason::RestartParameter);
    }
    if !filt.check_platform(spec) {
        return Some(SkipReason::Platform);
    }
    if !filt.check_options(spec) {
        return Some(SkipReason::Option);
    }
    if !filt.check_tdd(spec) {
        return Some(SkipReason::Tdd);
    }
    if !filt.check_file_search(spec) {
        return Some(SkipReason::FileSearch);
    }
    if !filt.check_max_processors(spec) {
        return Some(SkipReason::MaxProcessors);
    }
    if !filt.check_runtime(status) {
        return Some(SkipReason::Runtime);
    }
    if rtc.baseline && !spec.has_baseline() {
        return Some(SkipReason::NoBaseline);
    }
    None
}

/// `subdir/...` containment over the path-like execute directory keys.
fn is_subdir(parent: &str, child: &str) -> bool {
    child.len() > parent.len() && child.starts_with(parent) && child.as_bytes()[parent.len()] == b'/'
}

/// The cumulative-runtime cutoff: walk the unskipped tests in ascending
/// runtime order and skip each test once the kept runtime has reached the
/// budget. A budget of zero therefore skips everything.
pub fn filter_by_cumulative_runtime(tlist: &mut TestList, rtsum: i64) {
    let mut timed: Vec<(i64, String)> = tlist
        .cases()
        .map(|c| (c.status().runtime_estimate(0), c.exec_dir().to_string()))
        .collect();
    timed.sort();

    let mut kept_sum: i64 = 0;
    for (tm, xdir) in timed {
        let Some(case) = tlist.case(&xdir) else { continue };
        if case.status().skip_test() {
            continue;
        }
        if kept_sum >= rtsum {
            if let Some(case) = tlist.case_mut(&xdir) {
                case.status_mut().mark_skip(SkipReason::CumulativeRuntime);
            }
        } else {
            kept_sum += tm;
        }
    }
}

/// The analyze-group pass: an analyze test whose sibling was excluded for
/// any reason other than its parameters is itself skipped; otherwise its
/// parameter expansion is narrowed to exactly the surviving siblings.
pub fn filter_analyze_tests(tlist: &mut TestList, groups: &ParamAnalyzeGroups) {
    struct GroupPlan {
        analyze_xdir: String,
        skip_analyze: bool,
        surviving: Vec<ParamMap>,
    }

    let mut plans: Vec<GroupPlan> = Vec::new();

    for (_key, members) in groups.iter() {
        let mut analyze_xdir = None;
        let mut skip_analyze = false;
        let mut surviving = Vec::new();

        for xdir in members {
            let Some(case) = tlist.case(xdir) else { continue };
            if case.spec().is_analyze() {
                analyze_xdir = Some(xdir.clone());
            } else if case.status().skip_causes_analyze_skip() {
                skip_analyze = true;
            } else if !case.status().skip_test() {
                surviving.push(case.spec().parameters().clone());
            }
        }

        if let Some(analyze_xdir) = analyze_xdir {
            plans.push(GroupPlan {
                analyze_xdir,
                skip_analyze,
                surviving,
            });
        }
    }

    for plan in plans {
        let Some(case) = tlist.case_mut(&plan.analyze_xdir) else { continue };
        if plan.skip_analyze {
            if !case.status().skip_test() {
                case.status_mut().mark_skip(SkipReason::AnalyzeDependency);
            }
        } else if let Some(pset) = case.analyze_params_mut() {
            pset.apply_param_filter(|inst| plan.surviving.iter().any(|p| p == inst));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exprs::WordExpression;
    use crate::params::ParameterSet;
    use crate::spec::TestSpecBuilder;

    fn group_list() -> (TestList, ParamAnalyzeGroups) {
        let mut tlist = TestList::new(None);
        for p in ["1", "2", "3"] {
            let spec = TestSpecBuilder::new("/s", "g/t.vvt", "t").param("p", p).build();
            tlist.add_spec(spec, None);
        }
        let mut pset = ParameterSet::new();
        pset.add_parameter("p", &["1", "2", "3"]);
        let analyze = TestSpecBuilder::new("/s", "g/t.vvt", "t")
            .analyze()
            .paramset(pset)
            .build();
        tlist.add_spec(analyze, None);

        let mut groups = ParamAnalyzeGroups::new();
        groups.rebuild(&tlist);
        (tlist, groups)
    }

    #[test]
    fn keyword_filter_marks_skip_reason() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(
            TestSpecBuilder::new("/s", "a/t.vvt", "t").keyword("slow").build(),
            None,
        );
        tlist.add_spec(
            TestSpecBuilder::new("/s", "a/u.vvt", "u").keyword("fast").build(),
            None,
        );

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.keyword_expr = Some(WordExpression::parse("fast").unwrap());
        let mut groups = ParamAnalyzeGroups::new();

        apply_permanent_filters(&mut tlist, &mut groups, &rtc, &PluginSet::new());

        assert!(tlist.case("a/t").unwrap().status().skip_test());
        assert!(!tlist.case("a/u").unwrap().status().skip_test());
        assert_eq!(tlist.num_active(), 1);
    }

    #[test]
    fn rerunning_permanent_filter_is_a_no_op() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(
            TestSpecBuilder::new("/s", "a/t.vvt", "t").keyword("slow").build(),
            None,
        );

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.keyword_expr = Some(WordExpression::parse("fast").unwrap());
        let mut groups = ParamAnalyzeGroups::new();

        apply_permanent_filters(&mut tlist, &mut groups, &rtc, &PluginSet::new());
        let first: Vec<_> = tlist
            .cases()
            .map(|c| c.status().skip_reason().cloned())
            .collect();

        apply_permanent_filters(&mut tlist, &mut groups, &rtc, &PluginSet::new());
        let second: Vec<_> = tlist
            .cases()
            .map(|c| c.status().skip_reason().cloned())
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn analyze_exempt_from_parameter_expression() {
        let (mut tlist, mut groups) = group_list();

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.param_expr = Some(WordExpression::parse("p=1 or p=3").unwrap());

        apply_permanent_filters(&mut tlist, &mut groups, &rtc, &PluginSet::new());

        // p=2 excluded by parameter; the analyze stays active
        assert!(tlist.case("g/t.p=2").unwrap().status().skipped_by_parameter());
        let analyze = tlist.case("g/t").unwrap();
        assert!(!analyze.status().skip_test());

        // and its parameter set narrowed to the survivors
        let insts = analyze.analyze_params().unwrap().instances();
        assert_eq!(insts.len(), 2);
        assert!(insts.iter().all(|m| m["p"] != "2"));
    }

    #[test]
    fn non_parameter_sibling_skip_kills_the_analyze() {
        let (mut tlist, mut groups) = group_list();

        tlist
            .case_mut("g/t.p=2")
            .unwrap()
            .status_mut()
            .mark_skip(SkipReason::Runtime);
        groups.rebuild(&tlist);
        filter_analyze_tests(&mut tlist, &groups);

        let analyze = tlist.case("g/t").unwrap();
        assert_eq!(
            analyze.status().skip_reason(),
            Some(&SkipReason::AnalyzeDependency)
        );
    }

    #[test]
    fn cumulative_runtime_cutoff() {
        let mut tlist = TestList::new(None);
        for (name, secs) in [("a", 10), ("b", 20), ("c", 40)] {
            let spec = TestSpecBuilder::new("/s", format!("r/{}.vvt", name), name).build();
            tlist.add_spec(spec, None);
            tlist
                .case_mut(&format!("r/{}", name))
                .unwrap()
                .status_mut()
                .set_runtime_estimate(secs);
        }

        filter_by_cumulative_runtime(&mut tlist, 25);

        assert!(!tlist.case("r/a").unwrap().status().skip_test());
        assert!(!tlist.case("r/b").unwrap().status().skip_test());
        let c = tlist.case("r/c").unwrap();
        assert_eq!(c.status().skip_reason(), Some(&SkipReason::CumulativeRuntime));
    }

    #[test]
    fn zero_cutoff_skips_everything() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(TestSpecBuilder::new("/s", "r/a.vvt", "a").build(), None);
        tlist.add_spec(TestSpecBuilder::new("/s", "r/b.vvt", "b").build(), None);

        filter_by_cumulative_runtime(&mut tlist, 0);
        assert!(tlist.cases().all(|c| c.status().skip_test()));
    }

    #[test]
    fn restart_scope_limits_to_subdir() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(TestSpecBuilder::new("/s", "in/t.vvt", "t").build(), None);
        tlist.add_spec(TestSpecBuilder::new("/s", "out/u.vvt", "u").build(), None);

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.subdir = Some("in".to_string());
        let mut groups = ParamAnalyzeGroups::new();

        apply_restart_filters(&mut tlist, &mut groups, &rtc);

        assert!(!tlist.case("in/t").unwrap().status().skip_test());
        assert_eq!(
            tlist.case("out/u").unwrap().status().skip_reason(),
            Some(&SkipReason::Subdir)
        );
    }

    #[test]
    fn restart_results_keywords_select_prior_failures() {
        let mut tlist = TestList::new(None);
        for name in ["t", "u"] {
            tlist.add_spec(
                TestSpecBuilder::new("/s", format!("r/{}.vvt", name), name).build(),
                None,
            );
        }
        tlist.case_mut("r/t").unwrap().status_mut().mark_started(10);
        tlist
            .case_mut("r/t")
            .unwrap()
            .status_mut()
            .mark_done(crate::status::ResultKind::Fail, None, 5);
        tlist.case_mut("r/u").unwrap().status_mut().mark_started(10);
        tlist
            .case_mut("r/u")
            .unwrap()
            .status_mut()
            .mark_done(crate::status::ResultKind::Pass, None, 5);

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.keyword_expr = Some(WordExpression::parse("fail or diff or notrun").unwrap());
        let mut groups = ParamAnalyzeGroups::new();

        apply_restart_filters(&mut tlist, &mut groups, &rtc);

        assert!(!tlist.case("r/t").unwrap().status().skip_test());
        assert_eq!(
            tlist.case("r/u").unwrap().status().skip_reason(),
            Some(&SkipReason::ResultsKeyword)
        );
    }

    #[test]
    fn baseline_mode_requires_baseline_handling() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(TestSpecBuilder::new("/s", "b/t.vvt", "t").baseline().build(), None);
        tlist.add_spec(TestSpecBuilder::new("/s", "b/u.vvt", "u").build(), None);

        let mut rtc = RuntimeConfig::new("Linux");
        rtc.baseline = true;
        let mut groups = ParamAnalyzeGroups::new();

        apply_restart_filters(&mut tlist, &mut groups, &rtc);

        assert!(!tlist.case("b/t").unwrap().status().skip_test());
        assert_eq!(
            tlist.case("b/u").unwrap().status().skip_reason(),
            Some(&SkipReason::NoBaseline)
        );
    }
}

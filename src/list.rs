//! The authoritative registry of test cases.
//!
//! A [`TestList`] owns every [`TestCase`] known to a run, keyed by execute
//! directory. It is the meeting point of the subsystems: scanning adds
//! specs, filtering marks them, dependency connection wires edges between
//! them, the scheduler asks blocking questions, and the file layer
//! persists the registry plus per-run result logs.

pub mod io;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::case::{TestCase, TestDependency};
use crate::spec::{ScanError, SpecSource, TestSpec};
use crate::timings::LookupCache;

use self::io::{ListIoError, ResultsWriter};

/// Registry of test cases plus the test-list file bindings.
#[derive(Debug, Default)]
pub struct TestList {
    filename: Option<PathBuf>,
    results_suffix: Option<String>,
    cases: BTreeMap<String, TestCase>,
    num_active: usize,
    results_writer: Option<ResultsWriter>,
}

impl TestList {
    /// Creates a registry. `filename` is the master test-list path; pass
    /// `None` when scanning without ever reading or writing.
    pub fn new(filename: Option<PathBuf>) -> Self {
        Self {
            filename,
            ..Self::default()
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    // -- membership --------------------------------------------------------

    /// Adds a spec unless its execute directory is already registered.
    /// Returns whether the spec was added.
    pub fn add_spec(&mut self, spec: TestSpec, nodesize: Option<u32>) -> bool {
        let xdir = spec.exec_dir().to_string();
        if self.cases.contains_key(&xdir) {
            return false;
        }
        self.cases
            .insert(xdir, TestCase::new(Arc::new(spec), nodesize));
        true
    }

    pub fn case(&self, exec_dir: &str) -> Option<&TestCase> {
        self.cases.get(exec_dir)
    }

    pub fn case_mut(&mut self, exec_dir: &str) -> Option<&mut TestCase> {
        self.cases.get_mut(exec_dir)
    }

    /// All cases, in execute-directory order.
    pub fn cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values()
    }

    pub fn cases_mut(&mut self) -> impl Iterator<Item = &mut TestCase> {
        self.cases.values_mut()
    }

    pub fn exec_dirs(&self) -> Vec<String> {
        self.cases.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    // -- scanning ----------------------------------------------------------

    /// Discovers specs under `root` and registers them. Duplicated
    /// execute directories keep the first spec seen.
    pub async fn scan(
        &mut self,
        source: &dyn SpecSource,
        root: &Path,
        nodesize: Option<u32>,
    ) -> Result<usize, ScanError> {
        let specs = source.discover(root).await?;
        let mut added = 0;
        for spec in specs {
            if self.add_spec(spec, nodesize) {
                added += 1;
            }
        }
        info!("scan found {} tests under {}", added, root.display());
        Ok(added)
    }

    /// Fills in runtime estimates from the timings database for cases
    /// with no measured runtime of their own.
    pub fn attach_runtimes(&mut self, cache: &mut LookupCache) {
        for case in self.cases.values_mut() {
            if case.status().runtime().is_none() {
                let spec = case.spec_arc();
                if let Some((secs, _result)) = cache.get_run_time(&spec) {
                    case.status_mut().set_runtime_estimate(secs);
                }
            }
        }
    }

    // -- active accounting -------------------------------------------------

    /// Recounts the active (unskipped) tests; called after a filter pass.
    pub fn recount_active(&mut self) -> usize {
        self.num_active = self
            .cases
            .values()
            .filter(|c| !c.status().skip_test())
            .count();
        self.num_active
    }

    pub fn num_active(&self) -> usize {
        self.num_active
    }

    pub fn active_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values().filter(|c| !c.status().skip_test())
    }

    // -- dependency queries ------------------------------------------------

    /// The first edge currently preventing `case` from launching.
    pub fn blocking_dependency<'a>(&self, case: &'a TestCase) -> Option<&'a TestDependency> {
        case.dependencies().iter().find(|dep| {
            let dependee = match dep.target() {
                crate::case::DepTarget::Case(xdir) => self.cases.get(xdir.as_str()),
                crate::case::DepTarget::Unmatched(_) => None,
            };
            dep.is_blocking(dependee)
        })
    }

    pub fn is_blocked(&self, case: &TestCase) -> bool {
        self.blocking_dependency(case).is_some()
    }

    pub fn blocked_reason(&self, case: &TestCase) -> Option<String> {
        self.blocking_dependency(case).map(|d| d.blocked_reason())
    }

    /// Whether `case` can never launch: a construction fault, or an edge
    /// whose dependee's fate is sealed.
    pub fn will_never_run(&self, case: &TestCase) -> bool {
        if case.construction_error().is_some() {
            return true;
        }
        case.dependencies().iter().any(|dep| {
            let dependee = match dep.target() {
                crate::case::DepTarget::Case(xdir) => self.cases.get(xdir.as_str()),
                crate::case::DepTarget::Unmatched(_) => None,
            };
            dep.will_never_run(dependee)
        })
    }

    // -- file bindings -----------------------------------------------------

    /// Sets (or generates) the datestamp suffix that names this run's
    /// results file.
    pub fn set_results_suffix(&mut self, suffix: Option<String>) -> String {
        match suffix {
            Some(s) => self.results_suffix = Some(s),
            None => {
                if self.results_suffix.is_none() {
                    let stamp = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
                    self.results_suffix = Some(stamp);
                }
            }
        }
        self.results_suffix.clone().unwrap_or_default()
    }

    pub fn results_suffix(&self) -> Option<&str> {
        self.results_suffix.as_deref()
    }

    /// Writes the whole registry to the master test-list file.
    pub fn write_file(&self, include_results_suffix: bool) -> Result<(), ListIoError> {
        let filename = self.filename.as_ref().expect("test list has a filename");
        let suffix = if include_results_suffix {
            self.results_suffix.as_deref()
        } else {
            None
        };
        io::write_test_list(filename, suffix, self.cases.values())
    }

    /// Opens this run's results file (`<testlist>.<suffix>`) for
    /// appending completions. Returns the path.
    pub fn initialize_results_file(&mut self) -> Result<PathBuf, ListIoError> {
        let suffix = self.set_results_suffix(None);
        let filename = self.filename.as_ref().expect("test list has a filename");
        let rfile = suffixed_path(filename, &suffix);
        self.results_writer = Some(ResultsWriter::create(&rfile)?);
        Ok(rfile)
    }

    /// Records another test list's results file as an include of this
    /// run's results file; the suffix extension is applied to `path`.
    pub fn add_include_file(&mut self, path: &Path) -> Result<(), ListIoError> {
        let suffix = self
            .results_suffix
            .clone()
            .expect("results suffix must be set before includes");
        let writer = self
            .results_writer
            .as_mut()
            .expect("results file must be open");
        writer.add_include(&suffixed_path(path, &suffix))
    }

    /// Appends one test's current state to the results file.
    pub fn append_test_result(&mut self, exec_dir: &str) -> Result<(), ListIoError> {
        let case = match self.cases.get(exec_dir) {
            Some(c) => c,
            None => return Ok(()),
        };
        if let Some(writer) = self.results_writer.as_mut() {
            writer.append(case)?;
        }
        Ok(())
    }

    /// Appends the finish marker and closes the results file.
    pub fn write_finished(&mut self) -> Result<(), ListIoError> {
        if let Some(mut writer) = self.results_writer.take() {
            writer.finish()?;
        }
        Ok(())
    }

    /// Reads the master test-list file, registering specs not already
    /// present from a scan.
    pub fn read_file(&mut self) -> Result<(), ListIoError> {
        let filename = self.filename.clone().expect("test list has a filename");
        if !filename.exists() {
            return Ok(());
        }
        let doc = io::read_test_list(&filename)?;
        if let Some(sfx) = doc.attrs.get("results_suffix") {
            self.results_suffix = Some(sfx.clone());
        }
        for (xdir, entry) in doc.tests {
            if let Some(spec) = entry.spec {
                self.add_spec(spec, None);
            }
            if let Some(case) = self.cases.get_mut(&xdir) {
                case.status_mut().absorb_attrs(&entry.attrs);
            }
        }
        Ok(())
    }

    /// Merges every `<testlist>.<suffix>` results file, in sorted order,
    /// into the already-registered cases. Newer start dates win.
    pub fn read_results(&mut self) -> Result<(), ListIoError> {
        for path in self.results_filenames() {
            self.read_results_file(&path)?;
        }
        Ok(())
    }

    /// Merges one results file (following its includes).
    pub fn read_results_file(&mut self, path: &Path) -> Result<(), ListIoError> {
        let doc = io::read_test_list(path)?;
        for (xdir, entry) in doc.tests {
            if let Some(case) = self.cases.get_mut(&xdir) {
                case.status_mut().absorb_attrs(&entry.attrs);
            }
        }
        Ok(())
    }

    /// All per-run results files for this test list, sorted by name
    /// (which is sorted by date, given the suffix format).
    pub fn results_filenames(&self) -> Vec<PathBuf> {
        let Some(filename) = self.filename.as_ref() else {
            return Vec::new();
        };
        let Some(dir) = filename.parent() else {
            return Vec::new();
        };
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        let base = match filename.file_name().and_then(|n| n.to_str()) {
            Some(b) => format!("{}.", b),
            None => return Vec::new(),
        };

        let mut found = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with(&base) {
                        found.push(entry.path());
                    }
                }
            }
        }
        found.sort();
        found
    }
}

fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{DepTarget, TestDependency};
    use crate::spec::TestSpecBuilder;
    use crate::status::{ExitStatus, ResultKind, SkipReason};

    fn spec(file: &str, name: &str, np: &str) -> TestSpec {
        TestSpecBuilder::new("/src", file, name).param("np", np).build()
    }

    #[test]
    fn duplicate_exec_dirs_keep_first() {
        let mut tlist = TestList::new(None);
        assert!(tlist.add_spec(spec("a/t.vvt", "t", "2"), None));
        assert!(!tlist.add_spec(spec("a/t.vvt", "t", "2"), None));
        assert_eq!(tlist.len(), 1);
    }

    #[test]
    fn active_count_tracks_skips() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(spec("a/t.vvt", "t", "1"), None);
        tlist.add_spec(spec("a/u.vvt", "u", "1"), None);
        assert_eq!(tlist.recount_active(), 2);

        tlist
            .case_mut("a/u.np=1")
            .unwrap()
            .status_mut()
            .mark_skip(SkipReason::Keyword);
        assert_eq!(tlist.recount_active(), 1);
    }

    #[test]
    fn blocking_queries_resolve_through_registry() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(spec("a/t.vvt", "t", "1"), None);
        tlist.add_spec(spec("a/u.vvt", "u", "1"), None);

        tlist.case_mut("a/u.np=1").unwrap().add_dependency(TestDependency::new(
            DepTarget::Case("a/t.np=1".into()),
            Some("t*".into()),
            None,
        ));

        let dependent = tlist.case("a/u.np=1").unwrap();
        assert!(tlist.is_blocked(dependent));
        assert!(!tlist.will_never_run(dependent));

        tlist.case_mut("a/t.np=1").unwrap().status_mut().mark_started(10);
        tlist
            .case_mut("a/t.np=1")
            .unwrap()
            .status_mut()
            .mark_done(ResultKind::Pass, Some(ExitStatus::Code(0)), 2);

        let dependent = tlist.case("a/u.np=1").unwrap();
        assert!(!tlist.is_blocked(dependent));
    }

    #[test]
    fn sealed_dependee_means_never_run() {
        let mut tlist = TestList::new(None);
        tlist.add_spec(spec("a/t.vvt", "t", "1"), None);
        tlist.add_spec(spec("a/u.vvt", "u", "1"), None);

        tlist
            .case_mut("a/t.np=1")
            .unwrap()
            .status_mut()
            .mark_skip(SkipReason::Platform);
        tlist.case_mut("a/u.np=1").unwrap().add_dependency(TestDependency::new(
            DepTarget::Case("a/t.np=1".into()),
            None,
            None,
        ));

        let dependent = tlist.case("a/u.np=1").unwrap();
        assert!(tlist.will_never_run(dependent));
    }

    #[tokio::test]
    async fn restart_reruns_only_failures() {
        use crate::exec::pool::{run_pool, PoolParams};
        use crate::exec::TestExecList;
        use crate::exprs::WordExpression;
        use crate::groups::ParamAnalyzeGroups;
        use crate::platform::{Platform, PlatformConfig};
        use crate::plugin::PluginSet;
        use crate::runner::local::ProcessGroups;
        use crate::scan::DirectoryScanner;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        fn write_script(dir: &std::path::Path, rel: &str, content: &str) {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }

        let src = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();

        write_script(src.path(), "a/good.vvt", "#!/bin/sh\n#VVT: timeout = 30\nexit 0\n");
        write_script(src.path(), "a/flaky.vvt", "#!/bin/sh\n#VVT: timeout = 30\nexit 1\n");

        let mut tlist = TestList::new(Some(run.path().join("testlist")));
        let scanner = DirectoryScanner::new();
        tlist.scan(&scanner, src.path(), None).await.unwrap();

        let rtc = crate::config::RuntimeConfig::new("Linux");
        let mut groups = ParamAnalyzeGroups::new();
        crate::filter::apply_permanent_filters(&mut tlist, &mut groups, &rtc, &PluginSet::new());

        tlist.set_results_suffix(None);
        tlist.write_file(true).unwrap();
        tlist.initialize_results_file().unwrap();

        let mut xlist = TestExecList::new();
        xlist.generate_backlog(&tlist, 30);

        let mut platform = Platform::new(PlatformConfig::new("Linux", None));
        platform.init_procs(Some(2), Some(2), None, None);

        let params = PoolParams {
            test_dir: run.path().join("TestResults"),
            poll_interval: Duration::from_millis(50),
            default_timeout_secs: 30,
            analyze_only: false,
            baseline: false,
        };

        let summary = run_pool(
            &mut tlist,
            &mut xlist,
            &mut platform,
            &params,
            CancellationToken::new(),
            ProcessGroups::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.num_fail, 1);
        tlist.write_finished().unwrap();

        // restart scoped to prior failures: the master file plus the
        // per-run result log rebuild the statuses the filter needs
        let mut tlist2 = TestList::new(Some(run.path().join("testlist")));
        tlist2.read_file().unwrap();
        tlist2.read_results().unwrap();

        let mut rtc2 = crate::config::RuntimeConfig::new("Linux");
        rtc2.keyword_expr = Some(WordExpression::parse("fail or diff or notrun").unwrap());

        let mut groups2 = ParamAnalyzeGroups::new();
        crate::filter::apply_restart_filters(&mut tlist2, &mut groups2, &rtc2);

        assert_eq!(tlist2.num_active(), 1);
        assert!(!tlist2.case("a/flaky").unwrap().status().skip_test());
        assert!(tlist2.case("a/good").unwrap().status().skip_test());
    }
}

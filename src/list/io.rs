//! Test-list file reading and writing.
//!
//! The format is line-oriented UTF-8 text. A file carries a version
//! marker, a start date, optional attribute lines, one `TEST:` line per
//! test, optional `Include =` references to auxiliary result files, and a
//! finish marker:
//!
//! ```text
//! #VVT: Version = 34
//! #VVT: Start = 2024-03-01 10:22:05
//! #VVT: Attrs = results_suffix=2024-03-01_10:22:05
//! TEST:solvers/heat.np=4 Fri_Mar_01_10:22:31_2024 xtime=18 done pass
//! #VVT: Include = ../other/testlist.2024-03-01_10:22:05
//! #VVT: Finish = 2024-03-01 10:31:40
//! ```
//!
//! Result logs for a run are the same format written append-only as tests
//! complete; a reader follows includes recursively with cycle protection
//! and merges outcomes newest-wins.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::case::TestCase;
use crate::params::ParamMap;
use crate::spec::{TestSpec, TestSpecBuilder};
use crate::timings::{make_attr_string, read_attrs};

/// Format version written by this crate.
pub const FILE_VERSION: u32 = 34;

#[derive(Debug, Error)]
pub enum ListIoError {
    #[error("cannot read test list {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write test list {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a test list file (missing version marker)")]
    NotATestList { path: PathBuf },
}

/// One test line as read from a file.
#[derive(Debug, Clone)]
pub struct ListEntry {
    /// A minimal spec reconstructed from the execute directory, for
    /// readers with no scan to match against.
    pub spec: Option<TestSpec>,
    /// Persistent attributes (`xdate`, `xtime`, `state`, `result`, `TDD`).
    pub attrs: BTreeMap<String, String>,
}

/// A parsed test-list document, includes already folded in.
#[derive(Debug, Default)]
pub struct ListDocument {
    pub version: u32,
    pub start: Option<String>,
    pub finish: Option<String>,
    pub attrs: BTreeMap<String, String>,
    pub tests: BTreeMap<String, ListEntry>,
}

// -- writing ---------------------------------------------------------------

fn open_for_write(path: &Path) -> Result<File, ListIoError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|source| ListIoError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| ListIoError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn write_err(path: &Path, source: std::io::Error) -> ListIoError {
    ListIoError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn format_test_line(case: &TestCase) -> String {
    let mut attrs = case.status().to_attrs();
    if case.spec().has_keyword("TDD") {
        attrs.insert("TDD".into(), "true".into());
    }
    let attr_str = make_attr_string(&attrs);
    if attr_str.is_empty() {
        format!("TEST:{}", case.exec_dir())
    } else {
        format!("TEST:{} {}", case.exec_dir(), attr_str)
    }
}

/// Writes a complete test-list file in one shot.
pub fn write_test_list<'a>(
    path: &Path,
    results_suffix: Option<&str>,
    cases: impl Iterator<Item = &'a TestCase>,
) -> Result<(), ListIoError> {
    let mut fp = open_for_write(path)?;
    let mut out = String::new();
    out.push_str(&format!("#VVT: Version = {}\n", FILE_VERSION));
    out.push_str(&format!("#VVT: Start = {}\n", now_stamp()));
    if let Some(sfx) = results_suffix {
        out.push_str(&format!("#VVT: Attrs = results_suffix={}\n", sfx));
    }
    for case in cases {
        out.push_str(&format_test_line(case));
        out.push('\n');
    }
    out.push_str(&format!("#VVT: Finish = {}\n", now_stamp()));
    fp.write_all(out.as_bytes()).map_err(|e| write_err(path, e))
}

/// An open per-run results file; completions are appended as they are
/// observed, so a crashed run still leaves a readable prefix.
#[derive(Debug)]
pub struct ResultsWriter {
    path: PathBuf,
    file: File,
}

impl ResultsWriter {
    pub fn create(path: &Path) -> Result<Self, ListIoError> {
        let mut file = open_for_write(path)?;
        let hdr = format!(
            "#VVT: Version = {}\n#VVT: Start = {}\n",
            FILE_VERSION,
            now_stamp()
        );
        file.write_all(hdr.as_bytes())
            .map_err(|e| write_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, case: &TestCase) -> Result<(), ListIoError> {
        let line = format_test_line(case);
        self.file
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| write_err(&self.path, e))
    }

    pub fn add_include(&mut self, include_path: &Path) -> Result<(), ListIoError> {
        self.file
            .write_all(format!("#VVT: Include = {}\n", include_path.display()).as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| write_err(&self.path, e))
    }

    pub fn finish(&mut self) -> Result<(), ListIoError> {
        self.file
            .write_all(format!("#VVT: Finish = {}\n", now_stamp()).as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| write_err(&self.path, e))
    }
}

// -- reading ---------------------------------------------------------------

/// Reads a test-list document, following `Include =` lines recursively.
/// Already-visited absolute paths are skipped, so include cycles
/// terminate.
pub fn read_test_list(path: &Path) -> Result<ListDocument, ListIoError> {
    let mut doc = ListDocument::default();
    let mut visited = HashSet::new();
    read_into(path, &mut doc, &mut visited)?;
    Ok(doc)
}

fn read_into(
    path: &Path,
    doc: &mut ListDocument,
    visited: &mut HashSet<PathBuf>,
) -> Result<(), ListIoError> {
    let canon = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canon) {
        return Ok(());
    }

    let fp = File::open(path).map_err(|source| ListIoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(fp);

    let mut saw_version = false;
    for line in reader.lines() {
        let line = line.map_err(|source| ListIoError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim_end();

        if let Some(rest) = line.strip_prefix("#VVT:") {
            let rest = rest.trim();
            if let Some((key, value)) = rest.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "Version" => {
                        saw_version = true;
                        if let Ok(v) = value.parse() {
                            doc.version = v;
                        }
                    }
                    "Start" => doc.start = Some(value.to_string()),
                    "Finish" => doc.finish = Some(value.to_string()),
                    "Attrs" => {
                        for kv in value.split_whitespace() {
                            if let Some((k, v)) = kv.split_once('=') {
                                doc.attrs.insert(k.to_string(), v.to_string());
                            }
                        }
                    }
                    "Include" => {
                        let inc = resolve_include(path, value);
                        if inc.exists() {
                            read_into(&inc, doc, visited)?;
                        } else {
                            warn!("include file not found: {}", inc.display());
                        }
                    }
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix("TEST:") {
            read_test_line(rest, doc);
        }
        // anything else is tolerated and skipped
    }

    if !saw_version && doc.version == 0 {
        return Err(ListIoError::NotATestList {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn resolve_include(from: &Path, value: &str) -> PathBuf {
    let inc = PathBuf::from(value);
    if inc.is_absolute() {
        inc
    } else {
        from.parent().unwrap_or(Path::new(".")).join(inc)
    }
}

fn read_test_line(rest: &str, doc: &mut ListDocument) {
    let rest = rest.trim();
    let (xdir, attr_part) = match rest.split_once(char::is_whitespace) {
        Some((x, a)) => (x, a.trim()),
        None => (rest, ""),
    };
    if xdir.is_empty() {
        return;
    }

    let words: Vec<&str> = attr_part.split_whitespace().collect();
    let attrs = read_attrs(&words);

    let entry = doc
        .tests
        .entry(xdir.to_string())
        .or_insert_with(|| ListEntry {
            spec: spec_from_exec_dir(xdir),
            attrs: BTreeMap::new(),
        });

    // later files overwrite when the incoming date is at least as recent
    let newer = match (
        attrs.get("xdate").and_then(|v| v.parse::<i64>().ok()),
        entry.attrs.get("xdate").and_then(|v| v.parse::<i64>().ok()),
    ) {
        (Some(new), Some(old)) => new >= old,
        _ => true,
    };
    if newer {
        entry.attrs.extend(attrs);
    }
}

/// Reconstructs a minimal spec from an execute directory, for readers
/// that have no scan to resolve against (batch reconciliation, report
/// tools). Parameter values come back; keywords and expressions do not.
fn spec_from_exec_dir(xdir: &str) -> Option<TestSpec> {
    let (dir, leaf) = match xdir.rsplit_once('/') {
        Some((d, l)) => (Some(d), l),
        None => (None, xdir),
    };

    let mut parts = leaf.split('.');
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }

    let mut params = ParamMap::new();
    for part in parts {
        if let Some((k, v)) = part.split_once('=') {
            params.insert(k.to_string(), v.to_string());
        }
    }

    let filepath = match dir {
        Some(d) => format!("{}/{}.vvt", d, name),
        None => format!("{}.vvt", name),
    };

    Some(
        TestSpecBuilder::new("", filepath, name)
            .params(params)
            .build(),
    )
}

/// Rewrites a results file with every `Include =` line replaced by the
/// included file's test lines, so the file stands alone.
pub fn inline_include_files(path: &Path) -> Result<(), ListIoError> {
    let doc = read_test_list(path)?;

    let mut fp = open_for_write(path)?;
    let mut out = String::new();
    out.push_str(&format!("#VVT: Version = {}\n", FILE_VERSION));
    if let Some(start) = &doc.start {
        out.push_str(&format!("#VVT: Start = {}\n", start));
    }
    if !doc.attrs.is_empty() {
        let kvs: Vec<String> = doc
            .attrs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!("#VVT: Attrs = {}\n", kvs.join(" ")));
    }
    for (xdir, entry) in &doc.tests {
        let attr_str = make_attr_string(&entry.attrs);
        if attr_str.is_empty() {
            out.push_str(&format!("TEST:{}\n", xdir));
        } else {
            out.push_str(&format!("TEST:{} {}\n", xdir, attr_str));
        }
    }
    if let Some(finish) = &doc.finish {
        out.push_str(&format!("#VVT: Finish = {}\n", finish));
    }
    fp.write_all(out.as_bytes()).map_err(|e| write_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::TestCase;
    use crate::spec::TestSpecBuilder;
    use crate::status::{ExitStatus, ResultKind};
    use std::sync::Arc;

    fn done_case(file: &str, name: &str, np: &str, result: ResultKind) -> TestCase {
        let spec = TestSpecBuilder::new("/src", file, name).param("np", np).build();
        let mut case = TestCase::new(Arc::new(spec), None);
        case.status_mut().mark_started(1700000000);
        case.status_mut()
            .mark_done(result, Some(ExitStatus::Code(0)), 21);
        case
    }

    #[test]
    fn write_then_read_preserves_attr_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testlist");

        let cases = vec![
            done_case("a/t.vvt", "t", "2", ResultKind::Pass),
            done_case("a/u.vvt", "u", "4", ResultKind::Diff),
        ];
        write_test_list(&path, Some("2024-03-01_10:00:00"), cases.iter()).unwrap();

        let doc = read_test_list(&path).unwrap();
        assert_eq!(doc.version, FILE_VERSION);
        assert_eq!(doc.tests.len(), 2);
        assert_eq!(
            doc.attrs.get("results_suffix").map(String::as_str),
            Some("2024-03-01_10:00:00")
        );

        for case in &cases {
            let entry = &doc.tests[case.exec_dir()];
            let mut attrs = case.status().to_attrs();
            if case.spec().has_keyword("TDD") {
                attrs.insert("TDD".into(), "true".into());
            }
            assert_eq!(make_attr_string(&entry.attrs), make_attr_string(&attrs));
        }
    }

    #[test]
    fn minimal_spec_is_reconstructed_from_exec_dir() {
        let spec = spec_from_exec_dir("solvers/heat.mesh=fine.np=8").unwrap();
        assert_eq!(spec.name(), "heat");
        assert_eq!(spec.parameters().get("np").unwrap(), "8");
        assert_eq!(spec.parameters().get("mesh").unwrap(), "fine");
        assert_eq!(spec.exec_dir(), "solvers/heat.mesh=fine.np=8");
    }

    #[test]
    fn includes_are_followed_with_cycle_protection() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("testlist.suf");
        let aux = dir.path().join("aux.suf");

        let mut w = ResultsWriter::create(&main).unwrap();
        w.append(&done_case("a/t.vvt", "t", "2", ResultKind::Pass)).unwrap();
        w.add_include(&aux).unwrap();
        w.finish().unwrap();

        // the aux file includes the main file back: must terminate
        let mut w2 = ResultsWriter::create(&aux).unwrap();
        w2.append(&done_case("a/u.vvt", "u", "4", ResultKind::Fail)).unwrap();
        w2.add_include(&main).unwrap();
        w2.finish().unwrap();

        let doc = read_test_list(&main).unwrap();
        assert_eq!(doc.tests.len(), 2);
        assert!(doc.tests.contains_key("a/u.np=4"));
    }

    #[test]
    fn newer_results_overwrite_older() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testlist.r");

        let mut old = done_case("a/t.vvt", "t", "2", ResultKind::Fail);
        old.status_mut().mark_started(1000);
        old.status_mut().mark_done(ResultKind::Fail, None, 9);

        let mut newer = done_case("a/t.vvt", "t", "2", ResultKind::Pass);
        newer.status_mut().mark_started(2000);
        newer.status_mut().mark_done(ResultKind::Pass, None, 8);

        let mut w = ResultsWriter::create(&path).unwrap();
        w.append(&old).unwrap();
        w.append(&newer).unwrap();
        w.finish().unwrap();

        let doc = read_test_list(&path).unwrap();
        let entry = &doc.tests["a/t.np=2"];
        assert_eq!(entry.attrs.get("result").map(String::as_str), Some("pass"));
    }

    #[test]
    fn inlining_replaces_includes() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("testlist.s");
        let aux = dir.path().join("sub.s");

        let mut w = ResultsWriter::create(&main).unwrap();
        w.add_include(&aux).unwrap();
        w.finish().unwrap();

        let mut w2 = ResultsWriter::create(&aux).unwrap();
        w2.append(&done_case("b/v.vvt", "v", "1", ResultKind::Pass)).unwrap();
        w2.finish().unwrap();

        inline_include_files(&main).unwrap();

        let text = std::fs::read_to_string(&main).unwrap();
        assert!(!text.contains("Include"));
        assert!(text.contains("TEST:b/v.np=1"));
    }
}

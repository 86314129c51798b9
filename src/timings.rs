//! Runtime databases.
//!
//! Two on-disk formats carry historical test runtimes, used to order the
//! backlog (longest first) and to enforce runtime filters before any test
//! has run in the current test directory:
//!
//! - `runtimes` - single-platform, one per source-tree directory:
//!   `FILE_VERSION=results3` header, then `dir/testkey <attr-string>`
//!   lines.
//! - `timings` - multi-platform, kept in the testing directory:
//!   `FILE_VERSION=multi3` header, then
//!   `dir/testkey <platform>/<compiler> <attr-string>` lines.
//!
//! The attribute string is the same encoding used by the test-list files:
//! `Day_Mon_DD_HH:MM:SS_YYYY xtime=<sec> <state> <result> [TDD]`, fields
//! omitted when absent.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeZone};
use thiserror::Error;

use crate::spec::TestSpec;

/// File name of source-tree runtimes files.
pub const RUNTIMES_FILENAME: &str = "runtimes";

/// File name of the multi-platform timings file.
pub const TIMINGS_FILENAME: &str = "timings";

const FILE_VERSION: u32 = 3;

pub type AttrMap = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum TimingsError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a {expected} results file")]
    WrongFormat { path: PathBuf, expected: String },
}

// -- attribute string codec ------------------------------------------------

const DAY_ABBREVS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const DATE_FMT: &str = "%a %b %d %H:%M:%S %Y";

/// Encodes the persistent attributes as the space-separated string used
/// in test-list and runtimes files. Absent fields are omitted.
pub fn make_attr_string(attrs: &AttrMap) -> String {
    let mut s = String::new();

    if let Some(xdate) = attrs.get("xdate").and_then(|v| v.parse::<i64>().ok()) {
        if xdate > 0 {
            if let Some(dt) = Local.timestamp_opt(xdate, 0).single() {
                let _ = write!(s, " {}", dt.format("%a_%b_%d_%H:%M:%S_%Y"));
            }
        }
    }
    if let Some(xtime) = attrs.get("xtime") {
        let _ = write!(s, " xtime={}", xtime);
    }
    if let Some(state) = attrs.get("state") {
        let _ = write!(s, " {}", state);
        if state == "done" {
            if let Some(result) = attrs.get("result") {
                let _ = write!(s, " {}", result);
            }
        }
    }
    if attrs.contains_key("TDD") {
        s.push_str(" TDD");
    }

    s.trim_start().to_string()
}

/// Decodes `make_attr_string` output; the input is the whitespace-split
/// word list. Unknown trailing words are ignored.
pub fn read_attrs(words: &[&str]) -> AttrMap {
    let mut attrs = AttrMap::new();
    let mut i = 0;

    if i < words.len() && DAY_ABBREVS.iter().any(|d| words[i].starts_with(d)) {
        let datestr = words[i].replace('_', " ");
        let joined = datestr.split_whitespace().collect::<Vec<_>>().join(" ");
        let epoch = NaiveDateTime::parse_from_str(&joined, DATE_FMT)
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(-1);
        attrs.insert("xdate".into(), epoch.to_string());
        i += 1;
    }
    if i < words.len() {
        if let Some(v) = words[i].strip_prefix("xtime=") {
            if let Ok(t) = v.parse::<i64>() {
                attrs.insert("xtime".into(), t.to_string());
            }
            i += 1;
        }
    }
    if i < words.len() && matches!(words[i], "done" | "notrun" | "notdone") {
        attrs.insert("state".into(), words[i].to_string());
        let was_done = words[i] == "done";
        i += 1;
        if was_done && i < words.len() && words[i] != "TDD" {
            attrs.insert("result".into(), words[i].to_string());
            i += 1;
        }
    }
    if i < words.len() && words[i] == "TDD" {
        attrs.insert("TDD".into(), "true".into());
    }

    attrs
}

// -- file header -----------------------------------------------------------

/// Reads a `KEY=value` header terminated by a blank line. Returns the
/// format tag and version parsed from `FILE_VERSION` (e.g. `results3` ->
/// ("results", 3)) plus the header map.
fn read_file_header<R: Read>(
    reader: &mut BufReader<R>,
) -> (Option<(String, u32)>, BTreeMap<String, String>) {
    let mut hdr = BTreeMap::new();
    let mut saw_any = false;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let line = line.trim();
        if line.is_empty() {
            if saw_any {
                break;
            }
            continue;
        }
        saw_any = true;
        if let Some((k, v)) = line.split_once('=') {
            hdr.insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    let fmt = hdr.get("FILE_VERSION").map(|vers| {
        let split = vers
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        let tag = vers[..split].to_string();
        let num = vers[split..].parse::<u32>().unwrap_or(0);
        (tag, num)
    });

    (fmt, hdr)
}

fn io_err(path: &Path, source: std::io::Error) -> TimingsError {
    TimingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn split_dir_key(token: &str) -> (String, String) {
    match token.rsplit_once('/') {
        Some((d, k)) => (d.to_string(), k.to_string()),
        None => (String::new(), token.to_string()),
    }
}

// -- single-platform database ----------------------------------------------

/// The single-platform results database backing `runtimes` files.
#[derive(Debug, Default)]
pub struct RuntimesDb {
    header: BTreeMap<String, String>,
    /// root-relative dir -> test key -> attrs
    data: BTreeMap<String, BTreeMap<String, AttrMap>>,
}

impl RuntimesDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform(&self) -> Option<&str> {
        self.header.get("PLATFORM").map(String::as_str)
    }

    pub fn in_progress(&self) -> bool {
        self.header.contains_key("IN_PROGRESS")
    }

    /// Adds or overwrites one test's attributes.
    pub fn add(&mut self, rootrel: &str, testkey: &str, attrs: AttrMap) {
        self.data
            .entry(rootrel.to_string())
            .or_default()
            .insert(testkey.to_string(), attrs);
    }

    pub fn attrs(&self, rootrel: &str, testkey: &str) -> Option<&AttrMap> {
        self.data.get(rootrel)?.get(testkey)
    }

    /// Execution time in seconds, when recorded.
    pub fn time(&self, rootrel: &str, testkey: &str) -> Option<i64> {
        self.attrs(rootrel, testkey)?
            .get("xtime")?
            .parse::<i64>()
            .ok()
    }

    /// Merges another file: a test overwrites the current entry when its
    /// execution date is at least as recent.
    pub fn merge_file(&mut self, path: &Path) -> Result<(), TimingsError> {
        let other = Self::read_file(path)?;
        for (d, tests) in other.data {
            for (tk, attrs) in tests {
                let newer = match (
                    attrs.get("xdate").and_then(|v| v.parse::<i64>().ok()),
                    self.attrs(&d, &tk)
                        .and_then(|a| a.get("xdate"))
                        .and_then(|v| v.parse::<i64>().ok()),
                ) {
                    (Some(new), Some(old)) => new >= old,
                    _ => true,
                };
                if newer {
                    self.add(&d, &tk, attrs);
                }
            }
        }
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self, TimingsError> {
        let fp = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(fp);
        let (fmt, header) = read_file_header(&mut reader);

        match fmt {
            Some((tag, _vers)) if tag == "results" => {}
            _ => {
                return Err(TimingsError::WrongFormat {
                    path: path.to_path_buf(),
                    expected: "single platform".into(),
                })
            }
        }

        let mut db = Self {
            header,
            ..Self::default()
        };
        for line in reader.lines() {
            let line = line.map_err(|e| io_err(path, e))?;
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            let (d, tk) = split_dir_key(words[0]);
            if tk.is_empty() {
                continue;
            }
            db.add(&d, &tk, read_attrs(&words[1..]));
        }
        Ok(db)
    }

    /// Writes a `runtimes` file under `dirname`, keeping only tests that
    /// passed or diffed (failures carry no useful runtime).
    pub fn write_runtimes(&self, dirname: &Path, rootrel: &str) -> Result<PathBuf, TimingsError> {
        let path = dirname.join(RUNTIMES_FILENAME);
        let mut out = String::new();
        let _ = writeln!(out, "FILE_VERSION=results{}", FILE_VERSION);
        let _ = writeln!(out, "ROOT_RELATIVE={}", rootrel);
        out.push('\n');

        for (d, tests) in &self.data {
            if d != rootrel && !d.starts_with(&format!("{}/", rootrel)) {
                continue;
            }
            for (tk, attrs) in tests {
                if matches!(attrs.get("result").map(String::as_str), Some("pass") | Some("diff")) {
                    let _ = writeln!(out, "{}/{} {}", d, tk, make_attr_string(attrs));
                }
            }
        }

        let mut fp = std::fs::File::create(&path).map_err(|e| io_err(&path, e))?;
        fp.write_all(out.as_bytes()).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }
}

// -- multi-platform database -----------------------------------------------

/// The multi-platform timings database; adds a `platform/compiler` axis.
#[derive(Debug, Default)]
pub struct TimingsDb {
    /// root-relative dir -> test key -> plat/cplr -> attrs
    data: BTreeMap<String, BTreeMap<String, BTreeMap<String, AttrMap>>>,
    /// test key -> directories it appears under
    tmap: BTreeMap<String, Vec<String>>,
}

impl TimingsDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rootrel: &str, testkey: &str, platcplr: &str, attrs: AttrMap) {
        self.data
            .entry(rootrel.to_string())
            .or_default()
            .entry(testkey.to_string())
            .or_default()
            .insert(platcplr.to_string(), attrs);

        let dirs = self.tmap.entry(testkey.to_string()).or_default();
        if !dirs.contains(&rootrel.to_string()) {
            dirs.push(rootrel.to_string());
        }
    }

    /// `(seconds, result)` for the given platform/compiler; when that
    /// platform has no entry, falls back to the maximum runtime across
    /// platforms (a conservative estimate for scheduling).
    pub fn time(&self, rootrel: &str, testkey: &str, platcplr: &str) -> Option<(i64, String)> {
        let plats = self.data.get(rootrel)?.get(testkey)?;

        let pick = |attrs: &AttrMap| -> Option<(i64, String)> {
            let t = attrs.get("xtime")?.parse::<i64>().ok()?;
            Some((t, attrs.get("result").cloned().unwrap_or_default()))
        };

        if let Some(attrs) = plats.get(platcplr) {
            if let Some(hit) = pick(attrs) {
                return Some(hit);
            }
        }
        plats
            .values()
            .filter_map(|attrs| pick(attrs))
            .max_by_key(|(t, _)| *t)
    }

    /// The unique directory containing `testkey`, when unambiguous.
    pub fn root_relative(&self, testkey: &str) -> Option<&str> {
        match self.tmap.get(testkey) {
            Some(dirs) if dirs.len() == 1 => Some(&dirs[0]),
            _ => None,
        }
    }

    pub fn read_file(path: &Path) -> Result<Self, TimingsError> {
        let fp = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(fp);
        let (fmt, _header) = read_file_header(&mut reader);

        match fmt {
            Some((tag, _vers)) if tag == "multi" => {}
            _ => {
                return Err(TimingsError::WrongFormat {
                    path: path.to_path_buf(),
                    expected: "multi platform".into(),
                })
            }
        }

        let mut db = Self::default();
        for line in reader.lines() {
            let line = line.map_err(|e| io_err(path, e))?;
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.len() < 2 {
                continue;
            }
            let (d, tk) = split_dir_key(words[0]);
            if tk.is_empty() || d.is_empty() {
                continue;
            }
            db.add(&d, &tk, words[1], read_attrs(&words[2..]));
        }
        Ok(db)
    }

    pub fn write_file(&self, path: &Path) -> Result<(), TimingsError> {
        let mut out = String::new();
        let _ = writeln!(out, "FILE_VERSION=multi{}", FILE_VERSION);
        out.push('\n');
        for (d, tests) in &self.data {
            for (tk, plats) in tests {
                for (pc, attrs) in plats {
                    let _ = writeln!(out, "{}/{} {} {}", d, tk, pc, make_attr_string(attrs));
                }
            }
        }
        let mut fp = std::fs::File::create(path).map_err(|e| io_err(path, e))?;
        fp.write_all(out.as_bytes()).map_err(|e| io_err(path, e))
    }
}

// -- lookup cache ----------------------------------------------------------

/// Runtime estimate lookup for scheduling and runtime filters.
///
/// Consulted per test, in order: the testing directory's multi-platform
/// timings file (for this platform/compiler), then `runtimes` files found
/// in the test's source directory walking toward the scan root. Negative
/// lookups are cached so a scan touches each directory once.
#[derive(Debug)]
pub struct LookupCache {
    platcplr: String,
    multi: Option<TimingsDb>,
    merged: RuntimesDb,
    scanned_dirs: std::collections::HashSet<PathBuf>,
}

impl LookupCache {
    pub fn new(platname: &str, cplrname: Option<&str>, results_dir: Option<&Path>) -> Self {
        let multi = results_dir
            .map(|d| d.join(TIMINGS_FILENAME))
            .filter(|f| f.exists())
            .and_then(|f| TimingsDb::read_file(&f).ok());

        Self {
            platcplr: format!("{}/{}", platname, cplrname.unwrap_or("")),
            multi,
            merged: RuntimesDb::new(),
            scanned_dirs: std::collections::HashSet::new(),
        }
    }

    /// `(seconds, result)` for the spec, or `None` when no database knows
    /// it.
    pub fn get_run_time(&mut self, spec: &TestSpec) -> Option<(i64, String)> {
        let testkey = spec
            .exec_dir()
            .rsplit_once('/')
            .map(|(_, k)| k)
            .unwrap_or(spec.exec_dir())
            .to_string();
        let rootrel = spec
            .exec_dir()
            .rsplit_once('/')
            .map(|(d, _)| d.to_string())
            .unwrap_or_default();

        if let Some(multi) = &self.multi {
            let rr = if rootrel.is_empty() {
                multi.root_relative(&testkey).map(str::to_string)
            } else {
                Some(rootrel.clone())
            };
            if let Some(rr) = rr {
                if let Some(hit) = multi.time(&rr, &testkey, &self.platcplr) {
                    return Some(hit);
                }
            }
        }

        if !rootrel.is_empty() {
            self.scan_source_tree(spec, &rootrel);
            if let Some(t) = self.merged.time(&rootrel, &testkey) {
                let result = self
                    .merged
                    .attrs(&rootrel, &testkey)
                    .and_then(|a| a.get("result").cloned())
                    .unwrap_or_default();
                return Some((t, result));
            }
        }

        None
    }

    /// Merges `runtimes` files from the test's directory up to the scan
    /// root into the single-platform view.
    fn scan_source_tree(&mut self, spec: &TestSpec, _rootrel: &str) {
        let mut dir = spec.root().join(
            spec.filepath()
                .parent()
                .unwrap_or_else(|| Path::new("")),
        );
        loop {
            if !self.scanned_dirs.insert(dir.clone()) {
                break;
            }
            let f = dir.join(RUNTIMES_FILENAME);
            if f.exists() {
                if self.merged.merge_file(&f).is_err() {
                    break;
                }
            }
            if dir == spec.root() || !dir.pop() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn attr_string_fields_in_order() {
        let a = attrs(&[
            ("xdate", "1709290951"),
            ("xtime", "18"),
            ("state", "done"),
            ("result", "pass"),
        ]);
        let s = make_attr_string(&a);
        let words: Vec<&str> = s.split_whitespace().collect();
        assert_eq!(words.len(), 4);
        assert!(DAY_ABBREVS.iter().any(|d| words[0].starts_with(d)));
        assert_eq!(words[1], "xtime=18");
        assert_eq!(words[2], "done");
        assert_eq!(words[3], "pass");
    }

    #[test]
    fn attr_codec_round_trip() {
        let a = attrs(&[
            ("xdate", "1709290951"),
            ("xtime", "18"),
            ("state", "done"),
            ("result", "diff"),
            ("TDD", "true"),
        ]);
        let s = make_attr_string(&a);
        let words: Vec<&str> = s.split_whitespace().collect();
        let back = read_attrs(&words);

        assert_eq!(back.get("xtime").unwrap(), "18");
        assert_eq!(back.get("state").unwrap(), "done");
        assert_eq!(back.get("result").unwrap(), "diff");
        assert!(back.contains_key("TDD"));
        // the date survives to the second
        assert_eq!(back.get("xdate").unwrap(), "1709290951");
    }

    #[test]
    fn partial_attr_strings_are_tolerated() {
        assert!(read_attrs(&[]).is_empty());

        let back = read_attrs(&["notrun"]);
        assert_eq!(back.get("state").unwrap(), "notrun");
        assert!(!back.contains_key("result"));

        let back = read_attrs(&["xtime=5", "done", "fail"]);
        assert_eq!(back.get("xtime").unwrap(), "5");
        assert_eq!(back.get("result").unwrap(), "fail");
    }

    #[test]
    fn runtimes_db_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let mut db = RuntimesDb::new();
        db.add(
            "solvers",
            "heat.np=4",
            attrs(&[("xdate", "1709290951"), ("xtime", "30"), ("state", "done"), ("result", "pass")]),
        );
        db.add(
            "solvers",
            "flow.np=2",
            attrs(&[("xtime", "9"), ("state", "done"), ("result", "fail")]),
        );
        let path = db.write_runtimes(dir.path(), "solvers").unwrap();

        let back = RuntimesDb::read_file(&path).unwrap();
        assert_eq!(back.time("solvers", "heat.np=4"), Some(30));
        // failed tests are not persisted in runtimes files
        assert!(back.attrs("solvers", "flow.np=2").is_none());
    }

    #[test]
    fn merge_prefers_newer_dates() {
        let dir = tempfile::tempdir().unwrap();

        let mut old = RuntimesDb::new();
        old.add(
            "a",
            "t.np=1",
            attrs(&[("xdate", "1000000000"), ("xtime", "60"), ("state", "done"), ("result", "pass")]),
        );
        let f = old.write_runtimes(dir.path(), "a").unwrap();

        let mut db = RuntimesDb::new();
        db.add(
            "a",
            "t.np=1",
            attrs(&[("xdate", "1709290951"), ("xtime", "45"), ("state", "done"), ("result", "pass")]),
        );
        db.merge_file(&f).unwrap();
        assert_eq!(db.time("a", "t.np=1"), Some(45));
    }

    #[test]
    fn timings_db_falls_back_across_platforms() {
        let mut db = TimingsDb::new();
        db.add(
            "a",
            "t.np=1",
            "Linux/gcc",
            attrs(&[("xtime", "50"), ("state", "done"), ("result", "pass")]),
        );
        db.add(
            "a",
            "t.np=1",
            "Darwin/clang",
            attrs(&[("xtime", "80"), ("state", "done"), ("result", "pass")]),
        );

        let (t, r) = db.time("a", "t.np=1", "Linux/gcc").unwrap();
        assert_eq!((t, r.as_str()), (50, "pass"));

        // unknown platform: conservative max across platforms
        let (t, _) = db.time("a", "t.np=1", "CrayXC/icc").unwrap();
        assert_eq!(t, 80);

        assert_eq!(db.root_relative("t.np=1"), Some("a"));
    }

    #[test]
    fn timings_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TIMINGS_FILENAME);

        let mut db = TimingsDb::new();
        db.add(
            "sub/dir",
            "t.np=8",
            "Linux/gcc",
            attrs(&[("xtime", "120"), ("state", "done"), ("result", "diff")]),
        );
        db.write_file(&path).unwrap();

        let back = TimingsDb::read_file(&path).unwrap();
        let (t, r) = back.time("sub/dir", "t.np=8", "Linux/gcc").unwrap();
        assert_eq!((t, r.as_str()), (120, "diff"));
    }
}

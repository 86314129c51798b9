//! Test source discovery.
//!
//! [`DirectoryScanner`] walks a source tree for `.vvt` test files and
//! parses their directive headers into [`TestSpec`]s, expanding
//! parameterized instances and emitting the analyze aggregator when the
//! file asks for one. A malformed file is reported and skipped; the scan
//! continues.
//!
//! Recognized directives (comment lines starting with `#VVT:`):
//!
//! ```text
//! #VVT: keywords = fast 3d
//! #VVT: parameterize = np : 1 4 16
//! #VVT: parameterize = nx,ny : 10,20 30,60
//! #VVT: analyze = --analyze
//! #VVT: depends on = sibling*/pattern
//! #VVT: depends on (result="pass or diff") = setup*
//! #VVT: timeout = 600
//! #VVT: enable (platforms="Linux or Darwin")
//! #VVT: enable (options="dbg")
//! #VVT: baseline = --baseline
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::exprs::WordExpression;
use crate::params::ParameterSet;
use crate::spec::{ScanError, SpecSource, TestSpec, TestSpecBuilder};

/// Directory names that are never descended into.
fn prune_dir(name: &str) -> bool {
    name.starts_with("TestResults.") || name.starts_with("Build_") || name.starts_with('.')
}

/// Recursive `.vvt` scanner.
#[derive(Debug, Default)]
pub struct DirectoryScanner;

impl DirectoryScanner {
    pub fn new() -> Self {
        Self
    }

    fn walk(&self, root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !prune_dir(&name) {
                    self.walk(root, &path, found)?;
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some("vvt") {
                found.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpecSource for DirectoryScanner {
    async fn discover(&self, root: &Path) -> Result<Vec<TestSpec>, ScanError> {
        let root = root
            .canonicalize()
            .unwrap_or_else(|_| root.to_path_buf());

        let mut files = Vec::new();
        self.walk(&root, &root, &mut files)?;

        let mut specs = Vec::new();
        for path in files {
            let rel = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            match parse_test_file(&root, &rel) {
                Ok(mut file_specs) => specs.append(&mut file_specs),
                Err(e) => {
                    // one bad source file never sinks the scan
                    warn!("skipping file {}: {}", path.display(), e);
                }
            }
        }
        Ok(specs)
    }
}

#[derive(Debug, Default)]
struct Directives {
    keywords: Vec<String>,
    pset: ParameterSet,
    analyze: bool,
    baseline: bool,
    depends: Vec<(String, Option<WordExpression>)>,
    platform_enable: Vec<WordExpression>,
    option_enable: Vec<WordExpression>,
    timeout: Option<u64>,
}

/// Parses one test file into its expanded spec instances.
pub fn parse_test_file(root: &Path, relfile: &Path) -> Result<Vec<TestSpec>, ScanError> {
    let text = std::fs::read_to_string(root.join(relfile))?;
    let name = relfile
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ScanError::BadSource {
            path: relfile.to_path_buf(),
            reason: "no test name in file name".to_string(),
        })?
        .to_string();

    let bad = |reason: String| ScanError::BadSource {
        path: relfile.to_path_buf(),
        reason,
    };

    let mut dir = Directives::default();

    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("#VVT:") else {
            continue;
        };
        let rest = rest.trim();

        let (head, value) = match rest.split_once('=') {
            Some((h, v)) => (h.trim(), v.trim()),
            None => (rest, ""),
        };

        // a directive head may carry one parenthesized attribute
        let (word, attr) = match head.split_once('(') {
            Some((w, a)) => (
                w.trim(),
                Some(a.trim_end_matches(')').trim().to_string()),
            ),
            None => (head, None),
        };

        match word {
            "keywords" => {
                dir.keywords
                    .extend(value.split_whitespace().map(str::to_string));
            }
            "parameterize" => {
                let (names, tuples) = parse_parameterize(value)
                    .ok_or_else(|| bad(format!("bad parameterize directive: {:?}", value)))?;
                let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let tuple_refs: Vec<Vec<&str>> = tuples
                    .iter()
                    .map(|t| t.iter().map(String::as_str).collect())
                    .collect();
                if name_refs.len() == 1 {
                    let vals: Vec<&str> = tuple_refs.iter().map(|t| t[0]).collect();
                    dir.pset.add_parameter(name_refs[0], &vals);
                } else {
                    dir.pset.add_parameter_group(&name_refs, &tuple_refs);
                }
            }
            "analyze" => dir.analyze = true,
            "baseline" => dir.baseline = true,
            "depends" => {
                // "depends on = pattern", attr may carry result="..."
                let expr = match attr.as_deref().and_then(|a| a.strip_prefix("result=")) {
                    Some(quoted) => {
                        let text = quoted.trim_matches('"');
                        Some(
                            WordExpression::parse(text)
                                .map_err(|e| bad(format!("bad result expression: {}", e)))?,
                        )
                    }
                    None => None,
                };
                for pat in value.split_whitespace() {
                    dir.depends.push((pat.to_string(), expr.clone()));
                }
            }
            "timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| bad(format!("bad timeout value: {:?}", value)))?;
                dir.timeout = Some(secs);
            }
            "enable" => {
                let Some(attr) = attr else {
                    return Err(bad("enable directive needs an attribute".to_string()));
                };
                if let Some(expr) = attr.strip_prefix("platforms=") {
                    dir.platform_enable.push(
                        WordExpression::parse(expr.trim_matches('"'))
                            .map_err(|e| bad(format!("bad platform expression: {}", e)))?,
                    );
                } else if let Some(expr) = attr.strip_prefix("options=") {
                    dir.option_enable.push(
                        WordExpression::parse(expr.trim_matches('"'))
                            .map_err(|e| bad(format!("bad option expression: {}", e)))?,
                    );
                } else {
                    return Err(bad(format!("unknown enable attribute: {:?}", attr)));
                }
            }
            _ => {} // unknown directives are tolerated
        }
    }

    Ok(expand_specs(root, relfile, &name, dir))
}

/// `np : 1 4 16` or `nx,ny : 10,20 30,60`.
fn parse_parameterize(value: &str) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let (names_part, values_part) = value.split_once(':')?;
    let names: Vec<String> = names_part
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        return None;
    }

    let mut tuples = Vec::new();
    for tok in values_part.split_whitespace() {
        let tuple: Vec<String> = tok.split(',').map(str::to_string).collect();
        if tuple.len() != names.len() {
            return None;
        }
        tuples.push(tuple);
    }
    if tuples.is_empty() {
        return None;
    }
    Some((names, tuples))
}

fn expand_specs(root: &Path, relfile: &Path, name: &str, dir: Directives) -> Vec<TestSpec> {
    let build_base = |builder: TestSpecBuilder| -> TestSpecBuilder {
        let mut b = builder;
        for kw in &dir.keywords {
            b = b.keyword(kw);
        }
        for (pat, expr) in &dir.depends {
            b = b.depends_on(pat, expr.clone());
        }
        for wx in &dir.platform_enable {
            b = b.enable_platform(wx.clone());
        }
        for wx in &dir.option_enable {
            b = b.enable_option(wx.clone());
        }
        if let Some(t) = dir.timeout {
            b = b.timeout(t);
        }
        if dir.baseline {
            b = b.baseline();
        }
        b
    };

    let mut specs = Vec::new();

    if dir.pset.is_empty() {
        specs.push(build_base(TestSpecBuilder::new(root, relfile, name)).build());
        return specs;
    }

    for inst in dir.pset.instances() {
        specs.push(
            build_base(TestSpecBuilder::new(root, relfile, name))
                .params(inst.clone())
                .build(),
        );
    }

    if dir.analyze {
        specs.push(
            build_base(TestSpecBuilder::new(root, relfile, name))
                .analyze()
                .paramset(dir.pset.clone())
                .build(),
        );
    }

    specs
}

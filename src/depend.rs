//! Dependency resolution between test cases.
//!
//! After permanent filtering, two kinds of edges are wired up: analyze
//! aggregators depend on every parameterized sibling in their group, and
//! declared dependencies are resolved by matching a shell wildcard
//! against the known execute directories. Pattern matching tries four
//! prefixes in priority order and the first tier with any match wins:
//!
//! 1. `dirname(xdir)/pattern`
//! 2. `dirname(xdir)/*/pattern`
//! 3. `pattern`
//! 4. `*pattern`

use std::collections::BTreeSet;

use globset::GlobBuilder;
use tracing::{debug, warn};

use crate::case::{DepTarget, TestDependency};
use crate::groups::ParamAnalyzeGroups;
use crate::list::TestList;

/// Normalizes `.` and `..` components out of a relative path pattern.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match GlobBuilder::new(pattern).build() {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        Err(_) => false,
    }
}

/// Matches a declared dependency pattern against the known execute
/// directories, from the point of view of the dependent at `xdir`.
/// Returns the first non-empty priority tier.
pub fn find_by_exec_dir_match(
    xdir: &str,
    pattern: &str,
    xdir_list: &[String],
) -> BTreeSet<String> {
    let tbase = match xdir.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() && dir != "." => format!("{}/", dir),
        _ => String::new(),
    };

    let tiers = [
        normalize(&format!("{}{}", tbase, pattern)),
        format!("{}*/{}", tbase, pattern),
        pattern.to_string(),
        format!("*{}", pattern),
    ];

    for tier in &tiers {
        let hits: BTreeSet<String> = xdir_list
            .iter()
            .filter(|cand| glob_match(tier, cand))
            .cloned()
            .collect();
        if !hits.is_empty() {
            return hits;
        }
    }

    BTreeSet::new()
}

/// Wires all dependency edges into the registry: analyze edges first,
/// then declared patterns, then a cycle pass that marks any test on a
/// dependency cycle as unbuildable.
pub fn connect_dependencies(tlist: &mut TestList, groups: &ParamAnalyzeGroups) {
    #[derive(Debug)]
    struct PlannedEdge {
        from: String,
        dep: TestDependency,
        depdir: Option<(String, String)>, // (pattern, xdir)
        dependee: Option<String>,
    }

    let all_xdirs = tlist.exec_dirs();
    let mut planned: Vec<PlannedEdge> = Vec::new();

    for case in tlist.active_cases() {
        let xdir = case.exec_dir().to_string();
        let spec = case.spec();

        if spec.is_analyze() {
            for sib_xdir in groups.group(spec) {
                if sib_xdir == &xdir {
                    continue;
                }
                let sib = match tlist.case(sib_xdir) {
                    Some(s) if !s.spec().is_analyze() => s,
                    _ => continue,
                };
                let dep = TestDependency::new(DepTarget::Case(sib_xdir.clone()), None, None);
                let depdir = dep
                    .ran_or_could_run(Some(sib))
                    .then(|| (String::new(), sib_xdir.clone()));
                planned.push(PlannedEdge {
                    from: xdir.clone(),
                    dep,
                    depdir,
                    dependee: Some(sib_xdir.clone()),
                });
            }
        }

        for decl in spec.dependencies() {
            let matches = find_by_exec_dir_match(&xdir, &decl.pattern, &all_xdirs);
            if matches.is_empty() {
                warn!(
                    "test {}: dependency pattern {:?} matched nothing",
                    xdir, decl.pattern
                );
                planned.push(PlannedEdge {
                    from: xdir.clone(),
                    dep: TestDependency::new(
                        DepTarget::Unmatched(decl.pattern.clone()),
                        Some(decl.pattern.clone()),
                        decl.result_expr.clone(),
                    ),
                    depdir: None,
                    dependee: None,
                });
                continue;
            }

            for dep_xdir in matches {
                if dep_xdir == xdir {
                    continue; // never an edge back to self
                }
                let dependee = match tlist.case(&dep_xdir) {
                    Some(d) => d,
                    None => continue,
                };
                let dep = TestDependency::new(
                    DepTarget::Case(dep_xdir.clone()),
                    Some(decl.pattern.clone()),
                    decl.result_expr.clone(),
                );
                let depdir = dep
                    .ran_or_could_run(Some(dependee))
                    .then(|| (decl.pattern.clone(), dep_xdir.clone()));
                planned.push(PlannedEdge {
                    from: xdir.clone(),
                    dep,
                    depdir,
                    dependee: Some(dep_xdir),
                });
            }
        }
    }

    debug!("connecting {} dependency edges", planned.len());

    for edge in planned {
        if let Some(dependee) = &edge.dependee {
            if let Some(dep_case) = tlist.case_mut(dependee) {
                dep_case.set_has_dependent();
            }
        }
        if let Some(case) = tlist.case_mut(&edge.from) {
            if let Some((pat, xd)) = &edge.depdir {
                case.add_dep_directory(pat, xd);
            }
            case.add_dependency(edge.dep);
        }
    }

    mark_dependency_cycles(tlist);
}

/// Detects cycles over the resolved edges and records a construction
/// error on every case participating in one.
fn mark_dependency_cycles(tlist: &mut TestList) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let xdirs = tlist.exec_dirs();
    let mut colors: std::collections::HashMap<String, Color> =
        xdirs.iter().map(|x| (x.clone(), Color::White)).collect();
    let mut cyclic: BTreeSet<String> = BTreeSet::new();

    fn visit(
        xdir: &str,
        tlist: &TestList,
        colors: &mut std::collections::HashMap<String, Color>,
        stack: &mut Vec<String>,
        cyclic: &mut BTreeSet<String>,
    ) {
        colors.insert(xdir.to_string(), Color::Gray);
        stack.push(xdir.to_string());

        if let Some(case) = tlist.case(xdir) {
            for dep in case.dependencies() {
                if let DepTarget::Case(next) = dep.target() {
                    match colors.get(next.as_str()).copied() {
                        Some(Color::White) => visit(next, tlist, colors, stack, cyclic),
                        Some(Color::Gray) => {
                            // everything from `next` to the stack top is on the cycle
                            if let Some(start) = stack.iter().position(|s| s == next) {
                                cyclic.extend(stack[start..].iter().cloned());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        stack.pop();
        colors.insert(xdir.to_string(), Color::Black);
    }

    for xdir in &xdirs {
        if colors.get(xdir.as_str()) == Some(&Color::White) {
            let mut stack = Vec::new();
            visit(xdir, tlist, &mut colors, &mut stack, &mut cyclic);
        }
    }

    for xdir in cyclic {
        warn!("test {} participates in a dependency cycle", xdir);
        if let Some(case) = tlist.case_mut(&xdir) {
            case.set_construction_error("dependency cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpecBuilder;

    fn xdirs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn priority_one_beats_deeper_matches() {
        let known = xdirs(&["alpha/beta", "alpha/gamma/beta"]);
        let hits = find_by_exec_dir_match("alpha/x", "beta", &known);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains("alpha/beta"));
    }

    #[test]
    fn lower_tiers_fire_when_sibling_dir_is_empty() {
        let known = xdirs(&["other/beta"]);
        // no sibling match, no */ match under alpha, no bare match; *pat wins
        let hits = find_by_exec_dir_match("alpha/x", "beta", &known);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains("other/beta"));
    }

    #[test]
    fn wildcards_expand_within_a_tier() {
        let known = xdirs(&["run/t.np=1", "run/t.np=2", "run/u.np=1"]);
        let hits = find_by_exec_dir_match("run/a", "t.np=*", &known);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn root_level_tests_skip_the_dir_prefix() {
        let known = xdirs(&["setup", "sub/setup"]);
        let hits = find_by_exec_dir_match("check", "setup", &known);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains("setup"));
    }

    fn list_of(specs: Vec<crate::spec::TestSpec>) -> TestList {
        let mut tlist = TestList::new(None);
        for s in specs {
            tlist.add_spec(s, None);
        }
        tlist.recount_active();
        tlist
    }

    #[test]
    fn analyze_edges_connect_to_all_siblings() {
        let mut specs = Vec::new();
        for p in ["1", "2", "3"] {
            specs.push(
                TestSpecBuilder::new("/s", "g/t.vvt", "t").param("p", p).build(),
            );
        }
        specs.push(TestSpecBuilder::new("/s", "g/t.vvt", "t").analyze().build());
        let mut tlist = list_of(specs);

        let mut groups = ParamAnalyzeGroups::new();
        groups.rebuild(&tlist);
        connect_dependencies(&mut tlist, &groups);

        let analyze = tlist.case("g/t").unwrap();
        assert_eq!(analyze.num_dependencies(), 3);
        for p in ["1", "2", "3"] {
            let sib = tlist.case(&format!("g/t.p={}", p)).unwrap();
            assert!(sib.has_dependent());
        }
    }

    #[test]
    fn unmatched_pattern_is_a_deferred_failure() {
        let specs = vec![TestSpecBuilder::new("/s", "a/t.vvt", "t")
            .depends_on("nothing*", None)
            .build()];
        let mut tlist = list_of(specs);
        let groups = ParamAnalyzeGroups::new();
        connect_dependencies(&mut tlist, &groups);

        let case = tlist.case("a/t").unwrap();
        assert_eq!(case.num_dependencies(), 1);
        assert!(tlist.will_never_run(case));
    }

    #[test]
    fn cycles_are_marked_fatal() {
        let specs = vec![
            TestSpecBuilder::new("/s", "c/a.vvt", "a").depends_on("b", None).build(),
            TestSpecBuilder::new("/s", "c/b.vvt", "b").depends_on("a", None).build(),
            TestSpecBuilder::new("/s", "c/solo.vvt", "solo").build(),
        ];
        let mut tlist = list_of(specs);
        let groups = ParamAnalyzeGroups::new();
        connect_dependencies(&mut tlist, &groups);

        assert!(tlist.case("c/a").unwrap().construction_error().is_some());
        assert!(tlist.case("c/b").unwrap().construction_error().is_some());
        assert!(tlist.case("c/solo").unwrap().construction_error().is_none());

        let a = tlist.case("c/a").unwrap();
        assert!(tlist.will_never_run(a));
    }

    #[test]
    fn no_self_edges() {
        let specs = vec![TestSpecBuilder::new("/s", "d/t.vvt", "t")
            .depends_on("t*", None)
            .build()];
        let mut tlist = list_of(specs);
        let groups = ParamAnalyzeGroups::new();
        connect_dependencies(&mut tlist, &groups);

        // the only match was the test itself, so no edge is created
        let case = tlist.case("d/t").unwrap();
        assert_eq!(case.num_dependencies(), 0);
    }
}

//! Parameterize/analyze grouping.
//!
//! All instances expanded from the same source file and test name form a
//! group; at most one member is the analyze aggregator, the others its
//! parameterized siblings. The map is rebuilt whenever the filter set
//! changes, and tests excluded by parameter are left out so the analyze
//! bookkeeping never sees them.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::list::TestList;
use crate::spec::TestSpec;

type GroupKey = (PathBuf, String);

/// Map from (source path, test name) to the group's execute directories.
#[derive(Debug, Default)]
pub struct ParamAnalyzeGroups {
    map: HashMap<GroupKey, Vec<String>>,
}

impl ParamAnalyzeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(spec: &TestSpec) -> GroupKey {
        (spec.filepath().to_path_buf(), spec.name().to_string())
    }

    /// Rebuilds the map from the registry, dropping tests skipped by
    /// parameter.
    pub fn rebuild(&mut self, tlist: &TestList) {
        self.map.clear();
        for case in tlist.cases() {
            if case.status().skipped_by_parameter() {
                continue;
            }
            self.map
                .entry(Self::key(case.spec()))
                .or_default()
                .push(case.exec_dir().to_string());
        }
        for members in self.map.values_mut() {
            members.sort();
        }
    }

    /// Execute directories of the group this spec belongs to.
    pub fn group(&self, spec: &TestSpec) -> &[String] {
        self.map
            .get(&Self::key(spec))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The analyze member's execute directory in `spec`'s group, excluding
    /// `spec` itself. `None` when the group has no (other) analyze test.
    pub fn analyze_exec_dir(&self, spec: &TestSpec, tlist: &TestList) -> Option<String> {
        for xdir in self.group(spec) {
            if xdir == spec.exec_dir() {
                continue;
            }
            if let Some(case) = tlist.case(xdir) {
                if case.spec().is_analyze() {
                    return Some(xdir.clone());
                }
            }
        }
        None
    }

    /// Iterates over `(key, members)` for every group.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &Vec<String>)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::TestList;
    use crate::spec::TestSpecBuilder;
    use crate::status::SkipReason;

    fn build_list() -> TestList {
        let mut tlist = TestList::new(None);
        for p in ["1", "2"] {
            let spec = TestSpecBuilder::new("/src", "sub/t.vvt", "t")
                .param("p", p)
                .build();
            tlist.add_spec(spec, None);
        }
        let analyze = TestSpecBuilder::new("/src", "sub/t.vvt", "t").analyze().build();
        tlist.add_spec(analyze, None);

        let other = TestSpecBuilder::new("/src", "sub/u.vvt", "u").build();
        tlist.add_spec(other, None);
        tlist
    }

    #[test]
    fn groups_cluster_by_file_and_name() {
        let tlist = build_list();
        let mut groups = ParamAnalyzeGroups::new();
        groups.rebuild(&tlist);

        assert_eq!(groups.len(), 2);
        let spec = tlist.case("sub/t.p=1").unwrap().spec();
        assert_eq!(groups.group(spec).len(), 3);
    }

    #[test]
    fn analyze_member_is_located() {
        let tlist = build_list();
        let mut groups = ParamAnalyzeGroups::new();
        groups.rebuild(&tlist);

        let sibling = tlist.case("sub/t.p=2").unwrap().spec();
        assert_eq!(
            groups.analyze_exec_dir(sibling, &tlist),
            Some("sub/t".to_string())
        );

        // the analyze test itself has no *other* analyze member
        let analyze = tlist.case("sub/t").unwrap().spec();
        assert_eq!(groups.analyze_exec_dir(analyze, &tlist), None);
    }

    #[test]
    fn parameter_skipped_members_drop_out() {
        let mut tlist = build_list();
        tlist
            .case_mut("sub/t.p=2")
            .unwrap()
            .status_mut()
            .mark_skip(SkipReason::Parameter);

        let mut groups = ParamAnalyzeGroups::new();
        groups.rebuild(&tlist);

        let spec = tlist.case("sub/t.p=1").unwrap().spec();
        assert_eq!(groups.group(spec), &["sub/t".to_string(), "sub/t.p=1".to_string()]);
    }
}

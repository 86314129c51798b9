//! The ready-queue of tests awaiting resources.
//!
//! The backlog keeps one entry per ready test, sorted descending by
//! `(np, runtime)` for pool execution or `(np, timeout)` for batch
//! packing. Popping scans from the first entry that fits the processor
//! cap (found by bisection over the descending `np` order) and returns
//! the first test that also clears the device cap and has no blocking
//! dependency, so long-running wide tests launch first and dependency
//! state is consulted at the moment of the pop.

use crate::list::TestList;

/// Sort key selection for [`TestBacklog::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Descending `(np, runtime-estimate)`; pool execution.
    Runtime,
    /// Descending `(np, timeout)`; batch packing.
    Timeout,
}

/// One ready test with the figures the sort and constraints need.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub exec_dir: String,
    pub np: u32,
    pub nd: u32,
    pub runtime: i64,
    pub timeout: i64,
}

/// Resource caps applied at pop time. `None` caps nothing; the blocking
/// dependency check always applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestConstraint {
    pub max_np: Option<u32>,
    pub max_nd: Option<u32>,
}

impl TestConstraint {
    pub fn free(max_np: u32, max_nd: u32) -> Self {
        Self {
            max_np: Some(max_np),
            max_nd: Some(max_nd),
        }
    }

    /// Unconstrained by size; used for idle promotion.
    pub fn unconstrained() -> Self {
        Self::default()
    }

    fn accepts(&self, entry: &BacklogEntry, tlist: &TestList) -> bool {
        if let Some(maxnp) = self.max_np {
            if entry.np.max(1) > maxnp {
                return false;
            }
        }
        if let Some(maxnd) = self.max_nd {
            if entry.nd > maxnd {
                return false;
            }
        }
        match tlist.case(&entry.exec_dir) {
            Some(case) => !tlist.is_blocked(case),
            None => false,
        }
    }
}

/// Ordered sequence of ready tests.
#[derive(Debug, Default)]
pub struct TestBacklog {
    entries: Vec<BacklogEntry>,
}

impl TestBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: BacklogEntry) {
        self.entries.push(entry);
    }

    /// Stable sort, descending over `(np, <mode key>)`; ties preserve
    /// insertion order.
    pub fn sort(&mut self, mode: SortMode) {
        match mode {
            SortMode::Runtime => self
                .entries
                .sort_by(|a, b| (b.np, b.runtime).cmp(&(a.np, a.runtime))),
            SortMode::Timeout => self
                .entries
                .sort_by(|a, b| (b.np, b.timeout).cmp(&(a.np, a.timeout))),
        }
    }

    /// Removes and returns the first entry satisfying the constraint, or
    /// `None` when nothing currently qualifies.
    pub fn pop(&mut self, constraint: Option<&TestConstraint>, tlist: &TestList) -> Option<BacklogEntry> {
        let start = match constraint.and_then(|c| c.max_np) {
            Some(maxnp) => self.entries.partition_point(|e| e.np.max(1) > maxnp),
            None => 0,
        };

        let mut idx = start;
        while idx < self.entries.len() {
            let qualifies = match constraint {
                Some(c) => c.accepts(&self.entries[idx], tlist),
                None => true,
            };
            if qualifies {
                return Some(self.entries.remove(idx));
            }
            idx += 1;
        }
        None
    }

    /// Drains the backlog front to back.
    pub fn consume(&mut self) -> Vec<BacklogEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Non-destructive traversal in current order.
    pub fn iterate(&self) -> impl Iterator<Item = &BacklogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpecBuilder;

    fn entry(xdir: &str, np: u32, runtime: i64, timeout: i64) -> BacklogEntry {
        BacklogEntry {
            exec_dir: xdir.to_string(),
            np,
            nd: 0,
            runtime,
            timeout,
        }
    }

    fn list_with(xdirs: &[(&str, &str)]) -> TestList {
        let mut tlist = TestList::new(None);
        for (name, np) in xdirs {
            let spec = TestSpecBuilder::new("/s", format!("q/{}.vvt", name), *name)
                .param("np", np)
                .build();
            tlist.add_spec(spec, None);
        }
        tlist
    }

    #[test]
    fn sorts_descending_by_np_then_runtime() {
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=2", 2, 100, 0));
        backlog.insert(entry("q/b.np=4", 4, 10, 0));
        backlog.insert(entry("q/c.np=4", 4, 50, 0));
        backlog.sort(SortMode::Runtime);

        let order: Vec<&str> = backlog.iterate().map(|e| e.exec_dir.as_str()).collect();
        assert_eq!(order, ["q/c.np=4", "q/b.np=4", "q/a.np=2"]);
    }

    #[test]
    fn timeout_mode_uses_timeout_key() {
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=2", 2, 0, 60));
        backlog.insert(entry("q/b.np=2", 2, 0, 600));
        backlog.sort(SortMode::Timeout);

        let order: Vec<&str> = backlog.iterate().map(|e| e.exec_dir.as_str()).collect();
        assert_eq!(order, ["q/b.np=2", "q/a.np=2"]);
    }

    #[test]
    fn stable_sort_preserves_insertion_order_on_ties() {
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/first", 2, 30, 0));
        backlog.insert(entry("q/second", 2, 30, 0));
        backlog.sort(SortMode::Runtime);

        let order: Vec<&str> = backlog.iterate().map(|e| e.exec_dir.as_str()).collect();
        assert_eq!(order, ["q/first", "q/second"]);
    }

    #[test]
    fn pop_skips_oversize_entries() {
        let tlist = list_with(&[("a", "8"), ("b", "4"), ("c", "2")]);
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=8", 8, 5, 0));
        backlog.insert(entry("q/b.np=4", 4, 10, 0));
        backlog.insert(entry("q/c.np=2", 2, 100, 0));
        backlog.sort(SortMode::Runtime);

        let c = TestConstraint::free(4, 0);
        let popped = backlog.pop(Some(&c), &tlist).unwrap();
        assert_eq!(popped.exec_dir, "q/b.np=4");
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn zero_cap_pops_nothing() {
        let tlist = list_with(&[("a", "1")]);
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=1", 1, 5, 0));

        let c = TestConstraint::free(0, 0);
        assert!(backlog.pop(Some(&c), &tlist).is_none());
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn unconstrained_pop_ignores_size() {
        let tlist = list_with(&[("a", "8")]);
        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=8", 8, 5, 0));

        let c = TestConstraint::unconstrained();
        let popped = backlog.pop(Some(&c), &tlist).unwrap();
        assert_eq!(popped.exec_dir, "q/a.np=8");
    }

    #[test]
    fn blocked_entries_are_passed_over() {
        use crate::case::{DepTarget, TestDependency};

        let mut tlist = list_with(&[("a", "2"), ("b", "2")]);
        tlist.case_mut("q/a.np=2").unwrap().add_dependency(TestDependency::new(
            DepTarget::Case("q/b.np=2".into()),
            None,
            None,
        ));

        let mut backlog = TestBacklog::new();
        backlog.insert(entry("q/a.np=2", 2, 100, 0));
        backlog.insert(entry("q/b.np=2", 2, 10, 0));
        backlog.sort(SortMode::Runtime);

        // a sorts first but is blocked on b
        let c = TestConstraint::free(4, 0);
        let popped = backlog.pop(Some(&c), &tlist).unwrap();
        assert_eq!(popped.exec_dir, "q/b.np=2");
    }

    #[test]
    fn device_cap_applies() {
        let tlist = list_with(&[("a", "1")]);
        let mut backlog = TestBacklog::new();
        let mut e = entry("q/a.np=1", 1, 5, 0);
        e.nd = 2;
        backlog.insert(e);

        assert!(backlog.pop(Some(&TestConstraint::free(4, 1)), &tlist).is_none());
        assert!(backlog.pop(Some(&TestConstraint::free(4, 2)), &tlist).is_some());
    }
}

//! Execution-list state tracking.
//!
//! A [`TestExecList`] owns the [`backlog`] of ready tests plus the three
//! state sets a test migrates through once popped: `waiting` (popped,
//! not yet launched), `started` (holding resources), and `stopped`
//! (finished). At every instant
//! `backlog + waiting + started + stopped` covers exactly the active
//! tests handed to [`TestExecList::generate_backlog`].

pub mod backlog;
pub mod pool;

use std::collections::BTreeSet;

use crate::list::TestList;

use self::backlog::{BacklogEntry, SortMode, TestBacklog, TestConstraint};

/// Default per-test timeout when a spec declares none, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Ready-queue plus execution state sets.
#[derive(Debug, Default)]
pub struct TestExecList {
    backlog: TestBacklog,
    waiting: BTreeSet<String>,
    started: BTreeSet<String>,
    stopped: BTreeSet<String>,
}

impl TestExecList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the backlog from the active tests and sorts it for pool
    /// execution (descending `(np, runtime)`).
    pub fn generate_backlog(&mut self, tlist: &TestList, default_timeout_secs: u64) {
        for case in tlist.active_cases() {
            let (np, nd) = case.size();
            self.backlog.insert(BacklogEntry {
                exec_dir: case.exec_dir().to_string(),
                np,
                nd,
                runtime: case.status().runtime_estimate(0),
                timeout: case
                    .spec()
                    .timeout()
                    .unwrap_or(default_timeout_secs) as i64,
            });
        }
        self.backlog.sort(SortMode::Runtime);
    }

    /// Re-sorts the backlog for batch packing (descending
    /// `(np, timeout)`).
    pub fn sort_by_size_and_timeout(&mut self) {
        self.backlog.sort(SortMode::Timeout);
    }

    pub fn backlog_mut(&mut self) -> &mut TestBacklog {
        &mut self.backlog
    }

    /// Finds the next test to launch under the current free sizes.
    ///
    /// When nothing fits and nothing is running, the size constraint is
    /// dropped so an oversize test can be promoted rather than starving.
    /// Returns `None` when no test can run right now; with
    /// `num_running() == 0` that means the remaining tests are blocked
    /// for good.
    pub fn pop_next(&mut self, tlist: &TestList, free: (u32, u32)) -> Option<BacklogEntry> {
        let constraint = TestConstraint::free(free.0, free.1);
        let entry = match self.backlog.pop(Some(&constraint), tlist) {
            Some(e) => Some(e),
            None if self.started.is_empty() => self
                .backlog
                .pop(Some(&TestConstraint::unconstrained()), tlist),
            None => None,
        };

        if let Some(e) = &entry {
            self.waiting.insert(e.exec_dir.clone());
        }
        entry
    }

    /// Drains the whole backlog into `waiting`; the batch packer's entry
    /// point.
    pub fn consume_backlog(&mut self) -> Vec<BacklogEntry> {
        let entries = self.backlog.consume();
        for e in &entries {
            self.waiting.insert(e.exec_dir.clone());
        }
        entries
    }

    /// Everything left in the backlog, abandoned without running.
    pub fn pop_remaining(&mut self) -> Vec<BacklogEntry> {
        self.backlog.consume()
    }

    pub fn mark_started(&mut self, exec_dir: &str) {
        self.waiting.remove(exec_dir);
        self.started.insert(exec_dir.to_string());
    }

    pub fn mark_stopped(&mut self, exec_dir: &str) {
        self.waiting.remove(exec_dir);
        self.started.remove(exec_dir);
        self.stopped.insert(exec_dir.to_string());
    }

    pub fn running(&self) -> impl Iterator<Item = &String> {
        self.started.iter()
    }

    pub fn num_running(&self) -> usize {
        self.started.len()
    }

    pub fn num_done(&self) -> usize {
        self.stopped.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// `backlog + waiting + started + stopped`; equals the active count
    /// for the life of a run.
    pub fn total_tracked(&self) -> usize {
        self.backlog.len() + self.waiting.len() + self.started.len() + self.stopped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpecBuilder;
    use crate::status::SkipReason;

    fn listing(entries: &[(&str, &str, i64)]) -> TestList {
        let mut tlist = TestList::new(None);
        for (name, np, rt) in entries {
            let spec = TestSpecBuilder::new("/s", format!("p/{}.vvt", name), *name)
                .param("np", np)
                .build();
            let xdir = spec.exec_dir().to_string();
            tlist.add_spec(spec, None);
            tlist
                .case_mut(&xdir)
                .unwrap()
                .status_mut()
                .set_runtime_estimate(*rt);
        }
        tlist.recount_active();
        tlist
    }

    #[test]
    fn backlog_excludes_skipped_tests() {
        let mut tlist = listing(&[("a", "1", 5), ("b", "1", 5)]);
        tlist
            .case_mut("p/a.np=1")
            .unwrap()
            .status_mut()
            .mark_skip(SkipReason::Keyword);
        tlist.recount_active();

        let mut xlist = TestExecList::new();
        xlist.generate_backlog(&tlist, DEFAULT_TIMEOUT_SECS);
        assert_eq!(xlist.backlog_len(), 1);
        assert_eq!(xlist.total_tracked(), tlist.num_active());
    }

    #[test]
    fn accounting_invariant_through_state_moves() {
        let tlist = listing(&[("a", "2", 10), ("b", "1", 20), ("c", "1", 5)]);
        let mut xlist = TestExecList::new();
        xlist.generate_backlog(&tlist, DEFAULT_TIMEOUT_SECS);

        let active = tlist.num_active();
        assert_eq!(xlist.total_tracked(), active);

        let e = xlist.pop_next(&tlist, (4, 0)).unwrap();
        assert_eq!(xlist.total_tracked(), active);

        xlist.mark_started(&e.exec_dir);
        assert_eq!(xlist.num_running(), 1);
        assert_eq!(xlist.total_tracked(), active);

        xlist.mark_stopped(&e.exec_dir);
        assert_eq!(xlist.num_done(), 1);
        assert_eq!(xlist.total_tracked(), active);
    }

    #[test]
    fn longest_first_with_idle_promotion() {
        let tlist = listing(&[("w", "4", 10), ("x", "2", 100), ("y", "8", 5)]);
        let mut xlist = TestExecList::new();
        xlist.generate_backlog(&tlist, DEFAULT_TIMEOUT_SECS);

        // platform of four processors: the np=8 test is skipped over
        let first = xlist.pop_next(&tlist, (4, 0)).unwrap();
        assert_eq!(first.exec_dir, "p/w.np=4");
        xlist.mark_started(&first.exec_dir);

        // nothing fits in zero free procs while w runs
        assert!(xlist.pop_next(&tlist, (0, 0)).is_none());

        xlist.mark_stopped(&first.exec_dir);
        let second = xlist.pop_next(&tlist, (4, 0)).unwrap();
        assert_eq!(second.exec_dir, "p/x.np=2");
        xlist.mark_started(&second.exec_dir);

        // with x still running the oversize test stays parked
        assert!(xlist.pop_next(&tlist, (2, 0)).is_none());

        // once the system drains, promotion fires
        xlist.mark_stopped(&second.exec_dir);
        let third = xlist.pop_next(&tlist, (4, 0)).unwrap();
        assert_eq!(third.exec_dir, "p/y.np=8");
    }
}

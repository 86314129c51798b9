//! Parameter-set expansion for parameterized tests.
//!
//! A test source can declare parameter axes either singly
//! (`np = 1, 4, 16`) or as a group whose value tuples are taken atomically
//! (`nx,ny = (10,20), (30,60)`). The instances of a [`ParameterSet`] are
//! the cartesian product across axes; within a group no product is taken.

use std::collections::BTreeMap;

/// One concrete parameter binding: parameter name to value.
pub type ParamMap = BTreeMap<String, String>;

/// An ordered collection of parameter axes and their expanded instances.
///
/// Groups are remembered in insertion order, which fixes the instance
/// order: each new group extends every existing instance with each of its
/// value tuples in turn.
///
/// # Example
///
/// ```
/// use gantry::params::ParameterSet;
///
/// let mut pset = ParameterSet::new();
/// pset.add_parameter("A", &["a1", "a2"]);
/// pset.add_parameter_group(&["B", "C"], &[vec!["b1", "c1"], vec!["b2", "c2"]]);
/// assert_eq!(pset.instances().len(), 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    groups: Vec<(Vec<String>, Vec<Vec<String>>)>,
    instances: Vec<ParamMap>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single-name axis; shorthand for a group of singleton tuples.
    pub fn add_parameter(&mut self, name: &str, values: &[&str]) {
        let tuples: Vec<Vec<String>> = values.iter().map(|v| vec![v.to_string()]).collect();
        self.push_group(vec![name.to_string()], tuples);
    }

    /// Adds a grouped axis. Each tuple in `value_tuples` must have one
    /// value per name; the tuple is bound positionally and atomically.
    ///
    /// # Panics
    ///
    /// Panics if a tuple length does not match the name count.
    pub fn add_parameter_group(&mut self, names: &[&str], value_tuples: &[Vec<&str>]) {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let tuples: Vec<Vec<String>> = value_tuples
            .iter()
            .map(|t| {
                assert_eq!(t.len(), names.len(), "value tuple length must match names");
                t.iter().map(|v| v.to_string()).collect()
            })
            .collect();
        self.push_group(names, tuples);
    }

    fn push_group(&mut self, names: Vec<String>, tuples: Vec<Vec<String>>) {
        let seed = if self.groups.is_empty() {
            vec![ParamMap::new()]
        } else {
            std::mem::take(&mut self.instances)
        };

        self.instances = accumulate_group(&seed, &names, &tuples);
        self.groups.push((names, tuples));
    }

    /// Keeps only the instances accepted by `keep`.
    ///
    /// The instance list is reconstructed from the original groups before
    /// filtering, so successive filters never compound: each call filters
    /// the full expansion.
    pub fn apply_param_filter<F>(&mut self, keep: F)
    where
        F: Fn(&ParamMap) -> bool,
    {
        self.reconstruct();
        self.instances.retain(|inst| keep(inst));
    }

    /// The expanded instances, in group-insertion order.
    pub fn instances(&self) -> &[ParamMap] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn reconstruct(&mut self) {
        let groups = std::mem::take(&mut self.groups);
        self.instances.clear();
        for (names, tuples) in groups {
            self.push_group(names, tuples);
        }
    }
}

/// Extends each map in `seed` with each value tuple of the new group.
///
/// The outer loop runs over existing instances, the inner over the new
/// group's value tuples, which yields the lexicographic order induced by
/// group-insertion order (earlier groups vary slowest).
fn accumulate_group(seed: &[ParamMap], names: &[String], tuples: &[Vec<String>]) -> Vec<ParamMap> {
    let mut out = Vec::with_capacity(seed.len() * tuples.len());
    for inst in seed {
        for values in tuples {
            let mut next = inst.clone();
            for (name, value) in names.iter().zip(values) {
                next.insert(name.clone(), value.clone());
            }
            out.push(next);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(pairs: &[(&str, &str)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn two_axis_cartesian_order() {
        let mut pset = ParameterSet::new();
        pset.add_parameter("A", &["a1", "a2"]);
        pset.add_parameter_group(&["B", "C"], &[vec!["b1", "c1"], vec!["b2", "c2"]]);

        let expected = vec![
            inst(&[("A", "a1"), ("B", "b1"), ("C", "c1")]),
            inst(&[("A", "a1"), ("B", "b2"), ("C", "c2")]),
            inst(&[("A", "a2"), ("B", "b1"), ("C", "c1")]),
            inst(&[("A", "a2"), ("B", "b2"), ("C", "c2")]),
        ];
        assert_eq!(pset.instances(), &expected[..]);
    }

    #[test]
    fn group_tuples_are_not_crossed() {
        let mut pset = ParameterSet::new();
        pset.add_parameter_group(&["X", "Y"], &[vec!["1", "10"], vec!["2", "20"]]);

        assert_eq!(pset.instances().len(), 2);
        for m in pset.instances() {
            let x: u32 = m["X"].parse().unwrap();
            let y: u32 = m["Y"].parse().unwrap();
            assert_eq!(y, 10 * x);
        }
    }

    #[test]
    fn expansion_is_associative_across_groups() {
        let mut full = ParameterSet::new();
        full.add_parameter("A", &["a1", "a2"]);
        full.add_parameter("B", &["b1"]);
        full.add_parameter("C", &["c1", "c2"]);

        let mut tail = ParameterSet::new();
        tail.add_parameter("B", &["b1"]);
        tail.add_parameter("C", &["c1", "c2"]);

        // expand([A, B, C]) == expand([A]) x expand([B, C])
        let mut crossed: Vec<ParamMap> = Vec::new();
        for t in tail.instances() {
            for a in ["a1", "a2"] {
                let mut m = t.clone();
                m.insert("A".into(), a.into());
                crossed.push(m);
            }
        }
        let mut lhs: Vec<ParamMap> = full.instances().to_vec();
        lhs.sort();
        crossed.sort();
        assert_eq!(lhs, crossed);
    }

    #[test]
    fn filter_replays_from_original_groups() {
        let mut pset = ParameterSet::new();
        pset.add_parameter("p", &["1", "2", "3"]);

        pset.apply_param_filter(|m| m["p"] != "2");
        assert_eq!(pset.instances().len(), 2);

        // a second, looser filter sees the full expansion again
        pset.apply_param_filter(|_| true);
        assert_eq!(pset.instances().len(), 3);
    }
}

use serde::{Deserialize, Serialize};

use crate::error::FlowspecError;
use crate::labeling::{HierarchyLabeling, LabelId, Labeling, Spec};

mod join;

/// One element of a path regex: a hierarchical label, optionally repeated
/// one-or-more times (`label+`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HRegexElement {
    pub label: LabelId,
    pub multiple: bool,
}

/// A sequence of hierarchical labels with optional `+` repetition markers,
/// interpreted as a regular language over label atoms.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HRegex {
    elements: Vec<HRegexElement>,
}

impl HRegex {
    pub fn new(elements: Vec<HRegexElement>) -> Self {
        Self { elements }
    }

    /// Builds a regex from path tokens, resolving each label name in the
    /// hierarchy. A trailing `+` marks a repetition element.
    pub fn parse(tokens: &[&str], hierarchy: &HierarchyLabeling) -> Result<Self, FlowspecError> {
        let mut elements = Vec::with_capacity(tokens.len());
        for token in tokens {
            let (name, multiple) = match token.strip_suffix('+') {
                Some(name) => (name, true),
                None => (*token, false),
            };
            let label = hierarchy.label(name).ok_or_else(|| FlowspecError::UnknownLabel {
                label: name.to_string(),
                line: 0,
            })?;
            elements.push(HRegexElement { label, multiple });
        }
        Ok(Self { elements })
    }

    pub fn elements(&self) -> &[HRegexElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// The lattice of path regexes over a label hierarchy.
///
/// `join` runs a best-first search for the least-cost regex matching both
/// inputs; costs multiply along the sequence and the final cost is normalized
/// to `dimension` positions, so regexes of different lengths stay comparable.
pub struct HRegexLabeling {
    hierarchy: HierarchyLabeling,
    dimension: f64,
}

impl HRegexLabeling {
    pub fn new(hierarchy: HierarchyLabeling, dimension: f64) -> Self {
        Self { hierarchy, dimension }
    }

    pub fn hierarchy(&self) -> &HierarchyLabeling {
        &self.hierarchy
    }
}

impl Labeling for HRegexLabeling {
    type Value = HRegex;

    fn join(&self, a: &HRegex, b: &HRegex) -> Spec<HRegex> {
        join::least_general(&self.hierarchy, self.dimension, a, b)
    }

    /// Containment-based approximation: regex languages that overlap without
    /// one containing the other are treated as disjoint. Exact regex
    /// intersection is never needed by the callers (the index descends a
    /// little too shallowly at worst).
    fn meet(&self, a: &HRegex, b: &HRegex) -> Option<Spec<HRegex>> {
        if self.subset(a, b) {
            Some(Spec::new(self.cost(a), a.clone()))
        } else if self.subset(b, a) {
            Some(Spec::new(self.cost(b), b.clone()))
        } else {
            None
        }
    }

    /// Product of the element label costs, normalized to `dimension`
    /// positions so that `cost(v) == join(v, v).cost`.
    fn cost(&self, v: &HRegex) -> f64 {
        let product: f64 = v
            .elements
            .iter()
            .map(|e| self.hierarchy.label_cost(e.label))
            .product();
        product.powf(self.dimension / v.len() as f64)
    }

    fn top(&self) -> HRegex {
        HRegex::new(vec![HRegexElement {
            label: self.hierarchy.root(),
            multiple: true,
        }])
    }

    fn render(&self, v: &HRegex) -> String {
        let parts: Vec<String> = v
            .elements
            .iter()
            .map(|e| {
                let mut s = self.hierarchy.name(e.label).to_string();
                if e.multiple {
                    s.push('+');
                }
                s
            })
            .collect();
        format!("({})", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_hierarchy() -> HierarchyLabeling {
        HierarchyLabeling::from_json(
            r#"{
                "s1": {"cost": 1, "parents": ["Server"]},
                "s2": {"cost": 1, "parents": ["Server"]},
                "u1": {"cost": 1, "parents": ["User"]},
                "u2": {"cost": 1, "parents": ["User"]},
                "Server": {"cost": 2, "parents": ["Any"]},
                "User": {"cost": 2, "parents": ["Any"]},
                "Any": {"cost": 4, "parents": []}
            }"#,
        )
        .unwrap()
    }

    fn labeling() -> HRegexLabeling {
        // flows in these tests are two hops long
        HRegexLabeling::new(device_hierarchy(), 2.0)
    }

    fn path(l: &HRegexLabeling, tokens: &[&str]) -> HRegex {
        HRegex::parse(tokens, l.hierarchy()).unwrap()
    }

    fn assert_join(l: &HRegexLabeling, a: &[&str], b: &[&str], cost: f64, expected: &[&str]) {
        let spec = l.join(&path(l, a), &path(l, b));
        assert_eq!(spec.value, path(l, expected), "join value of {a:?} and {b:?}");
        assert!(
            (spec.cost - cost).abs() < 1e-9,
            "join cost of {a:?} and {b:?}: {} != {}",
            spec.cost,
            cost
        );
    }

    #[test]
    fn join_generalizes_one_position_at_a_time() {
        let l = labeling();
        assert_join(&l, &["u1", "s1"], &["u1", "s2"], 2.0, &["u1", "Server"]);
        assert_join(&l, &["u1", "s1"], &["u2", "s1"], 2.0, &["User", "s1"]);
        assert_join(&l, &["u1", "s1"], &["u2", "s2"], 4.0, &["User", "Server"]);
    }

    #[test]
    fn join_carries_input_repetitions() {
        let l = labeling();
        assert_join(&l, &["u1", "s1"], &["u1", "s2+"], 2.0, &["u1", "Server+"]);
    }

    #[test]
    fn join_of_swapped_paths_collapses_to_a_repetition() {
        let l = labeling();
        assert_join(&l, &["u1", "s1"], &["s1", "u1"], 16.0, &["Any+"]);
    }

    #[test]
    fn join_of_a_path_with_itself_is_the_path() {
        let l = labeling();
        assert_join(&l, &["s1", "u1"], &["s1", "u1"], 1.0, &["s1", "u1"]);
    }

    #[test]
    fn everything_sits_below_top() {
        let l = labeling();
        let top = l.top();
        for p in [&["u1", "s1"][..], &["s1", "u1"], &["u2", "s2+"]] {
            assert!(l.subset(&path(&l, p), &top));
        }
        assert_eq!(l.render(&top), "(Any+)");
    }

    #[test]
    fn subset_follows_positionwise_generalization() {
        let l = labeling();
        assert!(l.subset(&path(&l, &["u1", "s1"]), &path(&l, &["u1", "Server"])));
        assert!(l.subset(&path(&l, &["u1", "s1"]), &path(&l, &["User", "Server"])));
        assert!(!l.subset(&path(&l, &["User", "Server"]), &path(&l, &["u1", "Server"])));
    }

    #[test]
    fn meet_is_containment() {
        let l = labeling();
        let narrow = path(&l, &["u1", "s1"]);
        let wide = path(&l, &["u1", "Server"]);
        let meet = l.meet(&narrow, &wide).unwrap();
        assert_eq!(meet.value, narrow);
        assert_eq!(l.meet(&narrow, &path(&l, &["u2", "s1"])), None);
    }

    #[test]
    fn cost_matches_self_join() {
        let l = labeling();
        for p in [&["u1", "s1"][..], &["Any+"], &["User", "Server"]] {
            let v = path(&l, p);
            let self_join = l.join(&v, &v);
            assert_eq!(self_join.value, v);
            assert!((self_join.cost - l.cost(&v)).abs() < 1e-9);
        }
    }

    #[test]
    fn parse_rejects_unknown_labels() {
        let l = labeling();
        assert!(matches!(
            HRegex::parse(&["u1", "ghost"], l.hierarchy()),
            Err(FlowspecError::UnknownLabel { .. })
        ));
    }
}

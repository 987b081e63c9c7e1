use serde::{Deserialize, Serialize};

use crate::labeling::{Labeling, Spec};

/// A value in a discrete (flat) domain: either a single atom or the
/// universal `⊤`, rendered as `*`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DValue {
    Atom(String),
    Top,
}

impl DValue {
    pub fn atom(s: impl Into<String>) -> Self {
        DValue::Atom(s.into())
    }
}

/// The flat two-level lattice: every atom sits directly below `⊤`.
///
/// Two distinct atoms generalize straight to `⊤`, which carries `top_cost`;
/// an atom joined with itself stays an atom at `atom_cost`.
#[derive(Clone, Debug)]
pub struct DValueLabeling {
    pub top_cost: f64,
    pub atom_cost: f64,
    /// Exact atom count of the domain, when known. `cardinality(⊤)` falls
    /// back to `top_cost` otherwise.
    pub top_cardinality: Option<f64>,
}

impl DValueLabeling {
    pub fn new(top_cost: f64) -> Self {
        Self {
            top_cost,
            atom_cost: 1.0,
            top_cardinality: None,
        }
    }
}

impl Labeling for DValueLabeling {
    type Value = DValue;

    fn join(&self, a: &DValue, b: &DValue) -> Spec<DValue> {
        match (a, b) {
            (DValue::Atom(x), DValue::Atom(y)) if x == y => {
                Spec::new(self.atom_cost, a.clone())
            }
            _ => Spec::new(self.top_cost, DValue::Top),
        }
    }

    fn meet(&self, a: &DValue, b: &DValue) -> Option<Spec<DValue>> {
        match (a, b) {
            (DValue::Top, _) => Some(Spec::new(self.cost(b), b.clone())),
            (_, DValue::Top) => Some(Spec::new(self.cost(a), a.clone())),
            (DValue::Atom(x), DValue::Atom(y)) if x == y => {
                Some(Spec::new(self.atom_cost, a.clone()))
            }
            _ => None,
        }
    }

    fn subset(&self, a: &DValue, b: &DValue) -> bool {
        *b == DValue::Top || a == b
    }

    fn cost(&self, v: &DValue) -> f64 {
        match v {
            DValue::Top => self.top_cost,
            DValue::Atom(_) => self.atom_cost,
        }
    }

    fn cardinality(&self, v: &DValue) -> f64 {
        match v {
            DValue::Top => self.top_cardinality.unwrap_or(self.top_cost),
            DValue::Atom(_) => self.atom_cost,
        }
    }

    fn top(&self) -> DValue {
        DValue::Top
    }

    fn render(&self, v: &DValue) -> String {
        match v {
            DValue::Top => "*".to_string(),
            DValue::Atom(s) => s.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_distinct_atoms_hits_top() {
        let labeling = DValueLabeling::new(10.0);
        for (l1, l2) in [("tcp", "udp"), ("1000", "2000")] {
            let a = DValue::atom(l1);
            let b = DValue::atom(l2);
            assert_eq!(labeling.join(&a, &b), Spec::new(10.0, DValue::Top));
            assert_eq!(labeling.join(&a, &DValue::Top), Spec::new(10.0, DValue::Top));
            assert_eq!(labeling.join(&a, &a), Spec::new(1.0, a.clone()));
        }
    }

    #[test]
    fn meet_narrows_to_the_atom() {
        let labeling = DValueLabeling::new(3.0);
        let a = DValue::atom("a");
        let b = DValue::atom("b");
        assert_eq!(labeling.meet(&DValue::Top, &a), Some(Spec::new(1.0, a.clone())));
        assert_eq!(labeling.meet(&a, &DValue::Top), Some(Spec::new(1.0, a.clone())));
        assert_eq!(labeling.meet(&a, &a), Some(Spec::new(1.0, a.clone())));
        assert_eq!(labeling.meet(&a, &b), None);
    }

    #[test]
    fn subset_is_reflexive_and_top_absorbs() {
        let labeling = DValueLabeling::new(3.0);
        let a = DValue::atom("a");
        assert!(labeling.subset(&a, &a));
        assert!(labeling.subset(&a, &DValue::Top));
        assert!(!labeling.subset(&DValue::Top, &a));
    }

    #[test]
    fn cardinality_prefers_the_explicit_count() {
        let mut labeling = DValueLabeling::new(10.0);
        assert_eq!(labeling.cardinality(&DValue::Top), 10.0);
        labeling.top_cardinality = Some(3.0);
        assert_eq!(labeling.cardinality(&DValue::Top), 3.0);
        assert_eq!(labeling.cardinality(&DValue::atom("x")), 1.0);
    }

    #[test]
    fn infer_folds_join() {
        let labeling = DValueLabeling::new(10.0);
        let vals: Vec<DValue> = ["tcp", "tcp", "tcp"].iter().map(|s| DValue::atom(*s)).collect();
        assert_eq!(labeling.infer(&vals), Some(Spec::new(1.0, DValue::atom("tcp"))));

        let mixed: Vec<DValue> = ["tcp", "tcp", "udp"].iter().map(|s| DValue::atom(*s)).collect();
        assert_eq!(labeling.infer(&mixed), Some(Spec::new(10.0, DValue::Top)));
        assert_eq!(labeling.infer(&[] as &[DValue]), None);
    }
}

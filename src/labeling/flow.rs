use serde::{Deserialize, Serialize};

use crate::hregex::{HRegex, HRegexLabeling};
use crate::labeling::{
    DValue, DValueLabeling, Feature, HierarchyLabeling, Ipv4Prefix, Ipv4PrefixLabeling, LabelId,
    Labeling, Spec,
};

/// One position of a flow tuple.
///
/// Components of different domains never mix: the labeling at each tuple
/// position determines which variant that position holds, so a variant
/// mismatch is a construction bug, not an input error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentValue {
    Prefix(Ipv4Prefix),
    Path(HRegex),
    Label(LabelId),
    Atom(DValue),
}

/// The labeling of one flow-tuple position, dispatching to the concrete
/// domain implementations.
pub enum ComponentLabeling {
    Prefix(Ipv4PrefixLabeling),
    Path(HRegexLabeling),
    Hierarchy(HierarchyLabeling),
    Discrete(DValueLabeling),
}

macro_rules! component_dispatch {
    ($self:expr, $v:expr, |$l:ident, $x:ident| $body:expr) => {
        match ($self, $v) {
            (ComponentLabeling::Prefix($l), ComponentValue::Prefix($x)) => $body,
            (ComponentLabeling::Path($l), ComponentValue::Path($x)) => $body,
            (ComponentLabeling::Hierarchy($l), ComponentValue::Label($x)) => $body,
            (ComponentLabeling::Discrete($l), ComponentValue::Atom($x)) => $body,
            _ => panic!("flow component does not match its labeling domain"),
        }
    };
}

macro_rules! component_dispatch2 {
    ($self:expr, $a:expr, $b:expr, |$l:ident, $x:ident, $y:ident| $body:expr) => {
        match ($self, $a, $b) {
            (
                ComponentLabeling::Prefix($l),
                ComponentValue::Prefix($x),
                ComponentValue::Prefix($y),
            ) => $body,
            (ComponentLabeling::Path($l), ComponentValue::Path($x), ComponentValue::Path($y)) => {
                $body
            }
            (
                ComponentLabeling::Hierarchy($l),
                ComponentValue::Label($x),
                ComponentValue::Label($y),
            ) => $body,
            (ComponentLabeling::Discrete($l), ComponentValue::Atom($x), ComponentValue::Atom($y)) => {
                $body
            }
            _ => panic!("flow components do not match their labeling domain"),
        }
    };
}

impl Labeling for ComponentLabeling {
    type Value = ComponentValue;

    fn join(&self, a: &ComponentValue, b: &ComponentValue) -> Spec<ComponentValue> {
        use ComponentLabeling as L;
        use ComponentValue as V;
        match (self, a, b) {
            (L::Prefix(l), V::Prefix(x), V::Prefix(y)) => {
                let s = l.join(x, y);
                Spec::new(s.cost, V::Prefix(s.value))
            }
            (L::Path(l), V::Path(x), V::Path(y)) => {
                let s = l.join(x, y);
                Spec::new(s.cost, V::Path(s.value))
            }
            (L::Hierarchy(l), V::Label(x), V::Label(y)) => {
                let s = l.join(x, y);
                Spec::new(s.cost, V::Label(s.value))
            }
            (L::Discrete(l), V::Atom(x), V::Atom(y)) => {
                let s = l.join(x, y);
                Spec::new(s.cost, V::Atom(s.value))
            }
            _ => panic!("flow components do not match their labeling domain"),
        }
    }

    fn meet(&self, a: &ComponentValue, b: &ComponentValue) -> Option<Spec<ComponentValue>> {
        use ComponentLabeling as L;
        use ComponentValue as V;
        match (self, a, b) {
            (L::Prefix(l), V::Prefix(x), V::Prefix(y)) => {
                l.meet(x, y).map(|s| Spec::new(s.cost, V::Prefix(s.value)))
            }
            (L::Path(l), V::Path(x), V::Path(y)) => {
                l.meet(x, y).map(|s| Spec::new(s.cost, V::Path(s.value)))
            }
            (L::Hierarchy(l), V::Label(x), V::Label(y)) => {
                l.meet(x, y).map(|s| Spec::new(s.cost, V::Label(s.value)))
            }
            (L::Discrete(l), V::Atom(x), V::Atom(y)) => {
                l.meet(x, y).map(|s| Spec::new(s.cost, V::Atom(s.value)))
            }
            _ => panic!("flow components do not match their labeling domain"),
        }
    }

    fn subset(&self, a: &ComponentValue, b: &ComponentValue) -> bool {
        component_dispatch2!(self, a, b, |l, x, y| l.subset(x, y))
    }

    fn cost(&self, v: &ComponentValue) -> f64 {
        component_dispatch!(self, v, |l, x| l.cost(x))
    }

    fn cardinality(&self, v: &ComponentValue) -> f64 {
        component_dispatch!(self, v, |l, x| l.cardinality(x))
    }

    fn top(&self) -> ComponentValue {
        match self {
            ComponentLabeling::Prefix(l) => ComponentValue::Prefix(l.top()),
            ComponentLabeling::Path(l) => ComponentValue::Path(l.top()),
            ComponentLabeling::Hierarchy(l) => ComponentValue::Label(l.top()),
            ComponentLabeling::Discrete(l) => ComponentValue::Atom(l.top()),
        }
    }

    fn render(&self, v: &ComponentValue) -> String {
        component_dispatch!(self, v, |l, x| l.render(x))
    }
}

/// A flow: one value per feature position.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple(Vec<ComponentValue>);

impl FlowTuple {
    pub fn new(components: Vec<ComponentValue>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[ComponentValue] {
        &self.0
    }
}

/// Component-wise composition of heterogeneous labelings.
///
/// Costs and cardinalities multiply across positions; `subset` holds when it
/// holds at every position; `meet` is empty as soon as any position is.
pub struct TupleLabeling {
    features: Vec<Feature<ComponentLabeling>>,
}

impl TupleLabeling {
    pub fn new(features: Vec<Feature<ComponentLabeling>>) -> Self {
        assert!(!features.is_empty(), "a flow needs at least one feature");
        Self { features }
    }

    pub fn features(&self) -> &[Feature<ComponentLabeling>] {
        &self.features
    }

    fn check_arity(&self, v: &FlowTuple) {
        assert_eq!(
            v.0.len(),
            self.features.len(),
            "flow arity does not match the feature list"
        );
    }
}

impl Labeling for TupleLabeling {
    type Value = FlowTuple;

    fn join(&self, a: &FlowTuple, b: &FlowTuple) -> Spec<FlowTuple> {
        self.check_arity(a);
        self.check_arity(b);
        let mut cost = 1.0;
        let mut joined = Vec::with_capacity(self.features.len());
        for (f, (x, y)) in self.features.iter().zip(a.0.iter().zip(b.0.iter())) {
            let spec = f.labeling.join(x, y);
            cost *= spec.cost;
            joined.push(spec.value);
        }
        Spec::new(cost, FlowTuple(joined))
    }

    fn meet(&self, a: &FlowTuple, b: &FlowTuple) -> Option<Spec<FlowTuple>> {
        self.check_arity(a);
        self.check_arity(b);
        let mut cost = 1.0;
        let mut met = Vec::with_capacity(self.features.len());
        for (f, (x, y)) in self.features.iter().zip(a.0.iter().zip(b.0.iter())) {
            let spec = f.labeling.meet(x, y)?;
            cost *= spec.cost;
            met.push(spec.value);
        }
        Some(Spec::new(cost, FlowTuple(met)))
    }

    fn subset(&self, a: &FlowTuple, b: &FlowTuple) -> bool {
        self.check_arity(a);
        self.check_arity(b);
        self.features
            .iter()
            .zip(a.0.iter().zip(b.0.iter()))
            .all(|(f, (x, y))| f.labeling.subset(x, y))
    }

    fn cost(&self, v: &FlowTuple) -> f64 {
        self.check_arity(v);
        self.features
            .iter()
            .zip(v.0.iter())
            .map(|(f, x)| f.labeling.cost(x))
            .product()
    }

    fn cardinality(&self, v: &FlowTuple) -> f64 {
        self.check_arity(v);
        self.features
            .iter()
            .zip(v.0.iter())
            .map(|(f, x)| f.labeling.cardinality(x))
            .product()
    }

    fn top(&self) -> FlowTuple {
        FlowTuple(self.features.iter().map(|f| f.labeling.top()).collect())
    }

    fn render(&self, v: &FlowTuple) -> String {
        self.check_arity(v);
        let parts: Vec<String> = self
            .features
            .iter()
            .zip(v.0.iter())
            .map(|(f, x)| f.labeling.render(x))
            .collect();
        format!("({})", parts.join(", "))
    }
}

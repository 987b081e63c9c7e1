use std::fmt;

use serde::{Deserialize, Serialize};

mod discrete;
mod flow;
mod hierarchy;
mod ip;

pub use discrete::{DValue, DValueLabeling};
pub use flow::{ComponentLabeling, ComponentValue, FlowTuple, TupleLabeling};
pub use hierarchy::{HierarchyLabeling, LabelId};
pub use ip::{Ipv4Prefix, Ipv4PrefixLabeling};

/// A generalization together with its size proxy.
///
/// `Spec` is the canonical output of [`Labeling::join`] and [`Labeling::meet`]:
/// a value from the labeling's domain plus the cost of that value. It is always
/// a plain value copy, never shared mutably.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spec<V> {
    pub cost: f64,
    pub value: V,
}

impl<V> Spec<V> {
    pub fn new(cost: f64, value: V) -> Self {
        Self { cost, value }
    }
}

/// A lattice-like algebra over a value domain.
///
/// A `Labeling` knows how to generalize two values ([`join`](Labeling::join)),
/// specialize them ([`meet`](Labeling::meet)), test containment
/// ([`subset`](Labeling::subset)), and price a value
/// ([`cost`](Labeling::cost) / [`cardinality`](Labeling::cardinality)).
/// The clustering driver, the R-tree index, and the meet semi-lattice are all
/// generic over this trait.
///
/// # Laws
/// Implementations must preserve the following:
/// * `join` is commutative, associative, and idempotent.
/// * `subset(a, b)` iff `join(a, b).value == b`.
/// * `subset(a, top())` for every `a`.
/// * `cost(join(a, b).value) >= max(cost(a), cost(b))`.
/// * `cardinality(join(a, b).value) >= cardinality(a)`.
///
/// # Example
/// ```rust
/// use flowspec::labeling::{DValueLabeling, DValue, Labeling};
///
/// let proto = DValueLabeling::new(10.0);
/// let tcp = DValue::atom("tcp");
/// let udp = DValue::atom("udp");
///
/// // tcp ⊔ tcp = tcp, tcp ⊔ udp = ⊤
/// assert_eq!(proto.join(&tcp, &tcp).value, tcp);
/// assert_eq!(proto.join(&tcp, &udp).value, DValue::Top);
/// ```
pub trait Labeling {
    type Value: Clone + PartialEq + fmt::Debug;

    /// Least upper bound of `a` and `b` in the generalization lattice.
    ///
    /// Total: every pair of values has a join (at worst [`top`](Labeling::top)).
    fn join(&self, a: &Self::Value, b: &Self::Value) -> Spec<Self::Value>;

    /// Greatest lower bound of `a` and `b`, or `None` when the two values
    /// cover no common element.
    fn meet(&self, a: &Self::Value, b: &Self::Value) -> Option<Spec<Self::Value>>;

    /// Size proxy used for merge scoring. Monotone under generalization.
    fn cost(&self, v: &Self::Value) -> f64;

    /// The universal element of the domain.
    fn top(&self) -> Self::Value;

    /// Containment: `a` ⊑ `b`.
    ///
    /// The default tests `join(a, b).value == b`; domains with a cheaper or
    /// more direct check override it.
    fn subset(&self, a: &Self::Value, b: &Self::Value) -> bool {
        self.join(a, b).value == *b
    }

    /// Exact count of atomic elements covered by `v`.
    ///
    /// Defaults to [`cost`](Labeling::cost); domains where the size proxy and
    /// the true extension differ override it.
    fn cardinality(&self, v: &Self::Value) -> f64 {
        self.cost(v)
    }

    /// Human-readable rendering of a value, resolved through the labeling.
    ///
    /// Values such as interned label ids cannot print themselves; the labeling
    /// owns the names, so it owns the formatting.
    fn render(&self, v: &Self::Value) -> String;

    /// Folds `join` over a sequence of values, yielding the least
    /// generalization covering all of them. `None` on an empty input.
    fn infer<'a, I>(&self, values: I) -> Option<Spec<Self::Value>>
    where
        Self::Value: 'a,
        I: IntoIterator<Item = &'a Self::Value>,
    {
        let mut spec: Option<Spec<Self::Value>> = None;
        for v in values {
            spec = Some(match spec {
                None => self.join(v, v),
                Some(s) => self.join(&s.value, v),
            });
        }
        spec
    }
}

/// A named handle binding one labeling to a position in a flow tuple.
#[derive(Clone, Debug)]
pub struct Feature<L> {
    pub name: String,
    pub labeling: L,
}

impl<L> Feature<L> {
    pub fn new(name: impl Into<String>, labeling: L) -> Self {
        Self {
            name: name.into(),
            labeling,
        }
    }
}

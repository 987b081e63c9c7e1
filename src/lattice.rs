use std::hash::Hash;

use hashbrown::{HashMap, HashSet};
use rapidhash::quality::RandomState;
use slotmap::{SlotMap, new_key_type};
use tracing::debug;

use crate::labeling::{Feature, Labeling};

new_key_type! {
    /// Handle to a node in a [`MeetSemiLattice`].
    pub struct LatticeKey;
}

struct LatticeNode<V> {
    label: V,
    children: Vec<LatticeKey>,
    cardinality: Option<f64>,
}

/// The Hasse diagram of a set of inserted generalizations plus the universal
/// top, with exact cardinality accounting by inclusion-exclusion.
///
/// Inserting a label splices it between the nodes above and below it; where
/// an inserted label partially overlaps an existing one, their `meet` is
/// materialized as a shared descendant so no atom is counted twice. The
/// diagram produced depends on insertion order, but cardinalities do not;
/// that independence is the contract callers rely on.
pub struct MeetSemiLattice<'a, L: Labeling>
where
    L::Value: Eq + Hash,
{
    feature: &'a Feature<L>,
    nodes: SlotMap<LatticeKey, LatticeNode<L::Value>>,
    by_label: HashMap<L::Value, LatticeKey, RandomState>,
    root: LatticeKey,
}

impl<'a, L: Labeling> MeetSemiLattice<'a, L>
where
    L::Value: Eq + Hash,
{
    pub fn new(feature: &'a Feature<L>) -> Self {
        let mut nodes = SlotMap::with_key();
        let top = feature.labeling.top();
        let root = nodes.insert(LatticeNode {
            label: top.clone(),
            children: Vec::new(),
            cardinality: None,
        });
        let mut by_label = HashMap::with_hasher(RandomState::new());
        by_label.insert(top, root);
        Self { feature, nodes, by_label, root }
    }

    pub fn root(&self) -> LatticeKey {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn label(&self, node: LatticeKey) -> &L::Value {
        &self.nodes[node].label
    }

    /// Inserts a generalization, returning its node. Re-inserting a known
    /// label is a no-op.
    pub fn insert(&mut self, label: L::Value) -> LatticeKey {
        let (node, new) = self.get_node(label);
        if new {
            self.insert_under(node, self.root);
        }
        node
    }

    fn get_node(&mut self, label: L::Value) -> (LatticeKey, bool) {
        if let Some(&node) = self.by_label.get(&label) {
            return (node, false);
        }
        let node = self.nodes.insert(LatticeNode {
            label: label.clone(),
            children: Vec::new(),
            cardinality: None,
        });
        self.by_label.insert(label, node);
        (node, true)
    }

    fn subset(&self, a: LatticeKey, b: LatticeKey) -> bool {
        self.feature
            .labeling
            .subset(&self.nodes[a].label, &self.nodes[b].label)
    }

    fn insert_under(&mut self, node: LatticeKey, parent: LatticeKey) {
        assert!(self.subset(node, parent), "insertion target must contain the label");

        if self.nodes[node].label == self.nodes[parent].label {
            return;
        }

        let existing = self.nodes[parent].children.clone();
        let mut moved = Vec::new();
        let mut intersections: Vec<Option<LatticeKey>> = Vec::new();

        for child in existing {
            if self.subset(node, child) {
                debug!(?node, ?child, "descending into child");
                self.insert_under(node, child);
            } else if self.subset(child, node) {
                moved.push(child);
            } else {
                let meet = self
                    .feature
                    .labeling
                    .meet(&self.nodes[node].label, &self.nodes[child].label);
                if let Some(meet) = meet {
                    let (meet_node, new) = self.get_node(meet.value);
                    intersections.push(Some(meet_node));
                    if new {
                        self.insert_under(meet_node, child);
                    }
                }
            }
        }

        if !self.nodes[parent].children.contains(&node) {
            self.nodes[parent].children.push(node);
        }

        // keep only maximal intersections not already covered by a moved child
        for slot in intersections.iter_mut() {
            if let Some(ic) = *slot
                && moved.iter().any(|&c| self.subset(ic, c))
            {
                *slot = None;
            }
        }
        for i in 0..intersections.len() {
            for j in 0..intersections.len() {
                if i == j {
                    continue;
                }
                if let (Some(a), Some(b)) = (intersections[i], intersections[j])
                    && self.subset(b, a)
                {
                    intersections[j] = None;
                }
            }
        }

        for child in moved {
            self.nodes[parent].children.retain(|&c| c != child);
            if !self.nodes[node].children.contains(&child) {
                self.nodes[node].children.push(child);
            }
        }
        for ic in intersections.into_iter().flatten() {
            self.nodes[parent].children.retain(|&c| c != ic);
            if !self.nodes[node].children.contains(&ic) {
                self.nodes[node].children.push(ic);
            }
        }
    }

    /// All nodes reachable below `node`, including `node` itself.
    pub fn node_subtree(&self, node: LatticeKey) -> HashSet<LatticeKey, RandomState> {
        let mut set = HashSet::with_hasher(RandomState::new());
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            if set.insert(n) {
                stack.extend_from_slice(&self.nodes[n].children);
            }
        }
        set
    }

    /// The subtree of the node carrying `label`.
    ///
    /// # Panics
    /// Panics if `label` was never inserted.
    pub fn label_subtree(&self, label: &L::Value) -> HashSet<LatticeKey, RandomState> {
        let node = *self
            .by_label
            .get(label)
            .expect("subtree queries require an inserted label");
        self.node_subtree(node)
    }

    /// Atoms covered by this node and by no proper descendant: the label's
    /// own cardinality minus the cardinality of everything below it.
    /// Memoized on first computation.
    pub fn cardinality(&mut self, node: LatticeKey) -> f64 {
        if let Some(card) = self.nodes[node].cardinality {
            return card;
        }
        let mut below = self.node_subtree(node);
        below.remove(&node);

        let mut covered = 0.0;
        for d in below {
            covered += self.cardinality(d);
        }
        let card = self.feature.labeling.cardinality(&self.nodes[node].label) - covered;
        self.nodes[node].cardinality = Some(card);
        card
    }

    /// Computes (and memoizes) the cardinality of every node.
    pub fn compute_all_cardinalities(&mut self) {
        self.cardinality(self.root);
    }

    pub fn keys(&self) -> impl Iterator<Item = LatticeKey> + '_ {
        self.nodes.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{
        ComponentLabeling, ComponentValue, DValue, DValueLabeling, FlowTuple, Ipv4Prefix,
        Ipv4PrefixLabeling, TupleLabeling,
    };

    fn p(s: &str) -> Ipv4Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn prefix_lattice_counts_by_inclusion_exclusion() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let mut lattice = MeetSemiLattice::new(&feature);
        lattice.insert(p("192.168.0.0/32"));
        lattice.insert(p("192.168.1.0/32"));
        lattice.insert(p("192.168.1.0/30"));
        assert_eq!(lattice.len(), 4);

        lattice.compute_all_cardinalities();
        let root = lattice.root();
        assert_eq!(lattice.cardinality(root), 2f64.powi(32) - 1.0 - 4.0);
    }

    fn two_field_feature() -> Feature<TupleLabeling> {
        let mut src = DValueLabeling::new(3.0);
        src.top_cardinality = Some(3.0);
        let mut dst = DValueLabeling::new(3.0);
        dst.top_cardinality = Some(3.0);
        Feature::new(
            "tuple",
            TupleLabeling::new(vec![
                Feature::new("src", ComponentLabeling::Discrete(src)),
                Feature::new("dst", ComponentLabeling::Discrete(dst)),
            ]),
        )
    }

    fn pair(src: DValue, dst: DValue) -> FlowTuple {
        FlowTuple::new(vec![ComponentValue::Atom(src), ComponentValue::Atom(dst)])
    }

    #[test]
    fn overlapping_tuples_materialize_their_meet() {
        let feature = two_field_feature();
        let mut lattice = MeetSemiLattice::new(&feature);
        lattice.insert(pair(DValue::Top, DValue::atom("X")));
        lattice.insert(pair(DValue::atom("A"), DValue::Top));

        // top, the two inserted bands, and their intersection (A, X)
        assert_eq!(lattice.len(), 4);

        lattice.compute_all_cardinalities();
        let root = lattice.root();
        assert_eq!(lattice.cardinality(root), 9.0 - 3.0 - 3.0 + 1.0);
    }

    #[test]
    fn cardinalities_ignore_insertion_order() {
        let values = [
            pair(DValue::Top, DValue::atom("X")),
            pair(DValue::atom("A"), DValue::Top),
            pair(DValue::atom("A"), DValue::atom("X")),
            pair(DValue::atom("B"), DValue::atom("X")),
        ];

        let feature = two_field_feature();
        let mut reference: Option<f64> = None;
        for rotation in 0..values.len() {
            let mut lattice = MeetSemiLattice::new(&feature);
            for i in 0..values.len() {
                lattice.insert(values[(i + rotation) % values.len()].clone());
            }
            lattice.compute_all_cardinalities();
            let root_card = lattice.cardinality(lattice.root());
            match reference {
                None => reference = Some(root_card),
                Some(r) => assert_eq!(root_card, r, "rotation {rotation}"),
            }
        }
    }

    #[test]
    fn label_subtree_contains_the_label_and_everything_below() {
        let feature = two_field_feature();
        let mut lattice = MeetSemiLattice::new(&feature);
        let band = pair(DValue::Top, DValue::atom("X"));
        let cell = pair(DValue::atom("A"), DValue::atom("X"));
        lattice.insert(band.clone());
        lattice.insert(cell.clone());

        let subtree = lattice.label_subtree(&band);
        assert_eq!(subtree.len(), 2);
        let labels: Vec<&FlowTuple> = subtree.iter().map(|&k| lattice.label(k)).collect();
        assert!(labels.contains(&&band));
        assert!(labels.contains(&&cell));
    }
}

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use rapidhash::quality::RandomState;
use serde::{Deserialize, Serialize};

use crate::error::FlowspecError;
use crate::labeling::{Labeling, Spec};

/// Costs within this distance are treated as tied when picking the cheapest
/// common ancestor or the most expensive common descendant.
pub(crate) const COST_EPSILON: f64 = 1e-10;

/// An interned handle to a label in a [`HierarchyLabeling`].
///
/// Ids are dense and assigned in sorted name order at load time, so identical
/// hierarchy files always produce identical ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(u32);

impl LabelId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct LabelEntry {
    name: String,
    cost: f64,
    parents: Vec<LabelId>,
    cardinality: Option<f64>,
}

#[derive(Deserialize)]
struct RawLabel {
    cost: f64,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    cardinality: Option<f64>,
}

/// A rooted DAG of labels, each with a cost and a set of parents.
///
/// The hierarchy defines a generalization lattice over its labels:
/// `join` is the cheapest common ancestor, `meet` the most expensive common
/// descendant, `subset` is ancestry. Ancestor and descendant sets are
/// memoized lazily on first use.
///
/// The input is assumed to be acyclic with exactly one root (the label with
/// no parents); [`HierarchyLabeling::load`] rejects files violating the root
/// condition.
pub struct HierarchyLabeling {
    entries: Vec<LabelEntry>,
    by_name: HashMap<String, LabelId, RandomState>,
    children: Vec<Vec<LabelId>>,
    root: LabelId,
    ancestors: RefCell<HashMap<LabelId, Rc<HashSet<LabelId, RandomState>>, RandomState>>,
    descendants: RefCell<HashMap<LabelId, Rc<HashSet<LabelId, RandomState>>, RandomState>>,
}

impl HierarchyLabeling {
    /// Loads the `name -> { cost, parents, cardinality? }` JSON object.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowspecError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, FlowspecError> {
        // BTreeMap keeps label ids stable across loads of the same file
        let raw: BTreeMap<String, RawLabel> = serde_json::from_reader(reader)?;
        Self::build(raw)
    }

    pub fn from_json(json: &str) -> Result<Self, FlowspecError> {
        let raw: BTreeMap<String, RawLabel> = serde_json::from_str(json)?;
        Self::build(raw)
    }

    fn build(raw: BTreeMap<String, RawLabel>) -> Result<Self, FlowspecError> {
        let mut by_name = HashMap::with_hasher(RandomState::new());
        for (i, name) in raw.keys().enumerate() {
            by_name.insert(name.clone(), LabelId(i as u32));
        }

        let mut entries: Vec<LabelEntry> = Vec::with_capacity(raw.len());
        let mut children = vec![Vec::new(); raw.len()];
        let mut root: Option<LabelId> = None;
        for (i, (name, label)) in raw.into_iter().enumerate() {
            let id = LabelId(i as u32);
            let mut parents = Vec::with_capacity(label.parents.len());
            for p in &label.parents {
                let pid = *by_name.get(p).ok_or_else(|| {
                    FlowspecError::BadHierarchy(format!(
                        "label '{}' names unknown parent '{}'",
                        name, p
                    ))
                })?;
                children[pid.index()].push(id);
                parents.push(pid);
            }
            if parents.is_empty() {
                if let Some(other) = root {
                    return Err(FlowspecError::BadHierarchy(format!(
                        "multiple roots: '{}' and '{}'",
                        entries[other.index()].name, name
                    )));
                }
                root = Some(id);
            }
            entries.push(LabelEntry {
                name,
                cost: label.cost,
                parents,
                cardinality: label.cardinality,
            });
        }

        let root = root.ok_or_else(|| {
            FlowspecError::BadHierarchy("no root label (every label has parents)".into())
        })?;

        Ok(Self {
            entries,
            by_name,
            children,
            root,
            ancestors: RefCell::new(HashMap::with_hasher(RandomState::new())),
            descendants: RefCell::new(HashMap::with_hasher(RandomState::new())),
        })
    }

    /// Resolves a label name to its id.
    pub fn label(&self, name: &str) -> Option<LabelId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: LabelId) -> &str {
        &self.entries[id.index()].name
    }

    pub fn root(&self) -> LabelId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn label_ids(&self) -> impl Iterator<Item = LabelId> + '_ {
        (0..self.entries.len() as u32).map(LabelId)
    }

    pub fn label_cost(&self, id: LabelId) -> f64 {
        self.entries[id.index()].cost
    }

    /// Cost of generalizing `src` up to `dst`: `cost(dst)` when `dst` is an
    /// ancestor of `src` (or `src` itself), infinite otherwise.
    pub fn generalization_cost(&self, src: LabelId, dst: LabelId) -> f64 {
        if self.ancestor_set(src).contains(&dst) {
            self.entries[dst.index()].cost
        } else {
            f64::INFINITY
        }
    }

    /// The transitive parent closure of `l`, including `l` itself.
    pub fn ancestor_set(&self, l: LabelId) -> Rc<HashSet<LabelId, RandomState>> {
        if let Some(set) = self.ancestors.borrow().get(&l) {
            return Rc::clone(set);
        }
        let set = Rc::new(self.close_over(l, |id| &self.entries[id.index()].parents));
        self.ancestors.borrow_mut().insert(l, Rc::clone(&set));
        set
    }

    /// The transitive child closure of `l`, including `l` itself.
    pub fn descendant_set(&self, l: LabelId) -> Rc<HashSet<LabelId, RandomState>> {
        if let Some(set) = self.descendants.borrow().get(&l) {
            return Rc::clone(set);
        }
        let set = Rc::new(self.close_over(l, |id| &self.children[id.index()]));
        self.descendants.borrow_mut().insert(l, Rc::clone(&set));
        set
    }

    fn close_over<'a>(
        &'a self,
        start: LabelId,
        step: impl Fn(LabelId) -> &'a [LabelId],
    ) -> HashSet<LabelId, RandomState> {
        let mut seen = HashSet::with_hasher(RandomState::new());
        let mut stack = vec![start];
        while let Some(l) = stack.pop() {
            if seen.insert(l) {
                stack.extend_from_slice(step(l));
            }
        }
        seen
    }

    /// Picks the best label among common candidates. `prefer_high` selects the
    /// most expensive candidate (for meets) instead of the cheapest (joins);
    /// cost ties go to a candidate related to the incumbent per
    /// `tie_break`, then to the smaller id so the choice is order-independent.
    fn pick(
        &self,
        candidates: impl Iterator<Item = LabelId>,
        prefer_high: bool,
        tie_break: impl Fn(LabelId, LabelId) -> bool,
    ) -> Option<LabelId> {
        let mut sorted: Vec<LabelId> = candidates.collect();
        sorted.sort_unstable();

        let mut best: Option<LabelId> = None;
        for l in sorted {
            best = Some(match best {
                None => l,
                Some(incumbent) => {
                    let cl = self.entries[l.index()].cost;
                    let ci = self.entries[incumbent.index()].cost;
                    let better = if prefer_high { cl > ci + COST_EPSILON } else { cl < ci - COST_EPSILON };
                    if better {
                        l
                    } else if (cl - ci).abs() <= COST_EPSILON && tie_break(l, incumbent) {
                        l
                    } else {
                        incumbent
                    }
                }
            });
        }
        best
    }
}

impl Labeling for HierarchyLabeling {
    type Value = LabelId;

    fn join(&self, a: &LabelId, b: &LabelId) -> Spec<LabelId> {
        let pa = self.ancestor_set(*a);
        let pb = self.ancestor_set(*b);

        // cheapest common ancestor; on a cost tie prefer the more specific
        // candidate, i.e. a proper descendant of the incumbent
        let best = self
            .pick(
                pa.iter().copied().filter(|l| pb.contains(l)),
                false,
                |l, incumbent| l != incumbent && self.ancestor_set(l).contains(&incumbent),
            )
            .expect("rooted hierarchy always has a common ancestor");

        Spec::new(self.entries[best.index()].cost, best)
    }

    fn meet(&self, a: &LabelId, b: &LabelId) -> Option<Spec<LabelId>> {
        let da = self.descendant_set(*a);
        let db = self.descendant_set(*b);

        // most expensive common descendant; ties prefer the more general
        // candidate, i.e. a proper ancestor of the incumbent
        let best = self.pick(
            da.iter().copied().filter(|l| db.contains(l)),
            true,
            |l, incumbent| l != incumbent && self.descendant_set(l).contains(&incumbent),
        )?;

        Some(Spec::new(self.entries[best.index()].cost, best))
    }

    fn subset(&self, a: &LabelId, b: &LabelId) -> bool {
        self.ancestor_set(*a).contains(b)
    }

    fn cost(&self, v: &LabelId) -> f64 {
        self.entries[v.index()].cost
    }

    fn cardinality(&self, v: &LabelId) -> f64 {
        let entry = &self.entries[v.index()];
        entry.cardinality.unwrap_or(entry.cost)
    }

    fn top(&self) -> LabelId {
        self.root
    }

    fn render(&self, v: &LabelId) -> String {
        self.entries[v.index()].name.clone()
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

    #[test]
    fn join_finds_the_cheapest_common_ancestor() {
        let h = device_hierarchy();
        let id = |n: &str| h.label(n).unwrap();

        assert_eq!(h.join(&id("s1"), &id("s2")), Spec::new(2.0, id("Server")));
        assert_eq!(h.join(&id("u1"), &id("u2")), Spec::new(2.0, id("User")));
        assert_eq!(h.join(&id("s1"), &id("Server")), Spec::new(2.0, id("Server")));
        assert_eq!(h.join(&id("s1"), &id("User")), Spec::new(4.0, id("Any")));
        assert_eq!(h.join(&id("s1"), &id("u2")), Spec::new(4.0, id("Any")));
        assert_eq!(h.join(&id("Any"), &id("s1")), Spec::new(4.0, id("Any")));
    }

    #[test]
    fn join_cost_tie_prefers_the_descendant() {
        // Mid and Wide tie on cost, but Mid sits below Wide; join(a, b) must
        // pick the more specific Mid.
        let h = HierarchyLabeling::from_json(
            r#"{
                "a": {"cost": 1, "parents": ["Mid"]},
                "b": {"cost": 1, "parents": ["Mid"]},
                "Mid": {"cost": 3, "parents": ["Wide"]},
                "Wide": {"cost": 3, "parents": ["Root"]},
                "Root": {"cost": 9, "parents": []}
            }"#,
        )
        .unwrap();
        let id = |n: &str| h.label(n).unwrap();

        assert_eq!(h.join(&id("a"), &id("b")), Spec::new(3.0, id("Mid")));
    }

    #[test]
    fn meet_finds_the_most_expensive_common_descendant() {
        let h = device_hierarchy();
        let id = |n: &str| h.label(n).unwrap();

        assert_eq!(h.meet(&id("s1"), &id("s1")), Some(Spec::new(1.0, id("s1"))));
        assert_eq!(h.meet(&id("Server"), &id("s1")), Some(Spec::new(1.0, id("s1"))));
        assert_eq!(h.meet(&id("Server"), &id("Any")), Some(Spec::new(2.0, id("Server"))));
        assert_eq!(h.meet(&id("s1"), &id("u1")), None);
        assert_eq!(h.meet(&id("Server"), &id("User")), None);
    }

    #[test]
    fn subset_is_ancestry() {
        let h = device_hierarchy();
        let id = |n: &str| h.label(n).unwrap();

        assert!(h.subset(&id("s1"), &id("Server")));
        assert!(h.subset(&id("s1"), &id("Any")));
        assert!(h.subset(&id("s1"), &id("s1")));
        assert!(!h.subset(&id("Server"), &id("s1")));
        assert!(!h.subset(&id("s1"), &id("User")));
    }

    #[test]
    fn generalization_cost_is_infinite_off_the_ancestor_chain() {
        let h = device_hierarchy();
        let id = |n: &str| h.label(n).unwrap();

        assert_eq!(h.generalization_cost(id("s1"), id("Server")), 2.0);
        assert_eq!(h.generalization_cost(id("s1"), id("s1")), 1.0);
        assert!(h.generalization_cost(id("s1"), id("User")).is_infinite());
    }

    #[test]
    fn cardinality_falls_back_to_cost() {
        let h = HierarchyLabeling::from_json(
            r#"{
                "x": {"cost": 1, "parents": ["Root"]},
                "Root": {"cost": 100, "parents": [], "cardinality": 7}
            }"#,
        )
        .unwrap();
        assert_eq!(h.cardinality(&h.root()), 7.0);
        assert_eq!(h.cardinality(&h.label("x").unwrap()), 1.0);
    }

    #[test]
    fn rejects_malformed_hierarchies() {
        let no_root = r#"{
            "a": {"cost": 1, "parents": ["b"]},
            "b": {"cost": 1, "parents": ["a"]}
        }"#;
        assert!(matches!(
            HierarchyLabeling::from_json(no_root),
            Err(FlowspecError::BadHierarchy(_))
        ));

        let two_roots = r#"{
            "a": {"cost": 1, "parents": []},
            "b": {"cost": 1, "parents": []}
        }"#;
        assert!(matches!(
            HierarchyLabeling::from_json(two_roots),
            Err(FlowspecError::BadHierarchy(_))
        ));

        let unknown_parent = r#"{
            "a": {"cost": 1, "parents": ["ghost"]},
            "b": {"cost": 1, "parents": []}
        }"#;
        assert!(matches!(
            HierarchyLabeling::from_json(unknown_parent),
            Err(FlowspecError::BadHierarchy(_))
        ));
    }
}

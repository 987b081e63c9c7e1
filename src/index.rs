use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use slotmap::{SlotMap, new_key_type};

use crate::labeling::{Feature, Labeling, Spec};

new_key_type! {
    struct TreeKey;
}

enum Contents<V, T> {
    Leaf(Vec<(Spec<V>, T)>),
    Internal(Vec<TreeKey>),
}

impl<V, T> Contents<V, T> {
    fn len(&self) -> usize {
        match self {
            Contents::Leaf(entries) => entries.len(),
            Contents::Internal(children) => children.len(),
        }
    }
}

struct TreeNode<V, T> {
    bounding_box: Spec<V>,
    covered_approx: f64,
    contents: Contents<V, T>,
}

/// An R-tree whose "boxes" are generalizations in a labeling.
///
/// Internal nodes carry the `join` of everything below them, so subset
/// queries can prune whole subtrees with a single `meet` test. Each node also
/// tracks `covered_approx`, the additive cost of the entries in its subtree;
/// the sum assumes entries do not overlap, so overlapping inserts make it an
/// over-estimate.
///
/// Splits use the quadratic pick-seeds strategy, keeping every node between
/// `node_min_size` and `node_max_size` objects.
pub struct RTreeIndex<'a, L: Labeling, T> {
    feature: &'a Feature<L>,
    nodes: SlotMap<TreeKey, TreeNode<L::Value, T>>,
    root: TreeKey,
    node_min_size: usize,
    node_max_size: usize,
}

impl<'a, L: Labeling, T> RTreeIndex<'a, L, T> {
    pub fn new(feature: &'a Feature<L>) -> Self {
        Self::with_node_sizes(feature, 2, 5)
    }

    pub fn with_node_sizes(feature: &'a Feature<L>, node_min_size: usize, node_max_size: usize) -> Self {
        assert!(
            node_min_size >= 1 && 2 * node_min_size <= node_max_size + 1,
            "unsplittable node size bounds"
        );
        let mut nodes = SlotMap::with_key();
        let top = feature.labeling.top();
        let root = nodes.insert(TreeNode {
            bounding_box: Spec::new(feature.labeling.cost(&top), top),
            covered_approx: 0.0,
            contents: Contents::Leaf(Vec::new()),
        });
        Self { feature, nodes, root, node_min_size, node_max_size }
    }

    fn labeling(&self) -> &L {
        &self.feature.labeling
    }

    /// Inserts an entry, growing bounding boxes along the descent path and
    /// splitting overflowing nodes on the way back up.
    pub fn insert(&mut self, key: Spec<L::Value>, value: T) {
        if let Some(sibling) = self.insert_at(self.root, &key, value) {
            // the root split; grow the tree by one level
            let old_root = self.root;
            let bounding_box = self.labeling().join(
                &self.nodes[old_root].bounding_box.value,
                &self.nodes[sibling].bounding_box.value,
            );
            let covered_approx =
                self.nodes[old_root].covered_approx + self.nodes[sibling].covered_approx;
            self.root = self.nodes.insert(TreeNode {
                bounding_box,
                covered_approx,
                contents: Contents::Internal(vec![old_root, sibling]),
            });
        }
    }

    fn insert_at(&mut self, node: TreeKey, key: &Spec<L::Value>, value: T) -> Option<TreeKey> {
        let grown = self.labeling().join(&self.nodes[node].bounding_box.value, &key.value);
        {
            let n = &mut self.nodes[node];
            n.bounding_box = grown;
            n.covered_approx += key.cost;
        }

        let children = match &mut self.nodes[node].contents {
            Contents::Leaf(entries) => {
                entries.push((key.clone(), value));
                return self.split(node);
            }
            Contents::Internal(children) => children.clone(),
        };

        // smallest cost increase wins; ties go to the smaller result
        let mut best: Option<(f64, f64, usize)> = None;
        for (idx, &child) in children.iter().enumerate() {
            let child_bb = &self.nodes[child].bounding_box;
            let spec = self.labeling().join(&child_bb.value, &key.value);
            let diff = spec.cost - child_bb.cost;
            let better = match best {
                None => true,
                Some((best_diff, best_cost, _)) => {
                    diff < best_diff || (diff - best_diff < 1e-10 && spec.cost < best_cost)
                }
            };
            if better {
                best = Some((diff, spec.cost, idx));
            }
        }
        let (_, _, idx) = best.expect("internal node has children");

        if let Some(sibling) = self.insert_at(children[idx], key, value) {
            if let Contents::Internal(children) = &mut self.nodes[node].contents {
                children.insert(idx + 1, sibling);
            }
        }
        self.split(node)
    }

    /// Quadratic split: seed the two groups with the pair whose join costs
    /// the most, then assign the rest to whichever group grows least,
    /// forcing a group once the leftovers can no longer reach the fill floor.
    fn split(&mut self, node: TreeKey) -> Option<TreeKey> {
        let count = self.nodes[node].contents.len();
        if count <= self.node_max_size {
            return None;
        }

        let (object_bbs, object_covered): (Vec<Spec<L::Value>>, Vec<f64>) =
            match &self.nodes[node].contents {
                Contents::Leaf(entries) => entries
                    .iter()
                    .map(|(k, _)| (k.clone(), k.cost))
                    .unzip(),
                Contents::Internal(children) => children
                    .iter()
                    .map(|&c| {
                        (self.nodes[c].bounding_box.clone(), self.nodes[c].covered_approx)
                    })
                    .unzip(),
            };

        let mut seeds: Option<(f64, (usize, usize))> = None;
        for i in 0..count {
            for j in i + 1..count {
                let spec = self.labeling().join(&object_bbs[i].value, &object_bbs[j].value);
                if seeds.is_none_or(|(cost, _)| spec.cost > cost) {
                    seeds = Some((spec.cost, (i, j)));
                }
            }
        }
        let (_, (a, b)) = seeds.expect("overflowing node has at least two objects");

        let mut groups: [Vec<usize>; 2] = [vec![a], vec![b]];
        let mut group_bbs = [object_bbs[a].clone(), object_bbs[b].clone()];
        let mut covered = [object_covered[a], object_covered[b]];

        for i in 0..count {
            if i == a || i == b {
                continue;
            }
            let left = (count - i - usize::from(i < a) - usize::from(i < b)) as isize;
            let floor = self.node_min_size as isize;
            let group = if (groups[0].len() as isize) <= floor - left {
                0
            } else if (groups[1].len() as isize) <= floor - left {
                1
            } else {
                let spec0 = self.labeling().join(&object_bbs[i].value, &group_bbs[0].value);
                let spec1 = self.labeling().join(&object_bbs[i].value, &group_bbs[1].value);
                let diff0 = spec0.cost - group_bbs[0].cost;
                let diff1 = spec1.cost - group_bbs[1].cost;
                if (diff0 - diff1).abs() > 1e-10 {
                    usize::from(diff0 >= diff1)
                } else if (spec0.cost - spec1.cost).abs() > 1e-10 {
                    usize::from(spec0.cost >= spec1.cost)
                } else {
                    usize::from(groups[0].len() >= groups[1].len())
                }
            };
            groups[group].push(i);
            group_bbs[group] = self.labeling().join(&group_bbs[group].value, &object_bbs[i].value);
            covered[group] += object_covered[i];
        }

        for g in &groups {
            assert!(
                self.node_min_size <= g.len() && g.len() <= self.node_max_size,
                "node split violated the fill bounds"
            );
        }

        let sibling_contents = match std::mem::replace(
            &mut self.nodes[node].contents,
            Contents::Internal(Vec::new()),
        ) {
            Contents::Leaf(entries) => {
                let mut slots: Vec<Option<(Spec<L::Value>, T)>> =
                    entries.into_iter().map(Some).collect();
                let take = |slots: &mut Vec<Option<(Spec<L::Value>, T)>>, idxs: &[usize]| {
                    idxs.iter()
                        .map(|&i| slots[i].take().expect("object assigned to one group"))
                        .collect::<Vec<_>>()
                };
                let kept = take(&mut slots, &groups[0]);
                let moved = take(&mut slots, &groups[1]);
                self.nodes[node].contents = Contents::Leaf(kept);
                Contents::Leaf(moved)
            }
            Contents::Internal(children) => {
                let kept = groups[0].iter().map(|&i| children[i]).collect();
                let moved = groups[1].iter().map(|&i| children[i]).collect();
                self.nodes[node].contents = Contents::Internal(kept);
                Contents::Internal(moved)
            }
        };

        let [keep_bb, move_bb] = group_bbs;
        let n = &mut self.nodes[node];
        n.bounding_box = keep_bb;
        n.covered_approx = covered[0];

        Some(self.nodes.insert(TreeNode {
            bounding_box: move_bb,
            covered_approx: covered[1],
            contents: sibling_contents,
        }))
    }
}

impl<'a, L: Labeling, T: Clone> RTreeIndex<'a, L, T> {
    /// All entries whose key is contained in `key`.
    pub fn get_subsets(&self, key: &Spec<L::Value>) -> Vec<(Spec<L::Value>, T)> {
        let mut acc = Vec::new();
        self.collect_subsets(self.root, key, &mut acc);
        acc
    }

    fn collect_subsets(&self, node: TreeKey, key: &Spec<L::Value>, acc: &mut Vec<(Spec<L::Value>, T)>) {
        match &self.nodes[node].contents {
            Contents::Leaf(entries) => {
                for (entry_key, value) in entries {
                    if self.labeling().subset(&entry_key.value, &key.value) {
                        acc.push((entry_key.clone(), value.clone()));
                    }
                }
            }
            Contents::Internal(children) => {
                for &child in children {
                    if self
                        .labeling()
                        .meet(&self.nodes[child].bounding_box.value, &key.value)
                        .is_some()
                    {
                        self.collect_subsets(child, key, acc);
                    }
                }
            }
        }
    }

    /// Approximate nearest neighbors: best-first traversal ordered by the
    /// extra cost of absorbing `key` into each bounding box. Returns up to
    /// `k` entries; the result may miss true neighbors since bounding boxes
    /// only lower-bound the real distance.
    pub fn get_knn_approx(&self, key: &Spec<L::Value>, k: usize) -> Vec<(Spec<L::Value>, T)> {
        enum Item<'t, V, T> {
            Node(TreeKey),
            Entry(&'t (Spec<V>, T)),
        }

        struct Ranked<'t, V, T> {
            dist: f64,
            seq: u64,
            item: Item<'t, V, T>,
        }

        impl<V, T> PartialEq for Ranked<'_, V, T> {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }
        impl<V, T> Eq for Ranked<'_, V, T> {}
        impl<V, T> PartialOrd for Ranked<'_, V, T> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl<V, T> Ord for Ranked<'_, V, T> {
            fn cmp(&self, other: &Self) -> Ordering {
                self.dist.total_cmp(&other.dist).then_with(|| self.seq.cmp(&other.seq))
            }
        }

        let extra_cost = |bb: &Spec<L::Value>| {
            self.labeling().join(&bb.value, &key.value).cost - bb.cost - key.cost
        };

        let mut seq = 0u64;
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(Ranked {
            dist: extra_cost(&self.nodes[self.root].bounding_box),
            seq,
            item: Item::Node(self.root),
        }));

        let mut result = Vec::new();
        while result.len() < k {
            let Some(Reverse(ranked)) = heap.pop() else {
                break;
            };
            match ranked.item {
                Item::Entry(entry) => result.push(entry.clone()),
                Item::Node(node) => match &self.nodes[node].contents {
                    Contents::Leaf(entries) => {
                        for entry in entries {
                            seq += 1;
                            heap.push(Reverse(Ranked {
                                dist: extra_cost(&entry.0),
                                seq,
                                item: Item::Entry(entry),
                            }));
                        }
                    }
                    Contents::Internal(children) => {
                        for &child in children {
                            seq += 1;
                            heap.push(Reverse(Ranked {
                                dist: extra_cost(&self.nodes[child].bounding_box),
                                seq,
                                item: Item::Node(child),
                            }));
                        }
                    }
                },
            }
        }
        result
    }

    /// Exhaustive nearest neighbors; the reference the approximate variant is
    /// checked against.
    pub fn get_knn_precise(&self, key: &Spec<L::Value>, k: usize) -> Vec<(Spec<L::Value>, T)> {
        let mut entries = Vec::new();
        self.collect_entries(self.root, &mut entries);

        let mut ranked: Vec<(f64, (Spec<L::Value>, T))> = entries
            .into_iter()
            .map(|entry| {
                let dist =
                    self.labeling().join(&entry.0.value, &key.value).cost - entry.0.cost - key.cost;
                (dist, entry)
            })
            .collect();
        ranked.sort_by(|x, y| x.0.total_cmp(&y.0));
        ranked.into_iter().take(k).map(|(_, entry)| entry).collect()
    }

    fn collect_entries(&self, node: TreeKey, acc: &mut Vec<(Spec<L::Value>, T)>) {
        match &self.nodes[node].contents {
            Contents::Leaf(entries) => acc.extend(entries.iter().cloned()),
            Contents::Internal(children) => {
                for &child in children {
                    self.collect_entries(child, acc);
                }
            }
        }
    }
}

impl<'a, L: Labeling, T> RTreeIndex<'a, L, T> {
    /// Removes every entry contained in `key`, rebuilding bounding boxes
    /// bottom-up from the survivors. Returns the total `covered_approx`
    /// reclaimed.
    pub fn remove_subset(&mut self, key: &Spec<L::Value>) -> f64 {
        let original = self.nodes[self.root].covered_approx;
        self.remove_at(self.root, key);

        if self.nodes[self.root].contents.len() == 0 {
            let top = self.labeling().top();
            let n = &mut self.nodes[self.root];
            n.bounding_box = Spec::new(self.feature.labeling.cost(&top), top);
            n.contents = Contents::Leaf(Vec::new());
        }

        original - self.nodes[self.root].covered_approx
    }

    fn remove_at(&mut self, node: TreeKey, key: &Spec<L::Value>) {
        if self
            .labeling()
            .subset(&self.nodes[node].bounding_box.value, &key.value)
        {
            // the whole subtree is subsumed
            let was_internal = matches!(self.nodes[node].contents, Contents::Internal(_));
            let contents = std::mem::replace(
                &mut self.nodes[node].contents,
                if was_internal { Contents::Internal(Vec::new()) } else { Contents::Leaf(Vec::new()) },
            );
            if let Contents::Internal(children) = contents {
                for child in children {
                    self.free_subtree(child);
                }
            }
            self.nodes[node].covered_approx = 0.0;
            return;
        }

        let is_leaf = matches!(self.nodes[node].contents, Contents::Leaf(_));
        if is_leaf {
            let labeling = &self.feature.labeling;
            let n = &mut self.nodes[node];
            if let Contents::Leaf(entries) = &mut n.contents {
                let mut dropped = 0.0;
                entries.retain(|(entry_key, _)| {
                    let gone = labeling.subset(&entry_key.value, &key.value);
                    if gone {
                        dropped += entry_key.cost;
                    }
                    !gone
                });
                n.covered_approx -= dropped;
            }
        } else {
            let children = match &self.nodes[node].contents {
                Contents::Internal(children) => children.clone(),
                Contents::Leaf(_) => unreachable!(),
            };
            for &child in &children {
                if self
                    .labeling()
                    .meet(&self.nodes[child].bounding_box.value, &key.value)
                    .is_some()
                {
                    let before = self.nodes[child].covered_approx;
                    self.remove_at(child, key);
                    let after = self.nodes[child].covered_approx;
                    self.nodes[node].covered_approx -= before - after;
                }
            }
            let mut survivors = Vec::with_capacity(children.len());
            for child in children {
                if self.nodes[child].contents.len() > 0 {
                    survivors.push(child);
                } else {
                    self.nodes.remove(child);
                }
            }
            self.nodes[node].contents = Contents::Internal(survivors);
        }

        assert!(
            node == self.root || self.nodes[node].contents.len() > 0,
            "subset removal emptied a non-root node"
        );

        // re-join the surviving objects from scratch
        let rebuilt = match &self.nodes[node].contents {
            Contents::Leaf(entries) => self
                .feature
                .labeling
                .infer(entries.iter().map(|(k, _)| &k.value)),
            Contents::Internal(children) => self.feature.labeling.infer(
                children
                    .iter()
                    .map(|&c| &self.nodes[c].bounding_box.value)
                    .collect::<Vec<_>>(),
            ),
        };
        if let Some(bb) = rebuilt {
            self.nodes[node].bounding_box = bb;
        }
    }

    fn free_subtree(&mut self, node: TreeKey) {
        if let Some(n) = self.nodes.remove(node) {
            if let Contents::Internal(children) = n.contents {
                for child in children {
                    self.free_subtree(child);
                }
            }
        }
    }

    /// Sum of `covered_approx` over the parts of the tree contained in `key`.
    pub fn get_cover(&self, key: &Spec<L::Value>) -> f64 {
        self.cover_at(self.root, key)
    }

    fn cover_at(&self, node: TreeKey, key: &Spec<L::Value>) -> f64 {
        let n = &self.nodes[node];
        if self.labeling().subset(&n.bounding_box.value, &key.value) {
            return n.covered_approx;
        }
        match &n.contents {
            Contents::Leaf(entries) => entries
                .iter()
                .filter(|(entry_key, _)| self.labeling().subset(&entry_key.value, &key.value))
                .map(|(entry_key, _)| entry_key.cost)
                .sum(),
            Contents::Internal(children) => children
                .iter()
                .map(|&child| {
                    let bb = &self.nodes[child].bounding_box;
                    if self.labeling().subset(&bb.value, &key.value) {
                        self.nodes[child].covered_approx
                    } else if self.labeling().meet(&bb.value, &key.value).is_some() {
                        self.cover_at(child, key)
                    } else {
                        0.0
                    }
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{Ipv4Prefix, Ipv4PrefixLabeling};

    fn p(s: &str) -> Ipv4Prefix {
        s.parse().unwrap()
    }

    fn host_spec(s: &str) -> Spec<Ipv4Prefix> {
        Spec::new(1.0, p(s))
    }

    fn subnet_index(feature: &Feature<Ipv4PrefixLabeling>) -> RTreeIndex<'_, Ipv4PrefixLabeling, usize> {
        let mut index = RTreeIndex::new(feature);
        for i in 0..256 {
            index.insert(host_spec(&format!("192.186.1.{i}/32")), i);
        }
        index
    }

    #[test]
    fn subset_queries_count_exactly_the_covered_hosts() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let index = subnet_index(&feature);

        let subsets = index.get_subsets(&Spec::new(4.0, p("192.186.1.0/30")));
        assert_eq!(subsets.len(), 4);

        let all = index.get_subsets(&Spec::new(256.0, p("192.186.1.0/24")));
        assert_eq!(all.len(), 256);

        let none = index.get_subsets(&Spec::new(256.0, p("10.0.0.0/24")));
        assert!(none.is_empty());
    }

    #[test]
    fn subset_removal_reclaims_the_covered_cost() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let mut index = subnet_index(&feature);

        let reclaimed = index.remove_subset(&Spec::new(4.0, p("192.186.1.0/30")));
        assert_eq!(reclaimed, 4.0);

        let rest = index.remove_subset(&Spec::new(256.0, p("192.186.1.0/24")));
        assert_eq!(rest, 252.0);

        assert!(index.get_subsets(&Spec::new(256.0, p("192.186.1.0/24"))).is_empty());
    }

    #[test]
    fn removal_resets_an_emptied_tree_for_reuse() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let mut index = subnet_index(&feature);
        index.remove_subset(&Spec::new(256.0, p("192.186.1.0/24")));

        index.insert(host_spec("10.0.0.1/32"), 1);
        assert_eq!(index.get_subsets(&Spec::new(256.0, p("10.0.0.0/24"))).len(), 1);
    }

    #[test]
    fn knn_returns_the_host_itself_first() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let index = subnet_index(&feature);

        let near = index.get_knn_approx(&host_spec("192.186.1.0/32"), 2);
        assert_eq!(near.len(), 2);
        assert_eq!(near[0].0.value, p("192.186.1.0/32"));
        // the nearest other host shares the /31
        assert_eq!(near[1].0.value, p("192.186.1.1/32"));
    }

    #[test]
    fn approximate_and_precise_knn_agree_on_the_closest_host() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let index = subnet_index(&feature);

        for probe in ["192.186.1.7/32", "192.186.1.200/32"] {
            let approx = index.get_knn_approx(&host_spec(probe), 1);
            let precise = index.get_knn_precise(&host_spec(probe), 1);
            assert_eq!(approx[0].0.value, precise[0].0.value);
        }
    }

    #[test]
    fn cover_accounts_for_contained_subtrees() {
        let feature = Feature::new("ip", Ipv4PrefixLabeling);
        let index = subnet_index(&feature);

        assert_eq!(index.get_cover(&Spec::new(4.0, p("192.186.1.0/30"))), 4.0);
        assert_eq!(index.get_cover(&Spec::new(256.0, p("192.186.1.0/24"))), 256.0);
        assert_eq!(index.get_cover(&Spec::new(1.0, p("10.0.0.1/32"))), 0.0);
    }
}

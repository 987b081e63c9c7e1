use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cluster::{DistanceMeasure, HierarchicalClustering, IntentInfo, MergeCandidate};
use crate::index::RTreeIndex;
use crate::labeling::{Feature, Labeling, Spec};

impl<V: Clone + PartialEq + std::fmt::Debug> HierarchicalClustering<V> {
    /// The R-tree-backed variant of [`cluster`](Self::cluster).
    ///
    /// Neighbor buckets are bypassed entirely: a cluster's partner is the
    /// second result of an approximate 2-nearest-neighbor query against the
    /// index, and subsumption absorption is a single subset query per merge.
    /// The emitted history has the same shape, but merges may differ from the
    /// bucket variant because the nearest-neighbor search is approximate.
    pub fn cluster_indexed<L>(&mut self, flows: &[V], feature: &Feature<L>) -> Vec<Spec<V>>
    where
        L: Labeling<Value = V>,
    {
        self.cluster_indexed_with(flows, feature, |_| {})
    }

    pub fn cluster_indexed_with<L>(
        &mut self,
        flows: &[V],
        feature: &Feature<L>,
        mut observer: impl FnMut(&IntentInfo),
    ) -> Vec<Spec<V>>
    where
        L: Labeling<Value = V>,
    {
        let labeling = &feature.labeling;

        self.clusters = flows.iter().map(|f| labeling.join(f, f)).collect();
        self.parents = (0..self.clusters.len()).collect();
        self.remaining = (0..self.clusters.len()).collect();
        info!(count = self.clusters.len(), "initial clusters added");

        let mut heap: BinaryHeap<Reverse<MergeCandidate<V>>> = BinaryHeap::new();
        let mut overall_cost: f64 = self.clusters.iter().map(|c| c.cost).sum();
        let start = Instant::now();

        let mut index = RTreeIndex::new(feature);
        for i in 0..self.clusters.len() {
            index.insert(self.clusters[i].clone(), i);
        }
        info!(seconds = start.elapsed().as_secs_f64(), "finished indexing flows");

        for i in 0..self.clusters.len() {
            debug!(cluster = i, "adding initial distances");
            if let Some(candidate) = candidate_for(labeling, &index, &self.clusters, i) {
                heap.push(Reverse(candidate));
            }
        }

        self.push_step(overall_cost, start);
        self.intents.push(IntentInfo {
            k: self.remaining.len(),
            added: self.remaining.iter().copied().collect(),
            removed: Vec::new(),
        });
        observer(self.intents.last().expect("intent was just pushed"));

        while self.remaining.len() > self.config.cluster_count {
            debug!(remaining = self.remaining.len(), "merging");

            let best = loop {
                let Reverse(candidate) = heap
                    .pop()
                    .expect("candidate heap exhausted before reaching the target cluster count");
                let (a, b) = candidate.pair;
                match (self.remaining.contains(&a), self.remaining.contains(&b)) {
                    (true, true) => break candidate,
                    (true, false) => {
                        if let Some(c) = candidate_for(labeling, &index, &self.clusters, a) {
                            heap.push(Reverse(c));
                        }
                    }
                    (false, true) => {
                        if let Some(c) = candidate_for(labeling, &index, &self.clusters, b) {
                            heap.push(Reverse(c));
                        }
                    }
                    (false, false) => {}
                }
            };

            let new_id = self.clusters.len();
            let (a, b) = best.pair;
            info!(
                dist = best.dist,
                new_id,
                merged = ?best.pair,
                value = %labeling.render(&best.spec.value),
                "best merge"
            );

            overall_cost += best.dist;
            self.clusters.push(best.spec.clone());
            self.remaining.remove(&a);
            self.remaining.remove(&b);
            self.parents.push(new_id);

            // the merged endpoints are themselves subsets of the new cluster,
            // so the subset sweep removes and records them along the way
            let subsumed: Vec<usize> = index
                .get_subsets(&best.spec)
                .into_iter()
                .map(|(_, value)| value)
                .collect();
            index.remove_subset(&best.spec);

            overall_cost -= subsumed.iter().map(|&c| self.clusters[c].cost).sum::<f64>();
            let mut removed = Vec::with_capacity(subsumed.len());
            for &c in &subsumed {
                debug!(absorbed = c, value = %labeling.render(&self.clusters[c].value), "subsumed");
                self.remaining.remove(&c);
                self.parents[c] = new_id;
                removed.push(c);
            }

            self.remaining.insert(new_id);
            index.insert(best.spec.clone(), new_id);

            if self.remaining.len() > 1
                && let Some(candidate) = candidate_for(labeling, &index, &self.clusters, new_id)
            {
                heap.push(Reverse(candidate));
            }

            self.push_step(overall_cost, start);
            debug!(overall_cost, "cumulative cost");

            self.intents.push(IntentInfo {
                k: self.remaining.len(),
                added: vec![new_id],
                removed,
            });
            observer(self.intents.last().expect("intent was just pushed"));
        }

        info!(seconds = start.elapsed().as_secs_f64(), "clustering finished");

        self.remaining.iter().map(|&c| self.clusters[c].clone()).collect()
    }
}

/// Builds the merge candidate pairing `c` with its approximate nearest
/// neighbor. The indexed variant always scores by cost gain.
fn candidate_for<L: Labeling>(
    labeling: &L,
    index: &RTreeIndex<'_, L, usize>,
    clusters: &[Spec<L::Value>],
    c: usize,
) -> Option<MergeCandidate<L::Value>> {
    let partner = nearest_partner(index, clusters, c)?;
    let spec = labeling.join(&clusters[c].value, &clusters[partner].value);
    let dist = DistanceMeasure::CostGain.eval(&clusters[c], &clusters[partner], &spec);
    Some(MergeCandidate { dist, spec, pair: (c, partner) })
}

/// The nearest live cluster other than `c`: the second result of an
/// approximate 2-nearest-neighbor query, which normally returns `c` itself
/// first.
fn nearest_partner<L: Labeling>(
    index: &RTreeIndex<'_, L, usize>,
    clusters: &[Spec<L::Value>],
    c: usize,
) -> Option<usize> {
    let near = index.get_knn_approx(&clusters[c], 2);
    if near.len() < 2 {
        debug_assert!(near.first().is_none_or(|(_, v)| *v == c));
        return None;
    }
    if near[0].1 == c {
        Some(near[1].1)
    } else {
        warn!(cluster = c, "nearest neighbor was not the cluster itself");
        assert_eq!(near[1].1, c, "2-NN of an indexed cluster must include it");
        Some(near[0].1)
    }
}

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::labeling::{Feature, Labeling, Spec};

mod indexed;
mod persist;

/// How a candidate merge is scored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMeasure {
    /// The cost of the joined cluster.
    JoinCost,
    /// The cost the join adds over its two inputs.
    #[default]
    CostGain,
}

impl DistanceMeasure {
    pub fn eval<V>(&self, a: &Spec<V>, b: &Spec<V>, joined: &Spec<V>) -> f64 {
        match self {
            DistanceMeasure::JoinCost => joined.cost,
            DistanceMeasure::CostGain => joined.cost - a.cost - b.cost,
        }
    }
}

/// One step of the merge history: at step `k` the clusters in `added` became
/// live and the clusters in `removed` stopped being live. Replaying the
/// stream from the initial step reproduces every intermediate clustering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentInfo {
    pub k: usize,
    pub added: Vec<usize>,
    pub removed: Vec<usize>,
}

/// Per-step `(k, score, time)` record for the stats artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub k: usize,
    pub score: f64,
    pub seconds: f64,
}

/// Driver configuration.
///
/// `batch_size == 0` means every batch covers all remaining clusters, which
/// makes the greedy choice exact; smaller batches trade quality for speed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stop once this many clusters remain.
    pub cluster_count: usize,
    /// Peers sampled per scan; 0 uses everything.
    pub batch_size: usize,
    pub distance: DistanceMeasure,
    /// Closest-neighbor candidates cached per cluster.
    pub bucket_size: usize,
    /// Seed for the sampling PRNG; identical seeds give identical runs.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_count: 1,
            batch_size: 0,
            distance: DistanceMeasure::CostGain,
            bucket_size: 3,
            seed: 10,
        }
    }
}

/// A candidate merge of the cluster pair `(a, b)`, ordered by distance with
/// deterministic tie-breaking through the joined cost and the id pair.
#[derive(Clone, Debug)]
struct MergeCandidate<V> {
    dist: f64,
    spec: Spec<V>,
    pair: (usize, usize),
}

impl<V> PartialEq for MergeCandidate<V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl<V> Eq for MergeCandidate<V> {}
impl<V> PartialOrd for MergeCandidate<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<V> Ord for MergeCandidate<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.spec.cost.total_cmp(&other.spec.cost))
            .then_with(|| self.pair.cmp(&other.pair))
    }
}

/// Greedy agglomerative clustering over a labeling lattice.
///
/// Starting from one cluster per flow, repeatedly merges the pair whose join
/// costs the least extra, absorbing any cluster the new generalization
/// subsumes, until [`ClusterConfig::cluster_count`] clusters remain. The
/// incremental [`IntentInfo`] history and the per-step stats are kept for
/// replay and evaluation.
///
/// Neighbor candidates are cached in small per-cluster buckets that are
/// recomputed only when they run dry; the global priority queue is lazy, so
/// stale candidates are simply discarded on pop. The queue can grow beyond
/// `O(N log N)` when buckets recompute often.
pub struct HierarchicalClustering<V> {
    config: ClusterConfig,
    clusters: Vec<Spec<V>>,
    parents: Vec<usize>,
    stats: Vec<StatRecord>,
    intents: Vec<IntentInfo>,
    closest: Vec<Vec<MergeCandidate<V>>>,
    /// `remaining` sizes at which a bucket had to be refilled.
    recomputations: Vec<usize>,
    remaining: BTreeSet<usize>,
    rng: StdRng,
}

impl<V: Clone + PartialEq + std::fmt::Debug> HierarchicalClustering<V> {
    pub fn new(config: ClusterConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            clusters: Vec::new(),
            parents: Vec::new(),
            stats: Vec::new(),
            intents: Vec::new(),
            closest: Vec::new(),
            recomputations: Vec::new(),
            remaining: BTreeSet::new(),
            rng,
        }
    }

    /// All clusters ever created: the initial self-joins first, then every
    /// merge product in creation order.
    pub fn clusters(&self) -> &[Spec<V>] {
        &self.clusters
    }

    /// `parents[i]` is the cluster that absorbed `i`, or `i` itself while it
    /// is live; always `parents[i] >= i`.
    pub fn parents(&self) -> &[usize] {
        &self.parents
    }

    pub fn intents(&self) -> &[IntentInfo] {
        &self.intents
    }

    pub fn stats(&self) -> &[StatRecord] {
        &self.stats
    }

    pub fn remaining(&self) -> &BTreeSet<usize> {
        &self.remaining
    }

    /// How many times a neighbor bucket had to be refilled.
    pub fn recomputation_count(&self) -> usize {
        self.recomputations.len()
    }

    /// Runs the clustering and returns the final live clusters.
    pub fn cluster<L>(&mut self, flows: &[V], feature: &Feature<L>) -> Vec<Spec<V>>
    where
        L: Labeling<Value = V>,
    {
        self.cluster_with(flows, feature, |_| {})
    }

    /// Like [`cluster`](Self::cluster), invoking `observer` after every
    /// emitted [`IntentInfo`].
    pub fn cluster_with<L>(
        &mut self,
        flows: &[V],
        feature: &Feature<L>,
        mut observer: impl FnMut(&IntentInfo),
    ) -> Vec<Spec<V>>
    where
        L: Labeling<Value = V>,
    {
        let labeling = &feature.labeling;
        let batch_size = self.effective_batch_size(flows.len());

        self.clusters = flows.iter().map(|f| labeling.join(f, f)).collect();
        self.parents = (0..self.clusters.len()).collect();
        self.closest = vec![Vec::new(); self.clusters.len()];
        self.remaining = (0..self.clusters.len()).collect();
        info!(count = self.clusters.len(), "initial clusters added");

        let mut heap: BinaryHeap<Reverse<MergeCandidate<V>>> = BinaryHeap::new();
        let mut overall_cost: f64 = self.clusters.iter().map(|c| c.cost).sum();
        let start = Instant::now();

        // initial neighbor scan: each cluster samples peers with higher ids
        for i in 0..self.clusters.len() {
            debug!(cluster = i, "adding initial distances");
            let batch: Vec<usize> = if self.clusters.len() - i <= batch_size {
                (i + 1..self.clusters.len()).collect()
            } else {
                (0..batch_size)
                    .map(|_| self.rng.gen_range(i + 1..self.clusters.len()))
                    .collect()
            };
            self.update_closest(i, &batch, false, true, labeling);
            if let Some(candidate) = self.closest_candidate(i, false, labeling) {
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

            // drain stale candidates, repairing buckets for live endpoints
            let best = loop {
                let Reverse(candidate) = heap
                    .pop()
                    .expect("candidate heap exhausted before reaching the target cluster count");
                let (a, b) = candidate.pair;
                match (self.remaining.contains(&a), self.remaining.contains(&b)) {
                    (true, true) => break candidate,
                    (true, false) => {
                        if let Some(repaired) = self.closest_candidate(a, true, labeling) {
                            heap.push(Reverse(repaired));
                        }
                    }
                    (false, true) => {
                        if let Some(repaired) = self.closest_candidate(b, true, labeling) {
                            heap.push(Reverse(repaired));
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
            let mut removed = vec![a, b];

            self.closest.push(Vec::new());
            self.parents.push(new_id);
            self.parents[a] = new_id;
            self.parents[b] = new_id;

            // scan batches for clusters the new generalization swallows; keep
            // drawing while whole batches keep disappearing
            loop {
                let batch = self.get_batch(batch_size);
                let subsumed = self.update_closest(new_id, &batch, true, true, labeling);

                overall_cost -= subsumed.iter().map(|&c| self.clusters[c].cost).sum::<f64>();
                for &c in &subsumed {
                    self.remaining.remove(&c);
                    self.parents[c] = new_id;
                }
                removed.extend_from_slice(&subsumed);

                if batch_size >= self.remaining.len() + subsumed.len()
                    || subsumed.len() < batch.len()
                {
                    break;
                }
                warn!("all of the batch was subsumed, drawing another");
            }

            self.remaining.insert(new_id);
            if let Some(candidate) = self.closest_candidate(new_id, false, labeling) {
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

        info!(
            seconds = start.elapsed().as_secs_f64(),
            recomputations = self.recomputations.len(),
            "clustering finished"
        );

        self.remaining.iter().map(|&c| self.clusters[c].clone()).collect()
    }

    fn effective_batch_size(&self, flow_count: usize) -> usize {
        if self.config.batch_size == 0 {
            flow_count
        } else {
            self.config.batch_size
        }
    }

    fn push_step(&mut self, overall_cost: f64, start: Instant) {
        self.stats.push(StatRecord {
            k: self.remaining.len(),
            score: overall_cost,
            seconds: start.elapsed().as_secs_f64(),
        });
    }

    /// Joins `i` against each batch member, updating the neighbor buckets.
    /// With `check_subsumption` set, batch members contained in `i` are
    /// returned instead of becoming candidates.
    fn update_closest<L>(
        &mut self,
        i: usize,
        batch: &[usize],
        check_subsumption: bool,
        update_other: bool,
        labeling: &L,
    ) -> Vec<usize>
    where
        L: Labeling<Value = V>,
    {
        let mut subsumed = Vec::new();
        for &j in batch {
            if check_subsumption
                && labeling.subset(&self.clusters[j].value, &self.clusters[i].value)
            {
                debug!(
                    winner = i,
                    absorbed = j,
                    value = %labeling.render(&self.clusters[j].value),
                    "subsumed"
                );
                subsumed.push(j);
                continue;
            }

            let spec = labeling.join(&self.clusters[i].value, &self.clusters[j].value);
            let dist = self.config.distance.eval(&self.clusters[i], &self.clusters[j], &spec);

            Self::bucket_insert(
                &mut self.closest[i],
                MergeCandidate { dist, spec: spec.clone(), pair: (i, j) },
                self.config.bucket_size,
            );
            if update_other {
                Self::bucket_insert(
                    &mut self.closest[j],
                    MergeCandidate { dist, spec, pair: (j, i) },
                    self.config.bucket_size,
                );
            }
        }
        subsumed
    }

    /// Buckets are kept sorted and truncated, so the head is always the
    /// closest known neighbor.
    fn bucket_insert(bucket: &mut Vec<MergeCandidate<V>>, candidate: MergeCandidate<V>, cap: usize) {
        let at = bucket
            .binary_search_by(|probe| probe.cmp(&candidate))
            .unwrap_or_else(|at| at);
        bucket.insert(at, candidate);
        bucket.truncate(cap);
    }

    /// The current head of `c`'s bucket, discarding heads whose partner died.
    /// An empty bucket is refilled from a fresh batch when `recompute` is
    /// set; refills are counted for diagnostics.
    fn closest_candidate<L>(
        &mut self,
        c: usize,
        recompute: bool,
        labeling: &L,
    ) -> Option<MergeCandidate<V>>
    where
        L: Labeling<Value = V>,
    {
        debug_assert!(self.remaining.contains(&c));
        loop {
            let head_alive = match self.closest[c].first() {
                None => break,
                Some(head) => self.remaining.contains(&head.pair.1),
            };
            if head_alive {
                return Some(self.closest[c][0].clone());
            }
            self.closest[c].remove(0);
        }

        if recompute {
            let batch_size = self.effective_batch_size(self.clusters.len());
            let mut batch = self.get_batch(batch_size);
            batch.retain(|&j| j != c);
            self.update_closest(c, &batch, false, false, labeling);
            self.recomputations.push(self.remaining.len());
            return self.closest_candidate(c, false, labeling);
        }
        None
    }

    /// A batch of live cluster ids: everything when few remain, otherwise a
    /// uniform sample, drawn by rejection when the live set is dense enough
    /// for that to be cheaper.
    fn get_batch(&mut self, batch_size: usize) -> Vec<usize> {
        if self.remaining.len() <= batch_size {
            return self.remaining.iter().copied().collect();
        }

        let total = self.clusters.len();
        let dense = ((total as f64 / self.remaining.len() as f64) * batch_size as f64)
            < self.remaining.len() as f64;

        let mut batch = BTreeSet::new();
        if dense {
            while batch.len() < batch_size {
                let r = self.rng.gen_range(0..total);
                if self.remaining.contains(&r) {
                    batch.insert(r);
                }
            }
        } else {
            let live: Vec<usize> = self.remaining.iter().copied().collect();
            let picks = rand::seq::index::sample(&mut self.rng, live.len(), batch_size);
            for idx in picks {
                batch.insert(live[idx]);
            }
        }
        batch.into_iter().collect()
    }
}

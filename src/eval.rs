use std::collections::BTreeMap;
use std::hash::Hash;

use hashbrown::HashSet;
use rapidhash::quality::RandomState;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::IntentInfo;
use crate::index::RTreeIndex;
use crate::labeling::{Feature, Labeling, Spec};
use crate::lattice::{LatticeKey, MeetSemiLattice};

/// Maps each step of an intent history to the held-out flows newly covered at
/// that step: a flow counts for the first `k` whose added clusters contain
/// it, and never again.
pub struct CoverMapGenerator<'a, L: Labeling> {
    name: &'static str,
    flows: &'a [L::Value],
    clusters: &'a [Spec<L::Value>],
    feature: &'a Feature<L>,
    /// Retrieve covered flows through an R-tree instead of a linear scan.
    pub use_index: bool,
    /// Run both retrieval paths and assert they agree.
    pub index_sanity_check: bool,
}

impl<'a, L: Labeling> CoverMapGenerator<'a, L> {
    pub fn new(
        name: &'static str,
        flows: &'a [L::Value],
        clusters: &'a [Spec<L::Value>],
        feature: &'a Feature<L>,
    ) -> Self {
        Self { name, flows, clusters, feature, use_index: true, index_sanity_check: false }
    }

    /// Flow indices newly covered per step, keyed by `k`.
    pub fn cover_map(&self, intents: &[IntentInfo]) -> BTreeMap<usize, Vec<usize>> {
        info!(name = self.name, flows = self.flows.len(), "building cover map");

        let mut index = self.use_index.then(|| {
            let mut index = RTreeIndex::with_node_sizes(self.feature, 2, 10);
            for (f, flow) in self.flows.iter().enumerate() {
                index.insert(self.feature.labeling.join(flow, flow), f);
            }
            index
        });

        let mut remaining: Vec<usize> = (0..self.flows.len()).collect();
        let mut cover_map = BTreeMap::new();

        for info in intents {
            debug!(k = info.k, new_intents = ?info.added, "covering");
            let accepted = match (&mut index, self.index_sanity_check) {
                (Some(index), false) => self.accepted_by_index(index, &info.added),
                (Some(index), true) => {
                    warn!("running the indexed cover map against the linear scan");
                    let from_index = self.accepted_by_index(index, &info.added);
                    let from_scan = self.accepted_by_scan(&remaining, &info.added);
                    let mut a = from_index.clone();
                    let mut b = from_scan.clone();
                    a.sort_unstable();
                    b.sort_unstable();
                    assert_eq!(a, b, "index and scan cover maps disagree at k={}", info.k);
                    from_scan
                }
                (None, _) => self.accepted_by_scan(&remaining, &info.added),
            };
            remaining.retain(|f| !accepted.contains(f));
            debug!(k = info.k, accepted = accepted.len(), remaining = remaining.len(), "covered");
            cover_map.insert(info.k, accepted);
        }

        cover_map
    }

    fn accepted_by_index(
        &self,
        index: &mut RTreeIndex<'a, L, usize>,
        new_intents: &[usize],
    ) -> Vec<usize> {
        let mut accepted = Vec::new();
        for &i in new_intents {
            // removing what was just retrieved prevents double counting at
            // later steps; a step may legitimately cover nothing
            accepted.extend(index.get_subsets(&self.clusters[i]).into_iter().map(|(_, f)| f));
            index.remove_subset(&self.clusters[i]);
        }
        accepted
    }

    fn accepted_by_scan(&self, remaining: &[usize], new_intents: &[usize]) -> Vec<usize> {
        remaining
            .iter()
            .copied()
            .filter(|&f| {
                new_intents.iter().any(|&i| {
                    self.feature
                        .labeling
                        .subset(&self.flows[f], &self.clusters[i].value)
                })
            })
            .collect()
    }
}

/// Per-step report of the cost-based evaluator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CostReport {
    pub true_positive: f64,
    pub cost: f64,
    pub cardinality_sum: f64,
}

/// Tracks, per step, the cumulative cardinality of covered positive flows
/// against the total cost and cardinality of the live clusters.
pub struct CostBasedEvaluator<'a, L: Labeling> {
    cover: CoverMapGenerator<'a, L>,
    flows: &'a [L::Value],
    clusters: &'a [Spec<L::Value>],
    feature: &'a Feature<L>,
}

impl<'a, L: Labeling> CostBasedEvaluator<'a, L> {
    pub fn new(
        flows: &'a [L::Value],
        clusters: &'a [Spec<L::Value>],
        feature: &'a Feature<L>,
    ) -> Self {
        Self {
            cover: CoverMapGenerator::new("positive", flows, clusters, feature),
            flows,
            clusters,
            feature,
        }
    }

    pub fn evaluate(&self, intents: &[IntentInfo]) -> BTreeMap<usize, CostReport> {
        let cover_map = self.cover.cover_map(intents);

        let labeling = &self.feature.labeling;
        let mut report = BTreeMap::new();
        let mut true_positive = 0.0;
        let mut cost = 0.0;
        let mut cardinality_sum = 0.0;

        for info in intents {
            true_positive += cover_map[&info.k]
                .iter()
                .map(|&f| labeling.cardinality(&self.flows[f]))
                .sum::<f64>();
            cost += info.added.iter().map(|&c| self.clusters[c].cost).sum::<f64>()
                - info.removed.iter().map(|&c| self.clusters[c].cost).sum::<f64>();
            cardinality_sum += info
                .added
                .iter()
                .map(|&c| labeling.cardinality(&self.clusters[c].value))
                .sum::<f64>()
                - info
                    .removed
                    .iter()
                    .map(|&c| labeling.cardinality(&self.clusters[c].value))
                    .sum::<f64>();
            report.insert(info.k, CostReport { true_positive, cost, cardinality_sum });
        }
        report
    }
}

/// Per-step confusion counts of the sample-based evaluator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleReport {
    pub true_positive: f64,
    pub false_positive: f64,
    pub true_negative: f64,
    pub false_negative: f64,
}

/// Replays the history against a positive and a negative held-out flow set,
/// reporting confusion counts per step.
pub struct SampleBasedEvaluator<'a, L: Labeling> {
    positive: CoverMapGenerator<'a, L>,
    negative: CoverMapGenerator<'a, L>,
    p_flows: &'a [L::Value],
    n_flows: &'a [L::Value],
    feature: &'a Feature<L>,
}

impl<'a, L: Labeling> SampleBasedEvaluator<'a, L> {
    pub fn new(
        p_flows: &'a [L::Value],
        n_flows: &'a [L::Value],
        clusters: &'a [Spec<L::Value>],
        feature: &'a Feature<L>,
    ) -> Self {
        Self {
            positive: CoverMapGenerator::new("positive", p_flows, clusters, feature),
            negative: CoverMapGenerator::new("negative", n_flows, clusters, feature),
            p_flows,
            n_flows,
            feature,
        }
    }

    pub fn evaluate(&self, intents: &[IntentInfo]) -> BTreeMap<usize, SampleReport> {
        let p_cover = self.positive.cover_map(intents);
        let n_cover = self.negative.cover_map(intents);

        let labeling = &self.feature.labeling;
        let card = |flows: &[L::Value], ids: &[usize]| {
            ids.iter().map(|&f| labeling.cardinality(&flows[f])).sum::<f64>()
        };

        let mut true_positive = 0.0;
        let mut false_positive = 0.0;
        let mut true_negative: f64 = self.n_flows.iter().map(|f| labeling.cardinality(f)).sum();
        let mut false_negative: f64 = self.p_flows.iter().map(|f| labeling.cardinality(f)).sum();

        let mut report = BTreeMap::new();
        for info in intents {
            let p_new = card(self.p_flows, &p_cover[&info.k]);
            let n_new = card(self.n_flows, &n_cover[&info.k]);
            true_positive += p_new;
            false_positive += n_new;
            true_negative -= n_new;
            false_negative -= p_new;
            report.insert(
                info.k,
                SampleReport { true_positive, false_positive, true_negative, false_negative },
            );
        }
        report
    }
}

/// Cover maps over lattice atoms instead of held-out flows: each step covers
/// the not-yet-covered subtree of its added clusters in the meet
/// semi-lattice, and coverage is the cardinality sum of those nodes.
pub struct AtomCoverMapGenerator<'a, L: Labeling>
where
    L::Value: Eq + Hash,
{
    lattice: MeetSemiLattice<'a, L>,
    clusters: &'a [Spec<L::Value>],
}

impl<'a, L: Labeling> AtomCoverMapGenerator<'a, L>
where
    L::Value: Eq + Hash,
{
    pub fn new(clusters: &'a [Spec<L::Value>], feature: &'a Feature<L>) -> Self {
        info!(clusters = clusters.len(), "building the meet semi-lattice");
        let mut lattice = MeetSemiLattice::new(feature);
        for c in clusters {
            lattice.insert(c.value.clone());
        }
        lattice.compute_all_cardinalities();
        info!(nodes = lattice.len(), "lattice constructed");
        Self { lattice, clusters }
    }

    fn accepted(&self, new_intents: &[usize]) -> HashSet<LatticeKey, RandomState> {
        let mut set = HashSet::with_hasher(RandomState::new());
        for &i in new_intents {
            set.extend(self.lattice.label_subtree(&self.clusters[i].value));
        }
        set
    }

    /// Newly covered lattice nodes per step, keyed by `k`.
    pub fn cover_map(&self, intents: &[IntentInfo]) -> BTreeMap<usize, Vec<LatticeKey>> {
        let mut covered: HashSet<LatticeKey, RandomState> = HashSet::with_hasher(RandomState::new());
        let mut cover_map = BTreeMap::new();
        for info in intents {
            let new_accepted: Vec<LatticeKey> = self
                .accepted(&info.added)
                .into_iter()
                .filter(|n| !covered.contains(n))
                .collect();
            covered.extend(new_accepted.iter().copied());
            debug!(k = info.k, newly_covered = new_accepted.len(), "atom cover");
            cover_map.insert(info.k, new_accepted);
        }
        cover_map
    }

    /// Cumulative predicted-positive cardinality per step.
    pub fn evaluate(&mut self, intents: &[IntentInfo]) -> BTreeMap<usize, f64> {
        let cover_map = self.cover_map(intents);

        let mut report = BTreeMap::new();
        let mut covered = 0.0;
        for info in intents {
            covered += cover_map[&info.k]
                .iter()
                .map(|&n| self.lattice.cardinality(n))
                .sum::<f64>();
            report.insert(info.k, covered);
        }
        report
    }
}

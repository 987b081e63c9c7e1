//! Best-first search for the least-cost regex generalizing two paths.
//!
//! The search walks both inputs position by position while emitting output
//! labels. A single output label may consume several input elements on either
//! side; runs that do are rendered with a `+` marker. Costs multiply along
//! the output, and the number of emitted labels is capped by the shorter
//! input, which bounds the state space and guarantees termination.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bitflags::bitflags;
use hashbrown::{HashMap, HashSet};
use rapidhash::quality::RandomState;

use crate::hregex::{HRegex, HRegexElement};
use crate::labeling::{HierarchyLabeling, LabelId, Spec};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
    struct Flags: u8 {
        /// side 1 is mid-repetition on its current input element
        const HOLD1 = 0b001;
        /// side 2 is mid-repetition on its current input element
        const HOLD2 = 0b010;
        /// the current output label has consumed at least one element
        const FED   = 0b100;
    }
}

/// One node of the search graph.
///
/// `emitted` is the negated output length so far; keeping it negative makes
/// the queue break cost ties toward longer outputs, matching the goal
/// selection rule.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
struct State {
    emitted: i32,
    /// 1-based positions; `len + 1` means the side is exhausted.
    i: u32,
    j: u32,
    flags: Flags,
    label: LabelId,
}

struct Entry {
    est: f64,
    state: State,
    parent: Option<State>,
    g: f64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.est
            .total_cmp(&other.est)
            .then_with(|| self.state.cmp(&other.state))
            .then_with(|| self.parent.cmp(&other.parent))
            .then_with(|| self.g.total_cmp(&other.g))
    }
}

type Closed = HashMap<State, (f64, Option<State>), RandomState>;

fn push(queue: &mut BinaryHeap<Reverse<Entry>>, closed: &Closed, parent: State, state: State, g: f64) {
    if !closed.contains_key(&state) {
        // heuristic is the constant 1, so the estimate is the g-cost itself
        queue.push(Reverse(Entry { est: g, state, parent: Some(parent), g }));
    }
}

/// Output labels that may start at `pos`: ancestors of the current element,
/// plus ancestors of the next one while a repetition is still open, or every
/// label once the side is exhausted.
fn emission_choices(
    hierarchy: &HierarchyLabeling,
    elements: &[HRegexElement],
    pos: u32,
    holding: bool,
) -> HashSet<LabelId, RandomState> {
    let len = elements.len() as u32;
    let mut choices = HashSet::with_hasher(RandomState::new());
    if pos > len {
        choices.extend(hierarchy.label_ids());
        return choices;
    }
    choices.extend(hierarchy.ancestor_set(elements[(pos - 1) as usize].label).iter().copied());
    if holding && pos < len {
        choices.extend(hierarchy.ancestor_set(elements[pos as usize].label).iter().copied());
    }
    choices
}

pub(super) fn least_general(
    hierarchy: &HierarchyLabeling,
    dimension: f64,
    l1: &HRegex,
    l2: &HRegex,
) -> Spec<HRegex> {
    let e1 = l1.elements();
    let e2 = l2.elements();
    assert!(!e1.is_empty() && !e2.is_empty(), "cannot join an empty path");

    let len1 = e1.len() as u32;
    let len2 = e2.len() as u32;
    let cap = e1.len().min(e2.len()) as i32;

    let mut queue: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut closed: Closed = HashMap::with_hasher(RandomState::new());

    let p1 = hierarchy.ancestor_set(e1[0].label);
    let p2 = hierarchy.ancestor_set(e2[0].label);
    for label in p1.iter().copied().filter(|l| p2.contains(l)) {
        let g = hierarchy.label_cost(label);
        let state = State { emitted: -1, i: 1, j: 1, flags: Flags::empty(), label };
        queue.push(Reverse(Entry { est: g, state, parent: None, g }));
    }

    let mut best: Option<State> = None;

    while let Some(Reverse(Entry { state, parent, g, .. })) = queue.pop() {
        if closed.contains_key(&state) {
            continue;
        }
        closed.insert(state, (g, parent));

        debug_assert!(-state.emitted <= cap);

        if state.i > len1 && state.j > len2 {
            // a goal; keep the longest output with the best per-position cost
            best = Some(match best {
                None => state,
                Some(b) => {
                    let (bg, _) = closed[&b];
                    let better = g.powf(-1.0 / state.emitted as f64)
                        < bg.powf(-1.0 / b.emitted as f64);
                    if -state.emitted > -b.emitted && better { state } else { b }
                }
            });
            if -state.emitted < cap {
                continue;
            }
            return reconstruct(dimension, &closed, best.expect("goal was just recorded"));
        }

        let hold1 = state.flags.contains(Flags::HOLD1);
        let hold2 = state.flags.contains(Flags::HOLD2);
        let fed = state.flags.contains(Flags::FED);

        let a = (state.i <= len1).then(|| e1[(state.i - 1) as usize]);
        let b = (state.j <= len2).then(|| e2[(state.j - 1) as usize]);

        // dead ends: a held repetition with nothing left to repeat, or an
        // unfed label with an exhausted side
        if hold1 && !a.is_some_and(|a| a.multiple) {
            continue;
        }
        if hold2 && !b.is_some_and(|b| b.multiple) {
            continue;
        }
        if !fed && (a.is_none() || b.is_none()) {
            continue;
        }

        // extend a held repetition past its input element
        if hold1 {
            let a = a.expect("held side has a current element");
            if hierarchy.generalization_cost(a.label, state.label).is_finite() {
                let next = State { i: state.i + 1, flags: state.flags - Flags::HOLD1, ..state };
                push(&mut queue, &closed, state, next, g);
            }
        }
        if hold2 {
            let b = b.expect("held side has a current element");
            if hierarchy.generalization_cost(b.label, state.label).is_finite() {
                let next = State { j: state.j + 1, flags: state.flags - Flags::HOLD2, ..state };
                push(&mut queue, &closed, state, next, g);
            }
        }

        // start a new output label
        if fed && -state.emitted < cap {
            let c1 = emission_choices(hierarchy, e1, state.i, hold1);
            let c2 = emission_choices(hierarchy, e2, state.j, hold2);
            for label in c1.iter().copied().filter(|l| c2.contains(l)) {
                let next = State {
                    emitted: state.emitted - 1,
                    flags: state.flags - Flags::FED,
                    label,
                    ..state
                };
                push(&mut queue, &closed, state, next, g * hierarchy.label_cost(label));
            }
        }

        // consume input into the current label
        let cost_a = a.map_or(f64::INFINITY, |a| hierarchy.generalization_cost(a.label, state.label));
        let cost_b = b.map_or(f64::INFINITY, |b| hierarchy.generalization_cost(b.label, state.label));
        if !fed && cost_a.is_finite() && cost_b.is_finite() {
            // an unfed label must consume one element from each side at once
            let a = a.expect("finite cost implies a current element");
            let b = b.expect("finite cost implies a current element");
            let (ni, f1) = if a.multiple { (state.i, Flags::HOLD1) } else { (state.i + 1, Flags::empty()) };
            let (nj, f2) = if b.multiple { (state.j, Flags::HOLD2) } else { (state.j + 1, Flags::empty()) };
            let next = State { i: ni, j: nj, flags: f1 | f2 | Flags::FED, ..state };
            push(&mut queue, &closed, state, next, g);
        } else {
            // otherwise either side may feed the label on its own
            if cost_a.is_finite() {
                let a = a.expect("finite cost implies a current element");
                let (ni, f1) = if a.multiple { (state.i, Flags::HOLD1) } else { (state.i + 1, Flags::empty()) };
                let kept = state.flags & Flags::HOLD2;
                let next = State { i: ni, flags: f1 | kept | Flags::FED, ..state };
                push(&mut queue, &closed, state, next, g);
            }
            if cost_b.is_finite() {
                let b = b.expect("finite cost implies a current element");
                let (nj, f2) = if b.multiple { (state.j, Flags::HOLD2) } else { (state.j + 1, Flags::empty()) };
                let kept = state.flags & Flags::HOLD1;
                let next = State { j: nj, flags: f2 | kept | Flags::FED, ..state };
                push(&mut queue, &closed, state, next, g);
            }
        }
    }

    panic!("path join search exhausted without reaching a goal");
}

/// Walks the parent chain backwards, emitting one regex element per output
/// label. A label whose run spans more than two steps, or that closes while a
/// repetition is held open, consumed more than one element per side and gets
/// the `+` marker.
fn reconstruct(dimension: f64, closed: &Closed, goal: State) -> Spec<HRegex> {
    let (goal_cost, _) = closed[&goal];

    let mut elements = Vec::new();
    let mut steps = 0usize;
    let mut cursor = Some(goal);
    while let Some(state) = cursor {
        let (_, parent) = closed[&state];
        steps += 1;

        let starts_label = match parent {
            None => true,
            Some(p) => p.emitted != state.emitted,
        };
        if starts_label {
            let multiple = steps > 2 || state.flags.intersects(Flags::HOLD1 | Flags::HOLD2);
            elements.push(HRegexElement { label: state.label, multiple });
            steps = 0;
        }

        cursor = parent;
    }
    elements.reverse();

    let length = -goal.emitted as f64;
    let cost = goal_cost.powf(1.0 / length).powf(dimension);
    Spec::new(cost, HRegex::new(elements))
}

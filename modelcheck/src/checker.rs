// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exhaustive, single-shard breadth-first exploration of a [`Model`]'s
//! reachable state space.

use crate::branch::{Branch, DeltaEntropy};
use crate::model::Model;
use crate::progress::{ProgressReport, ProgressTicker};
use crate::radix_queue::DEFAULT_SEGMENTS;
use std::collections::{HashMap, VecDeque};

/// Outcome of an exhaustive run.
#[derive(Debug, Clone)]
pub struct CheckResult<S> {
    pub ok: bool,
    pub state_count: usize,
    pub branch_pop_count: u64,
    pub branch_push_count: u64,
    pub self_branch_count: u64,
    /// Present only when `ok` is `false`: the chain of states from the
    /// initial state to the one that failed its invariants.
    pub failing_trace: Option<Vec<S>>,
}

/// Runs the exhaustive BFS to completion (or until an invariant fails).
///
/// `SEGMENTS` bounds how many nondeterministic choices a single `step()` call
/// may record before a branch's delta overflows; raise it for models whose
/// `step` makes many `pick_int`/`pick_branch` calls per invocation.
pub fn check<M, const SEGMENTS: usize>(mut model: M) -> CheckResult<M::State>
where
    M: Model,
{
    check_with_progress::<M, SEGMENTS>(&mut model, ProgressTicker::default_interval())
}

/// Like [`check`], but reports progress to `model.report_progress` on
/// `interval`.
pub fn check_with_progress<M, const SEGMENTS: usize>(
    model: &mut M,
    interval: std::time::Duration,
) -> CheckResult<M::State>
where
    M: Model,
{
    let initial = model.initialize();
    let mut visited: HashMap<M::State, Option<M::State>> = HashMap::new();
    visited.insert(initial.clone(), None);

    let mut frontier: VecDeque<Branch<M::State, SEGMENTS>> = VecDeque::new();
    frontier.push_back(Branch::root(initial));

    let mut state_count = 1usize;
    let mut branch_pop_count = 0u64;
    let mut branch_push_count = 0u64;
    let mut self_branch_count = 0u64;
    let mut ticker = ProgressTicker::new(interval);

    while let Some(branch) = frontier.pop_front() {
        branch_pop_count += 1;

        model.enter_state(&branch.snapshot);
        if !model.check_invariants() {
            return fail(&visited, branch.snapshot, state_count, branch_pop_count, branch_push_count, self_branch_count);
        }

        let mut delta = branch.delta.clone();
        let mut entropy = DeltaEntropy {
            delta: &mut delta,
            history: Default::default(),
            new_deltas: Vec::new(),
        };
        model.step(&mut entropy);
        let siblings = entropy.new_deltas;

        if !model.check_stepwise_invariants() {
            return fail(&visited, branch.snapshot, state_count, branch_pop_count, branch_push_count, self_branch_count);
        }

        let after = model.normalize(model.leave_state());

        if after == branch.snapshot {
            self_branch_count += 1;
        } else if let std::collections::hash_map::Entry::Vacant(e) = visited.entry(after.clone()) {
            e.insert(Some(branch.snapshot.clone()));
            state_count += 1;
            frontier.push_back(Branch::root(after));
        }

        for delta in siblings {
            branch_push_count += 1;
            frontier.push_back(Branch {
                snapshot: branch.snapshot.clone(),
                delta,
            });
        }

        if ticker.is_due() {
            model.report_progress(&ProgressReport {
                state_count,
                branch_pop_count,
                branch_push_count,
                self_branch_count,
                elapsed: ticker.elapsed(),
                cross_shard_misses: 0,
            });
        }
    }

    CheckResult {
        ok: true,
        state_count,
        branch_pop_count,
        branch_push_count,
        self_branch_count,
        failing_trace: None,
    }
}

/// Convenience entry point using the default radix-queue segment count.
pub fn check_default<M: Model>(model: M) -> CheckResult<M::State> {
    check::<M, DEFAULT_SEGMENTS>(model)
}

fn fail<S: Clone + Eq + std::hash::Hash>(
    visited: &HashMap<S, Option<S>>,
    failing: S,
    state_count: usize,
    branch_pop_count: u64,
    branch_push_count: u64,
    self_branch_count: u64,
) -> CheckResult<S> {
    let mut trace = vec![failing.clone()];
    let mut current = failing;
    while let Some(Some(pred)) = visited.get(&current) {
        trace.push(pred.clone());
        current = pred.clone();
    }
    trace.reverse();
    CheckResult {
        ok: false,
        state_count,
        branch_pop_count,
        branch_push_count,
        self_branch_count,
        failing_trace: Some(trace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntropySource;

    /// A counter that can step up or down by one, bounded to `[0, MAX]`,
    /// exhaustively explored to confirm the checker visits exactly the
    /// reachable states and nothing more.
    struct BoundedCounter {
        max: i32,
        current: i32,
    }

    impl Model for BoundedCounter {
        type State = i32;

        fn initialize(&mut self) -> i32 {
            0
        }

        fn enter_state(&mut self, state: &i32) {
            self.current = *state;
        }

        fn step(&mut self, entropy: &mut dyn EntropySource) {
            let delta = entropy.pick_int(0, 1);
            if delta == 0 {
                self.current = (self.current - 1).max(0);
            } else {
                self.current = (self.current + 1).min(self.max);
            }
        }

        fn leave_state(&mut self) -> i32 {
            self.current
        }

        fn check_invariants(&self) -> bool {
            self.current >= 0 && self.current <= self.max
        }
    }

    #[test]
    fn visits_exactly_the_reachable_states() {
        let result = check_default(BoundedCounter { max: 5, current: 0 });
        assert!(result.ok);
        assert_eq!(result.state_count, 6);
    }

    struct BrokenCounter {
        current: i32,
        step_count: u32,
    }

    impl Model for BrokenCounter {
        type State = i32;

        fn initialize(&mut self) -> i32 {
            0
        }

        fn enter_state(&mut self, state: &i32) {
            self.current = *state;
        }

        fn step(&mut self, entropy: &mut dyn EntropySource) {
            self.step_count += 1;
            let delta = entropy.pick_int(0, 1);
            self.current += if delta == 0 { -1 } else { 1 };
        }

        fn leave_state(&mut self) -> i32 {
            self.current
        }

        fn check_invariants(&self) -> bool {
            // Deliberately wrong invariant: fails as soon as the counter goes negative.
            self.current >= 0
        }
    }

    #[test]
    fn reports_a_failing_trace() {
        let result = check_default(BrokenCounter { current: 0, step_count: 0 });
        assert!(!result.ok);
        let trace = result.failing_trace.unwrap();
        assert_eq!(*trace.last().unwrap(), -1);
        assert_eq!(trace[0], 0);
    }
}

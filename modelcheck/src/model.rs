// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The interface a user-provided abstract state machine implements to be
//! exhaustively explored, and the entropy source the checker substitutes
//! for the model's own nondeterministic choices.

use crate::progress::ProgressReport;

/// A source of nondeterministic choices. During model checking this is
/// never truly random: the checker deterministically substitutes every call
/// with a value chosen by its exploration algorithm.
pub trait EntropySource {
    /// Returns an integer in `[lo, hi]`.
    fn pick_int(&mut self, lo: usize, hi: usize) -> usize;

    /// Returns an index in `[0, count)`.
    fn pick_branch(&mut self, count: usize) -> usize {
        assert!(count > 0, "pick_branch requires a nonzero count");
        self.pick_int(0, count - 1)
    }

    fn pick_bool(&mut self) -> bool {
        self.pick_int(0, 1) == 1
    }

    /// Picks one element of `choices` by reference.
    fn pick_one_of<'a, T>(&mut self, choices: &'a [T]) -> &'a T {
        &choices[self.pick_branch(choices.len())]
    }

    /// Picks and runs one of `actions`, returning its result.
    fn do_one_of<T>(&mut self, actions: &mut [&mut dyn FnMut() -> T]) -> T {
        let i = self.pick_branch(actions.len());
        (actions[i])()
    }
}

/// A user-provided abstract state machine. Implementations should be cheap
/// to `enter_state`/`leave_state`/`step` many thousands of times; the
/// checker owns the BFS, not the model.
pub trait Model {
    /// The serialized state type the checker stores in its visited map and
    /// frontier.
    type State: Clone + Eq + std::hash::Hash;

    /// Produces the initial serialized state.
    fn initialize(&mut self) -> Self::State;

    /// Prepares internal representation for the next `step`.
    fn enter_state(&mut self, state: &Self::State);

    /// Advances the model using any number of calls on `entropy`.
    fn step(&mut self, entropy: &mut dyn EntropySource);

    /// Extracts the serialized state after `step`.
    fn leave_state(&mut self) -> Self::State;

    /// Returns `false` to fail the model at the current state.
    fn check_invariants(&self) -> bool;

    /// Canonicalizes symmetric states so equivalent reachable states collapse
    /// to one visited-map entry. Identity by default.
    fn normalize(&self, state: Self::State) -> Self::State {
        state
    }

    /// Additional invariant checked immediately after `step`, before
    /// `leave_state`. `true` by default.
    fn check_stepwise_invariants(&self) -> bool {
        true
    }

    /// Called on the configured progress-reporting interval (sharded mode:
    /// once per shard). The default does nothing; models that want to print
    /// progress override it.
    fn report_progress(&self, _report: &ProgressReport) {}
}

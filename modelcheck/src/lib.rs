// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exhaustive and sharded-parallel state-machine model checking.
//!
//! A [`Model`] describes a system as a pure state machine: a starting state,
//! a `step` function that advances it using a handful of nondeterministic
//! choices, and an invariant to check at every reachable state. [`check`]
//! (or [`check_sharded`] for a multi-threaded run) explores every reachable
//! state exactly once, substituting its own deterministic entropy source for
//! the model's choices so that the same run always explores the same space
//! in the same order.

pub mod branch;
pub mod checker;
pub mod model;
pub mod progress;
pub mod radix_queue;
pub mod sharded;

pub use checker::{check, check_default, check_with_progress, CheckResult};
pub use model::{EntropySource, Model};
pub use progress::{ProgressReport, ProgressTicker};
pub use radix_queue::{RadixQueue, DEFAULT_SEGMENTS};
pub use sharded::{check_sharded, check_sharded_default, ShardedCheckResult};

// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::too_many_arguments)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! The core incremental evaluation engine: a dependency-graph-driven compute
//! framework that memoizes pure, deterministic functions ("evaluators")
//! keyed by typed identifiers ("keys") and re-runs only what changed between
//! invocations.
//!
//! See `Graph` for the entry point. Implement [`Node`] for the enum of
//! evaluator function-tags your host wants to memoize, then construct a
//! [`Graph<YourNode>`] and call [`Graph::evaluate`].

pub mod entry;
pub mod environment;
mod error;
pub mod node;
mod runtime;
mod store;
mod worker_thread;

pub use crate::entry::{AddRdepOutcome, RunToken};
pub use crate::environment::{Environment, EventListener};
pub use crate::error::GraphError;
pub use crate::node::{DirtyType, Node, NodeError, NodeOutcome};
pub use crate::runtime::{EngineConfig, EvaluateResult, Graph, InvalidationResult};
pub use crate::worker_thread::{WorkerDeps, WorkerThreadHandle};

/// Logs at trace level, but only in `cfg(test)`: keeps hot-path call sites
/// (one per dep declared, one per commit) free in release builds while
/// remaining inspectable under `env_logger` in tests.
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
        #[cfg(test)]
        {
            log::trace!($($arg)+)
        }
    };
}

#[cfg(test)]
mod tests;

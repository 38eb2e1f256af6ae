// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Debug;

use key::Keyed;

use crate::environment::Environment;

/// A memoized computation keyed by `Self`.
///
/// A `Node` plays both the "Key" and "Evaluator Function" roles of a
/// memoized computation at once: the key carries its own `compute` body, dispatched
/// statically rather than through a runtime registry, matching the
/// tagged-variant-key design, avoiding dynamic dispatch over evaluators.
/// Implementors are typically an enum whose variants cover the
/// function-tags in play, with `compute` matching on `self`.
pub trait Node: Keyed {
    /// The committed value type. Compared with `PartialEq` for change
    /// pruning; the Engine never compares two
    /// values of different keys, so an imprecise `PartialEq` only affects
    /// this node's own rebuild wave.
    type Value: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// The error type committed in place of a value. Constructed only by
    /// the evaluator itself, except for the two Engine-synthesized variants
    /// every implementation must provide: `cyclic_error` and `invalidated`.
    type Error: NodeError;

    /// Runs one step of this node's evaluation.
    ///
    /// May be invoked more than once for the same logical evaluation: once
    /// per restart (see [`NodeOutcome::Restart`]). Implementations must be
    /// pure with respect to everything they observe through `env`, and
    /// monotonic in which deps they declare across restarts.
    fn compute(&self, env: &Environment<Self>) -> NodeOutcome<Self>
    where
        Self: Sized;

    /// Releases any per-key compute state associated with this node
    /// (worker-thread handles, buffered partial state). Called when the
    /// node is deleted or dirtied in a way that discards in-progress work.
    /// The default is a no-op, matching evaluators with no such state.
    fn clean_up_state(&self) {}
}

/// The outcome of one `compute` invocation.
pub enum NodeOutcome<N: Node> {
    /// The node's committed value.
    Value(N::Value),
    /// The node's committed error.
    Error(N::Error),
    /// Some declared dependency was not yet `Done`; the runtime will
    /// re-invoke `compute` once progress is possible. Produced implicitly by
    /// `Environment` when a dep is missing; evaluators do not usually
    /// construct this directly, but may return it to suspend without
    /// naming a key (paired with `Environment::add_external_dep`).
    Restart,
}

/// Errors committed as node values.
///
/// Split out from `Node::Error`'s bound list so the two Engine-synthesized
/// variants are discoverable: every evaluator error type must be able to
/// represent "this node sits on a cycle" and "this node's dep was
/// invalidated mid-computation", since the Engine constructs exactly these
/// two without the evaluator's help.
pub trait NodeError: Clone + Debug + Send + Sync + 'static {
    /// Constructs the error committed to every member of a detected cycle.
    /// `path` names the cycle members, in traversal order, for diagnostics.
    fn cyclic_error(path: Vec<String>) -> Self;

    /// Constructs the error surfaced to a node whose in-flight dep was
    /// invalidated before it could be observed (a race between an external
    /// `invalidate` and a dependent's read of the old value).
    fn invalidated() -> Self;
}

/// Distinguishes why a dirty node is being marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyType {
    /// The node's own inputs changed; forces re-evaluation.
    Change,
    /// Some transitive input changed; re-evaluation may be skipped by
    /// change pruning once deps are checked.
    Affected,
}

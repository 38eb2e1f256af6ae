// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{AddRdepOutcome, RunToken};
use crate::node::Node;
use crate::runtime::Coordinator;

/// An out-of-band sink for diagnostics posted during `compute` via
/// `get_listener`/`post_event`. The Engine ships no concrete sink; hosts
/// implement this to feed a build-event stream, a trace UI, or a logger.
pub trait EventListener<N: Node>: Send + Sync {
    fn post_event(&self, key: &N, event: &str);
}

/// The per-call handle an Evaluator Function uses to declare dependencies.
/// One `Environment` is constructed per invocation of
/// `Node::compute`; its declarations become the node's
/// `temporary_direct_deps` for that attempt.
pub struct Environment<'g, N: Node> {
    pub(crate) coordinator: &'g Coordinator<'g, N>,
    pub(crate) requester: Arc<N>,
    pub(crate) token: RunToken,
    pub(crate) missing: Cell<bool>,
    pub(crate) external_dep: Cell<bool>,
    pub(crate) listener: Option<&'g dyn EventListener<N>>,
    /// The first error seen from a dep requested through `get_value`/
    /// `get_values` (i.e. not explicitly surfaced via `get_value_or_throw`),
    /// set aside so the runtime can fail this node automatically instead of
    /// leaving it to restart forever on a dep that will never signal again.
    dep_error: RefCell<Option<N::Error>>,
}

impl<'g, N: Node> Environment<'g, N> {
    pub(crate) fn new(
        coordinator: &'g Coordinator<'g, N>,
        requester: Arc<N>,
        token: RunToken,
        listener: Option<&'g dyn EventListener<N>>,
    ) -> Self {
        Environment {
            coordinator,
            requester,
            token,
            missing: Cell::new(false),
            external_dep: Cell::new(false),
            listener,
            dep_error: RefCell::new(None),
        }
    }

    /// Requests a single dependency. Returns its value immediately if Done;
    /// otherwise records it as a declared dep of the current node and marks
    /// this attempt as needing a restart.
    ///
    /// If the dep is Done with an error, that error is not surfaced here: the
    /// caller sees a missing-dep sentinel (`None`), and the error is set
    /// aside for automatic propagation (see `Coordinator::rebuild`). Use
    /// `get_value_or_throw` to observe the error directly instead.
    pub fn get_value(&self, dep: &N) -> Option<N::Value> {
        match self.get_value_or_throw(dep) {
            Ok(value) => value,
            Err(error) => {
                self.missing.set(true);
                self.record_dep_error(error);
                None
            }
        }
    }

    /// Batched variant: declares every key in `group` as one dep group
    /// (members may be evaluated concurrently), returning each one's value
    /// where already Done.
    pub fn get_values(&self, group: &[N]) -> Vec<Option<N::Value>> {
        let (values, deps, not_yet_done) = self.request_group(group);
        self.coordinator
            .entry_for(&self.requester)
            .add_temporary_direct_dep_group(self.token, deps, not_yet_done);
        values
    }

    /// Like `get_value`, but surfaces the dep's committed error directly
    /// instead of folding it into a missing-dep sentinel. The Engine never
    /// filters which errors are handed back; a caller that wants to treat
    /// some of them as expected matches on the returned `N::Error` itself.
    pub fn get_value_or_throw(&self, dep: &N) -> Result<Option<N::Value>, N::Error> {
        let (key, entry) = self.coordinator.store_create_if_absent(dep.clone());
        match entry.add_reverse_dep_and_check_if_done(Arc::clone(&self.requester), self.token) {
            AddRdepOutcome::AlreadyDone(outcome) => {
                self.coordinator
                    .entry_for(&self.requester)
                    .add_singleton_temporary_direct_dep(self.token, key, 0);
                outcome.map(Some)
            }
            AddRdepOutcome::NeedsScheduling => {
                self.coordinator
                    .entry_for(&self.requester)
                    .add_singleton_temporary_direct_dep(self.token, Arc::clone(&key), 1);
                self.missing.set(true);
                self.coordinator.enqueue(entry);
                Ok(None)
            }
            AddRdepOutcome::AlreadyEvaluating => {
                self.coordinator
                    .entry_for(&self.requester)
                    .add_singleton_temporary_direct_dep(self.token, key, 1);
                self.missing.set(true);
                Ok(None)
            }
        }
    }

    fn request_group(&self, group: &[N]) -> (Vec<Option<N::Value>>, Vec<Arc<N>>, usize) {
        let mut values = Vec::with_capacity(group.len());
        let mut deps = Vec::with_capacity(group.len());
        let mut not_yet_done = 0;
        for dep in group {
            let (key, entry) = self.coordinator.store_create_if_absent(dep.clone());
            deps.push(Arc::clone(&key));
            match entry.add_reverse_dep_and_check_if_done(Arc::clone(&self.requester), self.token)
            {
                AddRdepOutcome::AlreadyDone(Ok(value)) => values.push(Some(value)),
                AddRdepOutcome::AlreadyDone(Err(error)) => {
                    self.missing.set(true);
                    self.record_dep_error(error);
                    values.push(None);
                }
                AddRdepOutcome::NeedsScheduling => {
                    self.missing.set(true);
                    not_yet_done += 1;
                    self.coordinator.enqueue(entry);
                    values.push(None);
                }
                AddRdepOutcome::AlreadyEvaluating => {
                    self.missing.set(true);
                    not_yet_done += 1;
                    values.push(None);
                }
            }
        }
        (values, deps, not_yet_done)
    }

    fn record_dep_error(&self, error: N::Error) {
        let mut slot = self.dep_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Takes the first dep error recorded via `get_value`/`get_values` this
    /// attempt, if any. Called by the runtime after `compute` returns to
    /// decide whether a `Restart` should instead be committed as an error.
    pub(crate) fn take_dep_error(&self) -> Option<N::Error> {
        self.dep_error.borrow_mut().take()
    }

    /// `true` if any dep requested so far this attempt was not yet Done.
    pub fn values_missing(&self) -> bool {
        self.missing.get()
    }

    /// Marks this attempt as suspended on an out-of-band signal rather than
    /// a named key (`add_external_dep`). The runtime holds the node
    /// Evaluating until `Graph::signal_external_dep` is called for it. Must
    /// be called again on every restart for which the wait is still
    /// outstanding, mirroring the monotonic re-declaration rule for named
    /// deps.
    pub fn add_external_dep(&self) {
        self.external_dep.set(true);
        self.missing.set(true);
        self.coordinator
            .entry_for(&self.requester)
            .add_external_dep_marker(self.token);
        self.coordinator.note_external_wait();
    }

    pub fn get_listener(&self) -> Option<&'g dyn EventListener<N>> {
        self.listener
    }

    /// The executor the host constructed `Graph` with, for evaluators that
    /// need to hand work to a dedicated thread (worker-thread handoff)
    /// rather than blocking the calling worker-pool thread.
    pub fn executor(&self) -> &'g task_executor::Executor {
        self.coordinator.executor()
    }

    pub fn post_event(&self, event: &str) {
        if let Some(listener) = self.listener {
            listener.post_event(&self.requester, event);
        }
    }

    /// Per-key state that survives restarts of this evaluation episode
    /// (`get_state`), such as a worker-thread handle.
    pub fn get_state<T, F>(&self, factory: F) -> Arc<Mutex<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T,
    {
        self.coordinator
            .entry_for(&self.requester)
            .get_state(self.token, factory)
            .expect("get_state called with a stale run token")
    }
}

// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Worker-thread handoff for evaluators that cannot return quickly between
//! dep requests: a process fetching an archive, say, which interleaves
//! blocking I/O with key lookups. `Node::compute` itself stays a
//! synchronous, replayable function (the "replay strategy"); this module
//! implements the alternative "worker strategy" as a helper an evaluator
//! opts into via `Environment::get_state`, rather than a second `compute`
//! protocol.
//!
//! The worker body runs on a dedicated OS thread and talks to the host
//! through two channels: a request channel carrying the dep keys it needs,
//! and a reply channel carrying their values back. Each restart of the
//! owning node calls [`WorkerThreadHandle::poll`] once, which answers the
//! worker's most recent request (if any) using the fresh `Environment`, then
//! waits for the worker's next message — a further request (in which case
//! `poll` returns `Restart` and the cycle repeats on the next restart) or the
//! worker's final outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use crate::environment::Environment;
use crate::node::{Node, NodeOutcome};

enum ToHost<N: Node> {
    Need(N),
    Finished(NodeOutcome<N>),
}

/// The proxy a worker-thread body uses in place of `Environment::get_value`.
/// Requesting a dep blocks this thread until the host thread supplies its
/// value on a later restart, or until the evaluation is cancelled.
pub struct WorkerDeps<N: Node> {
    to_host: Sender<ToHost<N>>,
    from_host: Receiver<Result<Option<N::Value>, N::Error>>,
    cancelled: Arc<AtomicBool>,
}

impl<N: Node> WorkerDeps<N> {
    /// Requests `dep`, blocking until the host answers it. Returns `Ok(None)`
    /// if the evaluation was cancelled before an answer arrived; callers
    /// should treat that the same as any other cooperative-cancellation
    /// checkpoint and wind down.
    pub fn get_value(&self, dep: N) -> Result<Option<N::Value>, N::Error> {
        if self.to_host.send(ToHost::Need(dep)).is_err() {
            return Ok(None);
        }
        self.from_host.recv().unwrap_or(Ok(None))
    }

    /// `true` once the host has abandoned this handle (the node was dirtied
    /// or the evaluation cancelled out from under the worker). Evaluators
    /// that poll for cancellation between requests, rather than only while
    /// blocked in `get_value`, should check this.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A handle to a per-key worker thread, constructed once (via
/// `Environment::get_state`) and reused across every restart of the node
/// that owns it.
pub struct WorkerThreadHandle<N: Node> {
    to_host: Receiver<ToHost<N>>,
    to_worker: Sender<Result<Option<N::Value>, N::Error>>,
    cancelled: Arc<AtomicBool>,
    pending: Option<N>,
}

impl<N: Node> WorkerThreadHandle<N> {
    /// Hands `body` to `executor.native_spawn` now, wrapped as a no-`.await`
    /// future purely so it travels through the same dedicated-OS-thread path
    /// every other native task does (`task_executor::Executor::
    /// native_spawn`). `body` receives a [`WorkerDeps`] instead of an
    /// `Environment` — the latter is only valid for the duration of one
    /// `compute` call on the host thread, not for the worker's whole
    /// lifetime.
    pub fn spawn<F>(executor: &task_executor::Executor, body: F) -> WorkerThreadHandle<N>
    where
        F: FnOnce(WorkerDeps<N>) -> NodeOutcome<N> + Send + 'static,
    {
        let (to_host_tx, to_host_rx) = mpsc::channel();
        let (to_worker_tx, to_worker_rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let deps = WorkerDeps {
            to_host: to_host_tx.clone(),
            from_host: to_worker_rx,
            cancelled: Arc::clone(&cancelled),
        };
        // The returned JoinHandle is intentionally dropped: per
        // `native_spawn`'s convention that detaches the thread rather than
        // cancelling it, and this handle's own channels are how callers
        // observe completion instead.
        drop(executor.native_spawn(async move {
            let outcome = body(deps);
            let _ = to_host_tx.send(ToHost::Finished(outcome));
        }));
        WorkerThreadHandle {
            to_host: to_host_rx,
            to_worker: to_worker_tx,
            cancelled,
            pending: None,
        }
    }

    /// Drives the worker forward using the current restart's `env`. A
    /// request the worker is already waiting on (from a prior restart) is
    /// re-checked first; as long as requests keep resolving immediately the
    /// loop keeps answering them on this same `env` without returning, so a
    /// worker whose deps are already Done runs to completion in one call.
    /// Only returns `Restart` in the same step that declares the dep still
    /// outstanding, so the entry is always left with something to wait on.
    pub fn poll(&mut self, env: &Environment<'_, N>) -> NodeOutcome<N> {
        let mut next = self.pending.take().map(ToHost::Need);
        loop {
            let message = match next.take() {
                Some(message) => message,
                None => match self.to_host.recv() {
                    Ok(message) => message,
                    // The worker thread panicked or exited without
                    // reporting a result; restart so the entry waits
                    // rather than silently double-committing. Evaluators
                    // are expected not to let their worker body panic.
                    Err(_) => return NodeOutcome::Restart,
                },
            };
            match message {
                ToHost::Need(dep) => match env.get_value_or_throw(&dep) {
                    Ok(Some(value)) => {
                        if self.to_worker.send(Ok(Some(value))).is_err() {
                            return NodeOutcome::Restart;
                        }
                    }
                    Ok(None) => {
                        self.pending = Some(dep);
                        return NodeOutcome::Restart;
                    }
                    Err(error) => {
                        // Hand the error to the worker rather than failing
                        // the node directly, so cleanup-on-error logic in
                        // the worker body (e.g. removing a partial
                        // download) runs.
                        let _ = self.to_worker.send(Err(error));
                    }
                },
                ToHost::Finished(outcome) => return outcome,
            }
        }
    }
}

impl<N: Node> Drop for WorkerThreadHandle<N> {
    /// Cooperative cancellation: flips `is_cancelled` for workers
    /// that check it between requests, and drops the reply sender so a
    /// worker currently blocked in `WorkerDeps::get_value` observes a
    /// disconnected channel and can unwind rather than hang forever. The
    /// thread itself is not joined: per `task_executor::Executor::
    /// native_spawn`'s convention, dropping the handle detaches it.
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeError;
    use crate::runtime::Graph;
    use key::Keyed;
    use std::hash::Hash;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    enum K {
        Leaf(u32),
        Fetch,
    }

    impl Keyed for K {}

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum FetchError {
        Cyclic,
        Invalidated,
    }

    impl NodeError for FetchError {
        fn cyclic_error(_path: Vec<String>) -> Self {
            FetchError::Cyclic
        }
        fn invalidated() -> Self {
            FetchError::Invalidated
        }
    }

    impl Node for K {
        type Value = u32;
        type Error = FetchError;

        fn compute(&self, env: &Environment<Self>) -> NodeOutcome<Self> {
            match self {
                K::Leaf(n) => NodeOutcome::Value(*n),
                K::Fetch => {
                    let executor = env.executor().clone();
                    let handle = env.get_state(|| {
                        WorkerThreadHandle::spawn(&executor, |deps| {
                            let mut total = 0;
                            for leaf in [K::Leaf(1), K::Leaf(2), K::Leaf(3)] {
                                match deps.get_value(leaf) {
                                    Ok(Some(v)) => total += v,
                                    Ok(None) => return NodeOutcome::Restart,
                                    Err(_) => return NodeOutcome::Error(FetchError::Invalidated),
                                }
                            }
                            NodeOutcome::Value(total)
                        })
                    });
                    handle.lock().poll(env)
                }
            }
        }
    }

    #[test]
    fn worker_thread_node_sums_its_deps_across_restarts() {
        let _ = env_logger::try_init();
        // `Graph::evaluate` itself needs no async context, but
        // `task_executor::Executor` is a handle onto a Tokio runtime; spin
        // up a throwaway one just to construct it.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let graph: Graph<K> = Graph::new(task_executor::Executor::from_handle(rt.handle().clone()));
        let result = graph.evaluate(&[K::Fetch], false).unwrap();
        assert_eq!(result.results.get(&K::Fetch), Some(&Ok(6)));
    }
}

// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! A thin handle around a Tokio runtime offering two spawn flavors: plain
//! async tasks, and "native" tasks that get a dedicated OS thread.
//!
//! The distinction matters for an evaluation engine: most evaluator bodies
//! are cheap to replay and suspend by returning control to the caller (see
//! `graph::runtime`'s restart protocol), so they run as ordinary async tasks.
//! A few (archive fetches, subprocess spawns) interleave blocking I/O with
//! dependency lookups and would starve the async runtime if scheduled onto
//! it; those run on a dedicated thread via [`Executor::native_spawn`].

use std::future::Future;
use std::thread;

/// Returns a reasonable default worker-pool size for the host machine.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

/// A cheaply cloneable handle to a Tokio runtime, plus the ability to spin
/// up dedicated OS threads for evaluators that cannot yield promptly.
#[derive(Clone)]
pub struct Executor {
    handle: tokio::runtime::Handle,
}

impl Executor {
    /// Captures the handle of the currently running Tokio runtime. Panics
    /// if called outside of one, matching `tokio::runtime::Handle::current`.
    pub fn new() -> Executor {
        Executor {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn from_handle(handle: tokio::runtime::Handle) -> Executor {
        Executor { handle }
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Spawns `future` as an ordinary task on the runtime's worker pool.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Spawns `future` onto a brand new OS thread, which drives it to
    /// completion with a local executor rather than the Tokio work-stealing
    /// pool. Used for evaluators that need to interleave blocking work with
    /// dependency requests without holding up other evaluations.
    ///
    /// The returned `JoinHandle` is a plain `std::thread::JoinHandle`: callers
    /// that don't need the result (the common case — see `graph::entry`) are
    /// free to drop it, which detaches the thread rather than cancelling it.
    pub fn native_spawn<F>(&self, future: F) -> thread::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        thread::Builder::new()
            .name("ridge-native-worker".to_owned())
            .spawn(move || {
                log::trace!("spawning native worker thread");
                futures::executor::block_on(future)
            })
            .expect("failed to spawn native worker thread")
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

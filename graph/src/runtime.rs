// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A fixed-size worker pool draining a ready queue, restarting nodes whose
//! declared deps are not yet `Done`, detecting cycles among whatever is left
//! once the queue drains, and pruning change propagation when a rebuilt
//! node's outcome is unchanged from its last one.
//!
//! `Node::compute` here is a synchronous, replayable function: it may be
//! invoked any number of times as its deps resolve. The worker pool is
//! therefore plain OS threads scoped to one `evaluate` call rather than
//! Tokio tasks — see `DESIGN.md` for the grounding behind that choice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex};
use petgraph::graph::{DiGraph, NodeIndex};

use async_latch::AsyncLatch;
use std::sync::Arc;
use task_executor::Executor;

use crate::entry::{AddRdepOutcome, DirtySubState, Entry, RunToken};
use crate::environment::{Environment, EventListener};
use crate::error::GraphError;
use crate::node::{Node, NodeOutcome};
use crate::store::NodeStore;

/// How often the supervisor polls for quiescence while workers are busy.
/// Kept short: this is a liveness check, not a hot loop (workers do the
/// real work off the ready queue, not this thread).
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Host-supplied tunables, constructed once and passed to [`Graph::new`]
/// rather than read from the environment by the Engine itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool each `evaluate` call spins up.
    pub worker_count: usize,
    /// Shard count for the underlying `NodeStore`'s map and interner.
    pub node_store_shards: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: task_executor::default_worker_count(),
            node_store_shards: crate::store::DEFAULT_SHARDS,
        }
    }
}

/// The result of one top-level [`Graph::evaluate`] call.
pub struct EvaluateResult<N: Node> {
    /// One entry per root that reached `Done` before evaluation stopped.
    /// Under `keep_going = false`, a root left out of this map means
    /// evaluation short-circuited before reaching it.
    pub results: FnvHashMap<N, Result<N::Value, N::Error>>,
    /// Every cycle detected during this call, each as the ordered list of
    /// keys on it.
    pub cycles: Vec<Vec<N>>,
}

/// The thread-safe, Condvar-backed ready queue workers drain.
struct ReadyQueue<N: Node> {
    state: Mutex<QueueState<N>>,
    condvar: Condvar,
}

struct QueueState<N: Node> {
    queue: VecDeque<Arc<Entry<N>>>,
    shutdown: bool,
}

impl<N: Node> ReadyQueue<N> {
    fn new() -> Self {
        ReadyQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn push(&self, entry: Arc<Entry<N>>) {
        let mut state = self.state.lock();
        state.queue.push_back(entry);
        self.condvar.notify_one();
    }

    /// Blocks until an entry is available or the queue is shut down.
    fn pop(&self) -> Option<Arc<Entry<N>>> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.queue.pop_front() {
                return Some(entry);
            }
            if state.shutdown {
                return None;
            }
            self.condvar.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }
}

/// The per-`evaluate`-call driver. Holds everything an [`Environment`]
/// needs to declare deps and enqueue newly-not-done ones; owns the ready
/// queue, cycle bookkeeping, and the `keep_going`/cancellation flags that
/// govern when the supervisor stops.
pub(crate) struct Coordinator<'g, N: Node> {
    store: &'g NodeStore<N>,
    ready: ReadyQueue<N>,
    keep_going: bool,
    cancel: &'g AsyncLatch,
    listener: Option<&'g dyn EventListener<N>>,
    busy: AtomicUsize,
    aborted: AtomicBool,
    cycles: Mutex<Vec<Vec<Arc<N>>>>,
    /// Keys reported via `Graph::signal_external_dep` since the last drain.
    /// Shared with the owning `Graph` so a signal
    /// that arrives between `evaluate` calls is not lost.
    external_signals: &'g Mutex<VecDeque<Arc<N>>>,
    /// Count of attempts currently parked on `add_external_dep` (incremented
    /// in `note_external_wait`, decremented as each is drained). Used to
    /// tell "genuinely stuck, must be a cycle" apart from "waiting on an
    /// external signal that hasn't arrived yet" in `supervise`.
    external_waiting: AtomicUsize,
    /// Handed out to `Environment`s so worker-thread-mode evaluators
    /// can spawn their background thread through the same executor the host
    /// configured, rather than each rolling its own `std::thread::Builder`.
    executor: &'g Executor,
}

impl<'g, N: Node> Coordinator<'g, N> {
    fn new(
        store: &'g NodeStore<N>,
        keep_going: bool,
        cancel: &'g AsyncLatch,
        listener: Option<&'g dyn EventListener<N>>,
        external_signals: &'g Mutex<VecDeque<Arc<N>>>,
        executor: &'g Executor,
    ) -> Self {
        Coordinator {
            store,
            ready: ReadyQueue::new(),
            keep_going,
            cancel,
            listener,
            busy: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            cycles: Mutex::new(Vec::new()),
            external_signals,
            external_waiting: AtomicUsize::new(0),
            executor,
        }
    }

    // --- Environment-facing API -------------------------------------------------

    pub(crate) fn store_create_if_absent(&self, key: N) -> (Arc<N>, Arc<Entry<N>>) {
        self.store.create_if_absent(key)
    }

    pub(crate) fn executor(&self) -> &'g Executor {
        self.executor
    }

    pub(crate) fn entry_for(&self, key: &Arc<N>) -> Arc<Entry<N>> {
        self.store
            .get(key)
            .expect("requester's own entry must exist while it is evaluating")
    }

    pub(crate) fn enqueue(&self, entry: Arc<Entry<N>>) {
        self.ready.push(entry);
    }

    pub(crate) fn note_external_wait(&self) {
        self.external_waiting.fetch_add(1, Ordering::SeqCst);
    }

    /// Drains every key reported by `Graph::signal_external_dep` so far,
    /// re-enqueuing whichever ones it unblocks.
    fn drain_external_signals(&self) {
        loop {
            let key = self.external_signals.lock().pop_front();
            let Some(key) = key else { break };
            self.external_waiting.fetch_sub(1, Ordering::SeqCst);
            if let Some(entry) = self.store.get(&key) {
                if let Some(token) = entry.run_token() {
                    if entry.signal_dep(token) {
                        self.enqueue(entry);
                    }
                }
            }
        }
    }

    // --- Worker loop --------------------------------------------------------

    fn worker_loop(&self) {
        while let Some(entry) = self.ready.pop() {
            self.busy.fetch_add(1, Ordering::SeqCst);
            self.process(&entry);
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn queue_and_workers_idle(&self) -> bool {
        self.ready.is_empty() && self.busy.load(Ordering::SeqCst) == 0
    }

    fn process(&self, entry: &Arc<Entry<N>>) {
        if self.cancel.poll_triggered() || self.aborted.load(Ordering::SeqCst) {
            return;
        }
        let Some(token) = entry.run_token() else {
            // Raced with another thread that already committed this entry;
            // nothing to do (it won't have been re-enqueued for no reason).
            return;
        };
        match entry.dirty_sub_state() {
            Some(DirtySubState::CheckDependencies) => self.check_dependencies(entry, token),
            _ => self.rebuild(entry, token),
        }
    }

    /// Walks a dirty node's previously declared dep groups, one at a time,
    /// comparing each dep's current generation to the one recorded at last
    /// commit. The first changed dep switches the node to `NeedsRebuilding`;
    /// if every group is unchanged, the node's previous outcome is
    /// recommitted without invoking the evaluator (I3).
    fn check_dependencies(&self, entry: &Arc<Entry<N>>, token: RunToken) {
        // If we were re-enqueued after waiting on a group, that group is
        // always the last one recorded in `declared_deps` (see the doc
        // comment on `Entry::next_dirty_dep_group`): validate it first.
        let already_declared = entry.declared_deps().len();
        if already_declared > 0 {
            let group_index = already_declared - 1;
            if self.group_changed(entry, group_index) {
                self.begin_rebuild(entry, token);
                return;
            }
        }
        loop {
            let Some(group) = entry.next_dirty_dep_group() else {
                self.commit_unchanged(entry, token);
                return;
            };
            let group_index = entry.declared_deps().len();
            let pending = self.request_group(entry, token, &group);
            if pending {
                // Will be re-invoked (and the group validated) once the
                // dep signals us back.
                return;
            }
            if self.group_changed(entry, group_index) {
                self.begin_rebuild(entry, token);
                return;
            }
        }
    }

    /// Requests every key in `group` on behalf of `entry`, recording the
    /// group as declared. Returns `true` if any member is not yet `Done`
    /// (the caller must wait for a signal before judging this group).
    fn request_group(&self, entry: &Arc<Entry<N>>, token: RunToken, group: &[Arc<N>]) -> bool {
        let mut not_yet_done = 0;
        let mut keys = Vec::with_capacity(group.len());
        for dep_key in group {
            let (key, dep_entry) = self.store.create_if_absent((**dep_key).clone());
            crate::test_trace_log!("adding dependency from {:?} to {:?}", entry.key(), key);
            keys.push(Arc::clone(&key));
            match dep_entry.add_reverse_dep_and_check_if_done(Arc::clone(entry.key()), token) {
                AddRdepOutcome::AlreadyDone(_) => {}
                AddRdepOutcome::NeedsScheduling => {
                    not_yet_done += 1;
                    self.enqueue(dep_entry);
                }
                AddRdepOutcome::AlreadyEvaluating => {
                    not_yet_done += 1;
                }
            }
        }
        entry.add_temporary_direct_dep_group(token, keys, not_yet_done);
        not_yet_done > 0
    }

    /// Compares the live generation of every dep in the group at
    /// `group_index` (the group most recently requested) against the
    /// generation recorded when this node last committed.
    fn group_changed(&self, entry: &Arc<Entry<N>>, group_index: usize) -> bool {
        let declared = entry.declared_deps();
        let Some(group) = declared.get(group_index) else {
            return false;
        };
        let previous = entry
            .previous_dep_generations_for(group_index)
            .unwrap_or_default();
        for (i, dep_key) in group.iter().enumerate() {
            let live_generation = self
                .store
                .get(dep_key)
                .map(|e| e.generation())
                .unwrap_or(0);
            let prior_generation = previous.get(i).copied().unwrap_or(u64::MAX);
            if live_generation != prior_generation {
                return true;
            }
        }
        false
    }

    fn commit_unchanged(&self, entry: &Arc<Entry<N>>, token: RunToken) {
        let Some(outcome) = entry.previous_outcome() else {
            // Shouldn't happen: CheckDependencies always starts from a
            // dirty (previously Done) node. Defensively fall through to a
            // full rebuild rather than losing the node entirely.
            self.begin_rebuild(entry, token);
            return;
        };
        let dep_generations = self.dep_generations_for(entry);
        self.finish(entry, token, outcome, dep_generations);
    }

    /// Switches a `CheckDependencies` node to `NeedsRebuilding`, releases
    /// the rdep links of any previously declared dep groups this attempt
    /// never got around to re-requesting (they will not be re-declared
    /// unless the evaluator asks for them again), and invokes the
    /// evaluator.
    fn begin_rebuild(&self, entry: &Arc<Entry<N>>, token: RunToken) {
        if entry.dirty_sub_state() == Some(DirtySubState::NeedsRebuilding) {
            for stale in entry.get_all_remaining_dirty_direct_deps() {
                if let Some(stale_entry) = self.store.get(&stale) {
                    stale_entry.remove_reverse_dep(entry.key());
                }
            }
            entry.set_dirty_sub_state(token, DirtySubState::Rebuilding);
        }
        self.rebuild(entry, token);
    }

    /// Invokes the evaluator function for a fresh or `Rebuilding` node.
    fn rebuild(&self, entry: &Arc<Entry<N>>, token: RunToken) {
        crate::test_trace_log!("rebuilding {:?}", entry.key());
        let previously_declared: std::collections::HashSet<Arc<N>> =
            entry.declared_deps().into_iter().flatten().collect();
        entry.begin_attempt();
        let env = Environment::new(self, Arc::clone(entry.key()), token, self.listener);
        let outcome = entry.key().compute(&env);

        // A dep declared on an earlier restart of this same episode but not
        // re-declared this attempt has been retracted; release its rdep link
        // so it can't spuriously dirty this node later (I1).
        let newly_declared: std::collections::HashSet<Arc<N>> =
            entry.declared_deps().into_iter().flatten().collect();
        for stale in previously_declared.difference(&newly_declared) {
            if let Some(stale_entry) = self.store.get(stale) {
                stale_entry.remove_reverse_dep(entry.key());
            }
        }

        match outcome {
            NodeOutcome::Restart => {
                // A dep requested through `get_value`/`get_values` (not
                // `get_value_or_throw`) that is already Done with an error
                // will never signal this entry again, so if nothing else is
                // still outstanding this attempt, the node must be failed
                // now rather than left to restart forever.
                if let Some(error) = env.take_dep_error() {
                    if entry.unsignaled_deps(token) == Some(0) {
                        let dep_generations = self.dep_generations_for(entry);
                        self.finish(entry, token, Err(error), dep_generations);
                        return;
                    }
                }
                debug_assert!(
                    env.values_missing() || env.external_dep.get(),
                    "a Node returning Restart must have requested a dep or an external wait"
                );
                // Left Evaluating; re-enqueued once its declared deps (or
                // external signal) complete.
            }
            NodeOutcome::Value(value) => {
                let dep_generations = self.dep_generations_for(entry);
                self.finish(entry, token, Ok(value), dep_generations);
            }
            NodeOutcome::Error(error) => {
                let dep_generations = self.dep_generations_for(entry);
                self.finish(entry, token, Err(error), dep_generations);
            }
        }
    }

    fn dep_generations_for(&self, entry: &Arc<Entry<N>>) -> Vec<Vec<u64>> {
        entry
            .declared_deps()
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|dep| self.store.get(dep).map(|e| e.generation()).unwrap_or(0))
                    .collect()
            })
            .collect()
    }

    /// Commits `outcome`, signaling every rdep whose declared-dep-count
    /// reaches zero back onto the ready queue.
    fn finish(
        &self,
        entry: &Arc<Entry<N>>,
        token: RunToken,
        outcome: Result<N::Value, N::Error>,
        dep_generations: Vec<Vec<u64>>,
    ) {
        if outcome.is_err() && !self.keep_going {
            self.aborted.store(true, Ordering::SeqCst);
        }
        if let Some((rdeps, _deps, _changed)) = entry.set_value(token, outcome, dep_generations) {
            for (rdep_key, rdep_token) in rdeps {
                if let Some(rdep_entry) = self.store.get(&rdep_key) {
                    if rdep_entry.signal_dep(rdep_token) {
                        self.enqueue(rdep_entry);
                    }
                }
            }
        }
    }

    /// Looks for strongly connected components among not-yet-`Done`
    /// entries' declared-deps edges and terminates each one found by
    /// committing `N::Error::cyclic_error` to every member. Returns whether
    /// any cycle was found (and thus whether
    /// progress was made — a defensive backstop against a true deadlock
    /// that isn't actually cyclic, which should never happen if I5 holds).
    fn try_terminate_cycles(&self) -> bool {
        let entries: Vec<Arc<Entry<N>>> = self
            .store
            .iter_entries()
            .into_iter()
            .filter(|e| !e.is_done())
            .collect();
        if entries.is_empty() {
            return false;
        }

        let mut graph: DiGraph<Arc<N>, ()> = DiGraph::new();
        let mut index_of: FnvHashMap<Arc<N>, NodeIndex> = FnvHashMap::default();
        for e in &entries {
            let idx = graph.add_node(Arc::clone(e.key()));
            index_of.insert(Arc::clone(e.key()), idx);
        }
        for e in &entries {
            let Some(&src) = index_of.get(e.key()) else {
                continue;
            };
            for group in e.declared_deps() {
                for dep in group {
                    if let Some(&dst) = index_of.get(&dep) {
                        graph.add_edge(src, dst, ());
                    }
                }
            }
        }

        let sccs = petgraph::algo::kosaraju_scc(&graph);
        let mut progressed = false;
        for scc in sccs {
            let is_cycle = scc.len() > 1
                || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
            if !is_cycle {
                continue;
            }
            progressed = true;
            let members: Vec<Arc<N>> = scc.iter().map(|&idx| Arc::clone(&graph[idx])).collect();
            let path: Vec<String> = members.iter().map(|m| format!("{m:?}")).collect();
            log::debug!("cycle detected among {} node(s): {:?}", members.len(), path);
            for member in &members {
                if let Some(entry) = self.store.get(member) {
                    if let Some(token) = entry.run_token() {
                        self.finish(&entry, token, Err(N::Error::cyclic_error(path.clone())), Vec::new());
                    }
                }
            }
            self.cycles.lock().push(members);
            if !self.keep_going {
                self.aborted.store(true, Ordering::SeqCst);
            }
        }
        progressed
    }

    /// Runs on the calling thread (not a worker) until every root is
    /// `Done`, the run is cancelled, or `!keep_going` has seen an error.
    /// Detects quiescence-without-completion as a cycle and resolves it.
    fn supervise(&self, root_keys: &[Arc<N>]) {
        loop {
            if self.cancel.poll_triggered() {
                self.ready.shutdown();
                return;
            }
            self.drain_external_signals();
            let all_roots_done = root_keys
                .iter()
                .all(|k| self.store.get(k).map(|e| e.is_done()).unwrap_or(false));
            if all_roots_done {
                self.ready.shutdown();
                return;
            }
            if self.aborted.load(Ordering::SeqCst) && self.queue_and_workers_idle() {
                self.ready.shutdown();
                return;
            }
            if self.queue_and_workers_idle() {
                if self.external_waiting.load(Ordering::SeqCst) > 0 {
                    // Nothing ready to run, but at least one attempt is
                    // parked on an out-of-band signal rather than a dep:
                    // this is not a cycle, just idle I/O in flight.
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                if !self.try_terminate_cycles() {
                    // Genuinely stuck with nothing left to resolve: every
                    // live node should be part of some SCC whenever I5 is
                    // violated, so this is an internal invariant failure.
                    self.ready.shutdown();
                    panic!(
                        "evaluation deadlocked with {} non-Done node(s) and no cycle detected (I5 violated)",
                        self.store.iter_entries().iter().filter(|e| !e.is_done()).count()
                    );
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// The public Engine handle: one Node Store, one Interner (owned by the
/// store), and the config/cancellation/executor plumbing `evaluate` needs.
/// One per evaluation context, never a process-wide singleton.
pub struct Graph<N: Node> {
    store: NodeStore<N>,
    config: EngineConfig,
    cancel: AsyncLatch,
    executor: Executor,
    /// Keys reported via [`Graph::signal_external_dep`] but not yet drained
    /// by a `Coordinator`. Persists across `evaluate` calls so a signal that
    /// races the end of one call is still observed by the next.
    external_signals: Mutex<VecDeque<Arc<N>>>,
}

impl<N: Node> Graph<N> {
    pub fn new(executor: Executor) -> Graph<N> {
        Self::with_config(executor, EngineConfig::default())
    }

    pub fn with_config(executor: Executor, config: EngineConfig) -> Graph<N> {
        Graph {
            store: NodeStore::new(config.node_store_shards),
            config,
            cancel: AsyncLatch::new(),
            executor,
            external_signals: Mutex::new(VecDeque::new()),
        }
    }

    /// Reports that the out-of-band event a node suspended on via
    /// [`crate::environment::Environment::add_external_dep`] has occurred,
    /// so the runtime should re-invoke its evaluator. A no-op if `key` names
    /// no live entry, or if that entry is not currently waiting on an
    /// external signal (extra signals are harmless).
    pub fn signal_external_dep(&self, key: &N) {
        if let Some(entry) = self.store.get(key) {
            self.external_signals.lock().push_back(Arc::clone(entry.key()));
        }
    }

    /// The global cancellation flag. Triggering it causes in-flight
    /// workers to stop picking up new entries at their next suspension
    /// point; no values are committed for nodes still in flight.
    pub fn cancel_latch(&self) -> &AsyncLatch {
        &self.cancel
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests values for `roots`, running evaluation to completion (or
    /// to the first error, under `keep_going = false`).
    ///
    /// Empty `roots` returns immediately having done no work.
    pub fn evaluate(&self, roots: &[N], keep_going: bool) -> Result<EvaluateResult<N>, GraphError> {
        self.evaluate_with_listener(roots, keep_going, None)
    }

    pub fn evaluate_with_listener(
        &self,
        roots: &[N],
        keep_going: bool,
        listener: Option<&dyn EventListener<N>>,
    ) -> Result<EvaluateResult<N>, GraphError> {
        if roots.is_empty() {
            return Ok(EvaluateResult {
                results: FnvHashMap::default(),
                cycles: Vec::new(),
            });
        }
        if self.cancel.poll_triggered() {
            return Err(GraphError::Cancelled);
        }

        let root_keys: Vec<Arc<N>> = roots
            .iter()
            .map(|root| self.store.create_if_absent(root.clone()).0)
            .collect();

        let coordinator = Coordinator::new(
            &self.store,
            keep_going,
            &self.cancel,
            listener,
            &self.external_signals,
            &self.executor,
        );
        for key in &root_keys {
            let entry = self.store.get(key).expect("just created above");
            if let AddRdepOutcome::NeedsScheduling = entry.claim_for_root() {
                coordinator.enqueue(entry);
            }
        }

        let worker_count = self.config.worker_count.max(1);
        thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| coordinator.worker_loop());
            }
            coordinator.supervise(&root_keys);
        });

        if self.cancel.poll_triggered() {
            return Err(GraphError::Cancelled);
        }

        let mut results = FnvHashMap::default();
        for (root, key) in roots.iter().zip(root_keys.iter()) {
            if let Some(outcome) = self.store.get(key).and_then(|e| e.peek()) {
                results.insert(root.clone(), outcome);
            }
        }
        let cycles = coordinator
            .cycles
            .into_inner()
            .into_iter()
            .map(|members| members.iter().map(|m| (**m).clone()).collect())
            .collect();
        Ok(EvaluateResult { results, cycles })
    }

    /// Marks `keys` Done -> Dirty with [`crate::node::DirtyType::Change`]
    /// (the caller asserts these keys' own inputs changed), then
    /// transitively marks their reverse deps `Affected`.
    pub fn invalidate(&self, keys: &[N]) -> InvalidationResult {
        self.mark(keys, crate::node::DirtyType::Change)
    }

    /// Marks `keys` Done -> Dirty with
    /// [`crate::node::DirtyType::Affected`] directly (no assertion that
    /// the keys' own inputs changed — e.g. used after a parent
    /// configuration change where only the parent's deps, not its own
    /// content, moved), then transitively marks their reverse deps the
    /// same way.
    pub fn mark_affected(&self, keys: &[N]) -> InvalidationResult {
        self.mark(keys, crate::node::DirtyType::Affected)
    }

    fn mark(&self, keys: &[N], dirty_type: crate::node::DirtyType) -> InvalidationResult {
        use std::collections::VecDeque;
        let mut cleared = 0;
        let mut dirtied = 0;
        let mut frontier: VecDeque<Arc<N>> = VecDeque::new();
        let mut seen: std::collections::HashSet<Arc<N>> = std::collections::HashSet::new();

        for key in keys {
            let Some(entry) = self.store.get(key) else {
                continue;
            };
            if entry.mark_dirty(dirty_type) {
                log::info!("dirtying {key:?} ({dirty_type:?})");
                cleared += 1;
                for rdep in entry.reverse_deps_snapshot() {
                    if seen.insert(Arc::clone(&rdep)) {
                        frontier.push_back(rdep);
                    }
                }
            }
        }
        while let Some(key) = frontier.pop_front() {
            let Some(entry) = self.store.get(&key) else {
                continue;
            };
            if entry.mark_dirty(crate::node::DirtyType::Affected) {
                dirtied += 1;
                for rdep in entry.reverse_deps_snapshot() {
                    if seen.insert(Arc::clone(&rdep)) {
                        frontier.push_back(rdep);
                    }
                }
            }
        }
        InvalidationResult { cleared, dirtied }
    }

    /// Removes entries matching `predicate` (after a build, typically
    /// nodes whose keys no longer exist on disk). Runs
    /// `Node::clean_up_state` on each before dropping it.
    pub fn delete_if(&self, predicate: impl Fn(&N) -> bool) {
        self.store.delete_if(predicate);
    }

    /// Idle-period maintenance: reclaims weakly-referenced interner
    /// and node-store entries. Hosts are expected to call this between
    /// top-level `evaluate` calls, not during one.
    pub fn run_idle_tasks(&self) {
        self.store.shrink_interner();
    }

    /// Calls `f` with every currently `Done` entry's key and committed
    /// outcome. A read-only diagnostic companion to the Node Store, not
    /// part of the evaluation contract: no lock is held across the whole
    /// walk, so a node committing concurrently may or may not be observed.
    pub fn visit_live(&self, mut f: impl FnMut(&N, &Result<N::Value, N::Error>)) {
        for entry in self.store.iter_entries() {
            if let Some(outcome) = entry.peek() {
                f(entry.key(), &outcome);
            }
        }
    }

    /// Like [`Graph::visit_live`], restricted to entries reachable from
    /// `roots` by declared deps.
    pub fn visit_live_reachable(
        &self,
        roots: &[N],
        mut f: impl FnMut(&N, &Result<N::Value, N::Error>),
    ) {
        for (key, entry) in self.reachable_from(roots) {
            if let Some(outcome) = entry.peek() {
                f(&key, &outcome);
            }
        }
    }

    /// BFS over declared deps starting from `roots`, returning every
    /// reached (key, entry) pair, the root keys included.
    fn reachable_from(&self, roots: &[N]) -> Vec<(Arc<N>, Arc<Entry<N>>)> {
        let mut seen: std::collections::HashSet<Arc<N>> = std::collections::HashSet::new();
        let mut frontier: VecDeque<Arc<N>> = VecDeque::new();
        let mut out = Vec::new();
        for root in roots {
            if let Some(entry) = self.store.get(root) {
                if seen.insert(Arc::clone(entry.key())) {
                    frontier.push_back(Arc::clone(entry.key()));
                }
            }
        }
        while let Some(key) = frontier.pop_front() {
            let Some(entry) = self.store.get(&key) else {
                continue;
            };
            for group in entry.declared_deps() {
                for dep in group {
                    if seen.insert(Arc::clone(&dep)) {
                        frontier.push_back(dep);
                    }
                }
            }
            out.push((key, entry));
        }
        out
    }

    /// Writes a GraphViz DOT rendering of every node reachable from `roots`
    /// (by declared deps) to `path`. Read-only and reentrant, a diagnostic
    /// companion to the Node Store rather than part of the evaluation
    /// contract — mirrors the teacher lineage's own `Graph::visualize`.
    pub fn visualize(&self, roots: &[N], path: &std::path::Path) -> std::io::Result<()> {
        use std::io::{BufWriter, Write};

        let reachable = self.reachable_from(roots);
        let mut dot_graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: FnvHashMap<Arc<N>, NodeIndex> = FnvHashMap::default();
        for (key, entry) in &reachable {
            let label = match entry.peek() {
                Some(Ok(value)) => format!("{key:?}\\n{value:?}"),
                Some(Err(error)) => format!("{key:?}\\nerror: {error:?}"),
                None => format!("{key:?}\\n(evaluating)"),
            };
            index_of.insert(Arc::clone(key), dot_graph.add_node(label));
        }
        for (key, entry) in &reachable {
            let Some(&src) = index_of.get(key) else {
                continue;
            };
            for group in entry.declared_deps() {
                for dep in group {
                    if let Some(&dst) = index_of.get(&dep) {
                        dot_graph.add_edge(src, dst, ());
                    }
                }
            }
        }

        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        write!(
            writer,
            "{}",
            petgraph::dot::Dot::with_config(&dot_graph, &[petgraph::dot::Config::EdgeNoLabel])
        )
    }
}

/// The result of an `invalidate`/`mark_affected` call.
#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    /// Keys directly named by the caller that were Done (and so moved to
    /// Dirty).
    pub cleared: usize,
    /// Keys transitively marked Affected as a result.
    pub dirtied: usize,
}

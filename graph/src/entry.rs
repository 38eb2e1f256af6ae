// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::node::{DirtyType, Node};

/// Identifies one evaluation attempt of an entry, so that a signal arriving
/// for a stale attempt (the node was dirtied again before the old attempt's
/// dep finished) can be recognized and dropped. Bumped every time an entry
/// leaves `Done` for `Evaluating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunToken(u64);

/// The outcome of `add_reverse_dep_and_check_if_done`.
pub enum AddRdepOutcome<N: Node> {
    /// The dep is already `Done`; its outcome is returned immediately, and
    /// the caller does not need to wait.
    AlreadyDone(Result<N::Value, N::Error>),
    /// This is the first rdep to observe the key; the caller must enqueue
    /// it for evaluation. Returned at most once per evaluation attempt.
    NeedsScheduling,
    /// The key is already being evaluated (by this attempt); the caller
    /// will be signaled when it completes.
    AlreadyEvaluating,
}

/// The sub-state machine a dirty node walks through while being
/// re-validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtySubState {
    /// Re-requesting each previously declared dep, in group order, to see
    /// whether any produced a changed value.
    CheckDependencies,
    /// A checked dep changed; the evaluator must run again.
    NeedsRebuilding,
    /// The evaluator is running.
    Rebuilding,
}

struct DirtyState<N: Node> {
    sub_state: DirtySubState,
    previous_outcome: Result<N::Value, N::Error>,
    previous_deps: Vec<Vec<Arc<N>>>,
    /// The generation each previous dep was at when this node last
    /// committed, in the same shape as `previous_deps`. Used during
    /// `CheckDependencies` to tell "this dep is Done again" apart from
    /// "this dep is Done again with an unchanged value".
    previous_dep_generations: Vec<Vec<u64>>,
    /// Index of the previous dep group not yet re-requested during
    /// `CheckDependencies`.
    next_group: usize,
}

enum Lifecycle<N: Node> {
    Evaluating(Evaluating<N>),
    Done {
        outcome: Result<N::Value, N::Error>,
        deps: Vec<Vec<Arc<N>>>,
        dep_generations: Vec<Vec<u64>>,
    },
}

struct Evaluating<N: Node> {
    run_token: RunToken,
    temporary_direct_deps: Vec<Vec<Arc<N>>>,
    unsignaled_deps: usize,
    dirty: Option<DirtyState<N>>,
    compute_state: Option<Box<dyn std::any::Any + Send>>,
    /// Set once this attempt has been handed to the ready queue, so a
    /// second concurrent rdep observes `AlreadyEvaluating` rather than also
    /// scheduling it.
    scheduled: bool,
    /// Set the moment `signal_dep` has returned `true` for this attempt, so
    /// a burst of near-simultaneous dep completions enqueues this entry at
    /// most once before the worker pool picks it back up and `begin_attempt`
    /// clears it for the next round.
    requeue_pending: bool,
}

impl<N: Node> Evaluating<N> {
    fn fresh(run_token: RunToken) -> Self {
        Evaluating {
            run_token,
            temporary_direct_deps: Vec::new(),
            unsignaled_deps: 0,
            dirty: None,
            compute_state: None,
            scheduled: false,
            requeue_pending: false,
        }
    }
}

struct Inner<N: Node> {
    lifecycle: Lifecycle<N>,
    /// Keys that currently declare this key as a dep, paired with the
    /// `RunToken` that was current for the rdep *at the time it declared
    /// the dependency*. A completion signal must be validated against this
    /// token (not the rdep's token at signal time) so that a rdep which was
    /// re-dirtied and restarted between declaring and this entry
    /// committing does not have its new attempt's `unsignaled_deps`
    /// wrongly decremented by a signal meant for the old one.
    reverse_deps: FnvHashMap<Arc<N>, RunToken>,
    next_run_token: u64,
    /// Bumped on every commit whose outcome differs from the one it
    /// replaced (or on a node's very first commit). A dependent that
    /// observed generation `g` for this key can tell whether it has
    /// meaningfully changed since by comparing `g` to the current value.
    generation: u64,
}

/// The per-key record the Node Store owns: value, deps, rdeps, and
/// lifecycle state, each entry synchronized independently of the rest of
/// the store.
pub struct Entry<N: Node> {
    key: Arc<N>,
    inner: Mutex<Inner<N>>,
}

impl<N: Node> Entry<N> {
    /// A freshly created, never-evaluated entry (Just-created): evaluation
    /// begins the first time a caller observes
    /// `NeedsScheduling`. Just-created and Evaluating are the same
    /// `Lifecycle` variant here, distinguished only by `dirty` being `None`
    /// and `scheduled` being unset.
    pub(crate) fn new(key: Arc<N>) -> Entry<N> {
        Entry {
            key,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Evaluating(Evaluating::fresh(RunToken(0))),
                reverse_deps: FnvHashMap::default(),
                next_run_token: 1,
                generation: 0,
            }),
        }
    }

    pub fn key(&self) -> &Arc<N> {
        &self.key
    }

    /// `true` if this entry is in state Done (value present, not awaiting
    /// re-validation).
    pub fn is_done(&self) -> bool {
        matches!(self.inner.lock().lifecycle, Lifecycle::Done { .. })
    }

    /// A read-only snapshot of the committed outcome, if Done.
    pub fn peek(&self) -> Option<Result<N::Value, N::Error>> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Done { outcome, .. } => Some(outcome.clone()),
            Lifecycle::Evaluating(_) => None,
        }
    }

    /// The generation this entry is currently at (see `Inner::generation`).
    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Registers `rdep` (evaluating under `rdep_token`) as depending on this
    /// key, returning whether the caller must schedule this entry, wait for
    /// an in-flight evaluation, or may use the already-committed outcome.
    pub(crate) fn add_reverse_dep_and_check_if_done(
        &self,
        rdep: Arc<N>,
        rdep_token: RunToken,
    ) -> AddRdepOutcome<N> {
        let mut inner = self.inner.lock();
        inner.reverse_deps.insert(rdep, rdep_token);
        match &mut inner.lifecycle {
            Lifecycle::Done { outcome, .. } => AddRdepOutcome::AlreadyDone(outcome.clone()),
            Lifecycle::Evaluating(evaluating) => {
                if !evaluating.scheduled {
                    evaluating.scheduled = true;
                    AddRdepOutcome::NeedsScheduling
                } else {
                    AddRdepOutcome::AlreadyEvaluating
                }
            }
        }
    }

    /// Like `add_reverse_dep_and_check_if_done`, but for a top-level root
    /// request that has no dependent key to register.
    pub(crate) fn claim_for_root(&self) -> AddRdepOutcome<N> {
        let mut inner = self.inner.lock();
        match &mut inner.lifecycle {
            Lifecycle::Done { outcome, .. } => AddRdepOutcome::AlreadyDone(outcome.clone()),
            Lifecycle::Evaluating(evaluating) => {
                if !evaluating.scheduled {
                    evaluating.scheduled = true;
                    AddRdepOutcome::NeedsScheduling
                } else {
                    AddRdepOutcome::AlreadyEvaluating
                }
            }
        }
    }

    /// Resets the per-attempt bookkeeping (declared deps, outstanding-dep
    /// count) ahead of invoking `compute`, without disturbing the entry's
    /// run token or dirty state. Called once before every invocation of
    /// `compute`, including restarts within the same evaluation episode.
    /// Returns the run token in effect, for use with `signal_dep` and
    /// `set_value`.
    ///
    /// Does not itself release reverse-dep links for deps the previous
    /// attempt declared and this one doesn't redeclare: the caller
    /// (`Coordinator::rebuild`) reads `declared_deps()` before calling this
    /// and again after `compute` returns, and calls `remove_reverse_dep` for
    /// whatever was dropped.
    pub(crate) fn begin_attempt(&self) -> RunToken {
        let mut inner = self.inner.lock();
        match &mut inner.lifecycle {
            Lifecycle::Evaluating(evaluating) => {
                evaluating.temporary_direct_deps.clear();
                evaluating.unsignaled_deps = 0;
                evaluating.requeue_pending = false;
                evaluating.run_token
            }
            Lifecycle::Done { .. } => unreachable!("begin_attempt on a Done entry"),
        }
    }

    /// Decrements the outstanding-dep count for the current run, returning
    /// whether the entry is now ready to be (re-)invoked. `token` must be
    /// the run token this entry was evaluating under at the moment it
    /// declared the dep that just completed; a signal carrying a stale
    /// token (the entry has since moved to a new run) is silently dropped.
    ///
    /// A key whose [`key::Keyed::supports_partial_reevaluation`] bit is set
    /// is handed back to the ready queue as soon as *any* declared dep of
    /// the current attempt resolves, rather than waiting for every
    /// outstanding one — the evaluator is expected to tolerate
    /// `values_missing` on whatever is still pending and re-declare it. This
    /// only applies while the evaluator itself is running
    /// (`dirty_state` is `None` or past `CheckDependencies`): a dirty node
    /// still re-requesting its *previous* deps one group at a time must see
    /// every member of a group settle before `group_changed` compares
    /// generations, or it would read a not-yet-committed dep's stale
    /// generation and mis-judge whether the group actually changed.
    pub(crate) fn signal_dep(&self, token: RunToken) -> bool {
        let mut inner = self.inner.lock();
        match &mut inner.lifecycle {
            Lifecycle::Evaluating(evaluating) if evaluating.run_token == token => {
                if evaluating.unsignaled_deps == 0 || evaluating.requeue_pending {
                    return false;
                }
                evaluating.unsignaled_deps -= 1;
                let validating_previous_deps = matches!(
                    evaluating.dirty.as_ref().map(|d| d.sub_state),
                    Some(DirtySubState::CheckDependencies)
                );
                let ready = if validating_previous_deps {
                    evaluating.unsignaled_deps == 0
                } else {
                    evaluating.unsignaled_deps == 0 || self.key.supports_partial_reevaluation()
                };
                if ready {
                    evaluating.requeue_pending = true;
                }
                ready
            }
            _ => false,
        }
    }

    /// Appends a dep group declared while computing `token`, and records how
    /// many of its members are not yet Done (the rest signal immediately).
    pub(crate) fn add_temporary_direct_dep_group(
        &self,
        token: RunToken,
        deps: Vec<Arc<N>>,
        not_yet_done: usize,
    ) {
        let mut inner = self.inner.lock();
        if let Lifecycle::Evaluating(evaluating) = &mut inner.lifecycle {
            if evaluating.run_token == token {
                evaluating.unsignaled_deps += not_yet_done;
                evaluating.temporary_direct_deps.push(deps);
            }
        }
    }

    pub(crate) fn add_singleton_temporary_direct_dep(
        &self,
        token: RunToken,
        dep: Arc<N>,
        not_yet_done: usize,
    ) {
        self.add_temporary_direct_dep_group(token, vec![dep], not_yet_done);
    }

    /// Registers a wait on an out-of-band signal rather than a named dep key
    /// (`add_external_dep`): bumps the outstanding-dep count for the
    /// current attempt by one, without appending to `temporary_direct_deps`.
    /// Cleared the same way a real dep is, via `signal_dep`.
    pub(crate) fn add_external_dep_marker(&self, token: RunToken) {
        let mut inner = self.inner.lock();
        if let Lifecycle::Evaluating(evaluating) = &mut inner.lifecycle {
            if evaluating.run_token == token {
                evaluating.unsignaled_deps += 1;
            }
        }
    }

    /// Commits `outcome` and transitions to Done, returning the rdeps to
    /// signal (each paired with the run token it declared this dep under)
    /// and the node's freshly declared deps (for Node Store bookkeeping —
    /// reverse-dep symmetry, I1), plus whether the outcome changed from the
    /// previous one. `dep_generations` is the generation of each declared
    /// dep as of this commit, parallel to the declared groups; it is safe
    /// to read them now because I2 guarantees every declared dep is Done
    /// before this node is.
    ///
    /// An `Err` outcome is always treated as changed: `N::Error` carries no
    /// equality, so there is no sound way to prove two errors are "the
    /// same" for change-pruning purposes.
    pub(crate) fn set_value(
        &self,
        token: RunToken,
        outcome: Result<N::Value, N::Error>,
        dep_generations: Vec<Vec<u64>>,
    ) -> Option<(FnvHashMap<Arc<N>, RunToken>, Vec<Vec<Arc<N>>>, bool)> {
        let mut inner = self.inner.lock();
        let (deps, previous_outcome) = match &inner.lifecycle {
            Lifecycle::Evaluating(evaluating) if evaluating.run_token == token => (
                evaluating.temporary_direct_deps.clone(),
                evaluating.dirty.as_ref().map(|d| d.previous_outcome.clone()),
            ),
            _ => return None,
        };
        let changed = match (&outcome, &previous_outcome) {
            (Ok(value), Some(Ok(previous))) => value != previous,
            _ => true,
        };
        if changed {
            inner.generation += 1;
        }
        inner.lifecycle = Lifecycle::Done {
            outcome,
            deps: deps.clone(),
            dep_generations,
        };
        Some((inner.reverse_deps.clone(), deps, changed))
    }

    /// Transitions a Done entry to Dirty, recording why (`dirty_type`) and
    /// snapshotting its previous outcome/deps for change pruning. Returns
    /// `false` if the entry was not Done (already dirty or still
    /// evaluating — mark_affected is then a no-op on this entry directly,
    /// though its rdeps are still walked by the caller).
    pub(crate) fn mark_dirty(&self, dirty_type: DirtyType) -> bool {
        let mut inner = self.inner.lock();
        let (outcome, deps, dep_generations) = match &inner.lifecycle {
            Lifecycle::Done {
                outcome,
                deps,
                dep_generations,
            } => (outcome.clone(), deps.clone(), dep_generations.clone()),
            Lifecycle::Evaluating(_) => return false,
        };
        let token = RunToken(inner.next_run_token);
        inner.next_run_token += 1;
        let sub_state = match dirty_type {
            DirtyType::Change => DirtySubState::NeedsRebuilding,
            DirtyType::Affected => DirtySubState::CheckDependencies,
        };
        inner.lifecycle = Lifecycle::Evaluating(Evaluating {
            run_token: token,
            temporary_direct_deps: Vec::new(),
            unsignaled_deps: 0,
            dirty: Some(DirtyState {
                sub_state,
                previous_outcome: outcome,
                previous_deps: deps,
                previous_dep_generations: dep_generations,
                next_group: 0,
            }),
            compute_state: None,
            scheduled: false,
            requeue_pending: false,
        });
        true
    }

    /// The dirty sub-state of the current evaluation attempt, if any.
    pub(crate) fn dirty_sub_state(&self) -> Option<DirtySubState> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(Evaluating {
                dirty: Some(dirty), ..
            }) => Some(dirty.sub_state),
            _ => None,
        }
    }

    pub(crate) fn set_dirty_sub_state(&self, token: RunToken, sub_state: DirtySubState) {
        let mut inner = self.inner.lock();
        if let Lifecycle::Evaluating(evaluating) = &mut inner.lifecycle {
            if evaluating.run_token == token {
                if let Some(dirty) = &mut evaluating.dirty {
                    dirty.sub_state = sub_state;
                }
            }
        }
    }

    /// The previous outcome, for change pruning, if this run is
    /// re-validating a dirty node.
    pub(crate) fn previous_outcome(&self) -> Option<Result<N::Value, N::Error>> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(Evaluating {
                dirty: Some(dirty), ..
            }) => Some(dirty.previous_outcome.clone()),
            _ => None,
        }
    }

    /// The next previously-declared dep group to re-request during
    /// `CheckDependencies`, if any remain.
    pub(crate) fn next_dirty_dep_group(&self) -> Option<Vec<Arc<N>>> {
        let mut inner = self.inner.lock();
        if let Lifecycle::Evaluating(Evaluating {
            dirty: Some(dirty), ..
        }) = &mut inner.lifecycle
        {
            let group = dirty.previous_deps.get(dirty.next_group).cloned();
            if group.is_some() {
                dirty.next_group += 1;
            }
            group
        } else {
            None
        }
    }

    /// The previously recorded dep generations for the group at
    /// `group_index`, used to tell whether the group most recently
    /// re-requested by `next_dirty_dep_group` actually changed.
    pub(crate) fn previous_dep_generations_for(&self, group_index: usize) -> Option<Vec<u64>> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(Evaluating {
                dirty: Some(dirty), ..
            }) => dirty.previous_dep_generations.get(group_index).cloned(),
            _ => None,
        }
    }

    /// Any previously declared dep groups not yet re-requested; used when a
    /// rebuild short-circuits `CheckDependencies` (a dep changed) to release
    /// the rdep links of groups that will not be re-declared.
    pub(crate) fn get_all_remaining_dirty_direct_deps(&self) -> Vec<Arc<N>> {
        let inner = self.inner.lock();
        if let Lifecycle::Evaluating(Evaluating {
            dirty: Some(dirty), ..
        }) = &inner.lifecycle
        {
            dirty.previous_deps[dirty.next_group..]
                .iter()
                .flatten()
                .cloned()
                .collect()
        } else {
            Vec::new()
        }
    }

    /// The outstanding-dep count for the current attempt, if `token` is
    /// still the live run token. Used to tell a genuine "still waiting on a
    /// pending dep" restart apart from one where nothing further will ever
    /// signal this entry (e.g. every declared dep is already Done).
    pub(crate) fn unsignaled_deps(&self, token: RunToken) -> Option<usize> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(evaluating) if evaluating.run_token == token => {
                Some(evaluating.unsignaled_deps)
            }
            _ => None,
        }
    }

    pub(crate) fn run_token(&self) -> Option<RunToken> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(evaluating) => Some(evaluating.run_token),
            Lifecycle::Done { .. } => None,
        }
    }

    /// Declared dep groups so far in the current (or last completed) run.
    /// Used by cycle detection to walk the declared-deps graph.
    pub(crate) fn declared_deps(&self) -> Vec<Vec<Arc<N>>> {
        match &self.inner.lock().lifecycle {
            Lifecycle::Evaluating(evaluating) => evaluating.temporary_direct_deps.clone(),
            Lifecycle::Done { deps, .. } => deps.clone(),
        }
    }

    /// Retrieves (constructing via `factory` on first use) per-key state
    /// that survives restarts of the current run, released automatically
    /// when the entry next leaves Evaluating.
    pub(crate) fn get_state<T, F>(&self, token: RunToken, factory: F) -> Option<Arc<Mutex<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T,
    {
        let mut inner = self.inner.lock();
        if let Lifecycle::Evaluating(evaluating) = &mut inner.lifecycle {
            if evaluating.run_token != token {
                return None;
            }
            if evaluating.compute_state.is_none() {
                evaluating.compute_state = Some(Box::new(Arc::new(Mutex::new(factory()))));
            }
            return evaluating
                .compute_state
                .as_ref()
                .and_then(|boxed| boxed.downcast_ref::<Arc<Mutex<T>>>())
                .cloned();
        }
        None
    }

    /// A snapshot of this entry's current reverse-dep keys, for transitive
    /// dirtying (`mark_affected`/`invalidate`).
    pub(crate) fn reverse_deps_snapshot(&self) -> Vec<Arc<N>> {
        self.inner.lock().reverse_deps.keys().cloned().collect()
    }

    /// Removes `stale` from this entry's reverse deps (used when a node
    /// retracts a previously declared dep on restart without re-declaring
    /// it).
    pub(crate) fn remove_reverse_dep(&self, stale: &Arc<N>) {
        self.inner.lock().reverse_deps.remove(stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::node::{NodeError, NodeOutcome};
    use key::Keyed;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct PartialKey(u32);

    impl Keyed for PartialKey {
        fn supports_partial_reevaluation(&self) -> bool {
            true
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct EagerKey(u32);

    impl Keyed for EagerKey {}

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Unused;

    impl NodeError for Unused {
        fn cyclic_error(_path: Vec<String>) -> Self {
            Unused
        }
        fn invalidated() -> Self {
            Unused
        }
    }

    impl Node for PartialKey {
        type Value = i32;
        type Error = Unused;
        fn compute(&self, _env: &Environment<Self>) -> NodeOutcome<Self> {
            NodeOutcome::Value(0)
        }
    }

    impl Node for EagerKey {
        type Value = i32;
        type Error = Unused;
        fn compute(&self, _env: &Environment<Self>) -> NodeOutcome<Self> {
            NodeOutcome::Value(0)
        }
    }

    #[test]
    fn partial_reevaluation_key_requeues_on_the_first_signal() {
        let entry: Entry<PartialKey> = Entry::new(Arc::new(PartialKey(0)));
        let token = entry.begin_attempt();
        entry.add_temporary_direct_dep_group(
            token,
            vec![Arc::new(PartialKey(1)), Arc::new(PartialKey(2))],
            2,
        );

        assert!(
            entry.signal_dep(token),
            "a partial-reevaluation key should requeue as soon as any declared dep resolves"
        );
        assert!(
            !entry.signal_dep(token),
            "a second signal before the next begin_attempt must not double-enqueue the entry"
        );

        // A fresh attempt clears the guard, so the next batch can requeue again.
        let token2 = entry.begin_attempt();
        entry.add_temporary_direct_dep_group(token2, vec![Arc::new(PartialKey(3))], 1);
        assert!(entry.signal_dep(token2));
    }

    #[test]
    fn default_key_waits_for_every_declared_dep() {
        let entry: Entry<EagerKey> = Entry::new(Arc::new(EagerKey(0)));
        let token = entry.begin_attempt();
        entry.add_temporary_direct_dep_group(
            token,
            vec![Arc::new(EagerKey(1)), Arc::new(EagerKey(2))],
            2,
        );

        assert!(
            !entry.signal_dep(token),
            "should not requeue until every declared dep in the batch has signaled"
        );
        assert!(
            entry.signal_dep(token),
            "the last outstanding dep should requeue it"
        );
    }

    #[test]
    fn checking_previous_deps_waits_for_the_full_group_even_for_a_partial_key() {
        let entry: Entry<PartialKey> = Entry::new(Arc::new(PartialKey(0)));
        let init_token = entry.begin_attempt();
        entry.set_value(init_token, Ok(1), Vec::new());
        assert!(entry.mark_dirty(DirtyType::Affected));
        assert_eq!(entry.dirty_sub_state(), Some(DirtySubState::CheckDependencies));

        let token = entry.begin_attempt();
        entry.add_temporary_direct_dep_group(
            token,
            vec![Arc::new(PartialKey(9)), Arc::new(PartialKey(10))],
            2,
        );

        assert!(
            !entry.signal_dep(token),
            "validating a previously declared dep group must wait for the whole group, \
             even for a partial-reevaluation key, or group_changed would read a \
             not-yet-committed dep's stale generation"
        );
        assert!(entry.signal_dep(token));
    }
}


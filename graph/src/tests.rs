// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use key::Keyed;

use crate::environment::Environment;
use crate::node::{Node, NodeError, NodeOutcome};
use crate::runtime::{Graph, InvalidationResult};

/// The recursive shape of a test node's identity, with no shared state: two
/// `TNode`s are the same key iff their shapes are equal.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum Shape {
    /// A mutable external input, read from `TContext::facts`.
    Fact(u64),
    /// The sum of one dep group's values.
    Sum(u64, Vec<Shape>),
    /// Depends on `Ring((id + 1) % modulus, modulus)`, letting tests build a
    /// cyclic dependency graph without an infinitely recursive `Shape`.
    Ring(u64, u64),
    /// Suspends via `Environment::add_external_dep` until
    /// `TContext::external_ready` is set.
    Wait(u64),
    /// Always commits `TErr::Invalidated`, for exercising automatic
    /// propagation of a plain (non-`_or_throw`) dependency's error.
    Fail(u64),
    /// Declares `Fact(100 + id)` on its first attempt, then retracts it in
    /// favor of `Fact(200 + id)` on every later attempt, for exercising
    /// reverse-dep cleanup of a retracted dep.
    Retracting(u64),
}

#[derive(Clone, Default)]
struct TContext {
    facts: Arc<Mutex<FnvHashMap<u64, i32>>>,
    runs: Arc<Mutex<Vec<TNode>>>,
    external_ready: Arc<AtomicBool>,
}

impl TContext {
    fn new() -> TContext {
        TContext::default()
    }

    fn set_fact(&self, id: u64, value: i32) {
        self.facts.lock().insert(id, value);
    }

    fn run_count(&self, node: &TNode) -> usize {
        self.runs.lock().iter().filter(|n| *n == node).count()
    }

    fn total_runs(&self) -> usize {
        self.runs.lock().len()
    }
}

#[derive(Clone)]
struct TNode {
    shape: Shape,
    ctx: TContext,
}

impl TNode {
    fn fact(ctx: &TContext, id: u64) -> TNode {
        TNode {
            shape: Shape::Fact(id),
            ctx: ctx.clone(),
        }
    }

    fn sum(ctx: &TContext, id: u64, deps: Vec<Shape>) -> TNode {
        TNode {
            shape: Shape::Sum(id, deps),
            ctx: ctx.clone(),
        }
    }

    fn ring(ctx: &TContext, id: u64, modulus: u64) -> TNode {
        TNode {
            shape: Shape::Ring(id, modulus),
            ctx: ctx.clone(),
        }
    }

    fn wait(ctx: &TContext, id: u64) -> TNode {
        TNode {
            shape: Shape::Wait(id),
            ctx: ctx.clone(),
        }
    }

    fn fail(ctx: &TContext, id: u64) -> TNode {
        TNode {
            shape: Shape::Fail(id),
            ctx: ctx.clone(),
        }
    }

    fn retracting(ctx: &TContext, id: u64) -> TNode {
        TNode {
            shape: Shape::Retracting(id),
            ctx: ctx.clone(),
        }
    }

    fn shape(&self) -> Shape {
        self.shape.clone()
    }

    fn with_shape(&self, shape: Shape) -> TNode {
        TNode {
            shape,
            ctx: self.ctx.clone(),
        }
    }
}

impl PartialEq for TNode {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
    }
}

impl Eq for TNode {}

impl Hash for TNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shape.hash(state);
    }
}

impl fmt::Debug for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.shape, f)
    }
}

impl Keyed for TNode {}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TErr {
    Cyclic(Vec<String>),
    Invalidated,
}

impl NodeError for TErr {
    fn cyclic_error(path: Vec<String>) -> Self {
        TErr::Cyclic(path)
    }

    fn invalidated() -> Self {
        TErr::Invalidated
    }
}

impl Node for TNode {
    type Value = i32;
    type Error = TErr;

    fn compute(&self, env: &Environment<Self>) -> NodeOutcome<Self> {
        match self.shape.clone() {
            Shape::Fact(id) => {
                let value = *self.ctx.facts.lock().get(&id).unwrap_or(&0);
                self.ctx.runs.lock().push(self.clone());
                NodeOutcome::Value(value)
            }
            Shape::Sum(_id, dep_shapes) => {
                let deps: Vec<TNode> = dep_shapes
                    .into_iter()
                    .map(|shape| self.with_shape(shape))
                    .collect();
                let values = env.get_values(&deps);
                if values.iter().any(Option::is_none) {
                    return NodeOutcome::Restart;
                }
                self.ctx.runs.lock().push(self.clone());
                NodeOutcome::Value(values.into_iter().flatten().sum())
            }
            Shape::Ring(id, modulus) => {
                let next = self.with_shape(Shape::Ring((id + 1) % modulus, modulus));
                match env.get_value_or_throw(&next) {
                    Ok(Some(value)) => NodeOutcome::Value(value + 1),
                    Ok(None) => NodeOutcome::Restart,
                    Err(error) => NodeOutcome::Error(error),
                }
            }
            Shape::Wait(id) => {
                if self.ctx.external_ready.load(Ordering::SeqCst) {
                    NodeOutcome::Value(id as i32)
                } else {
                    env.add_external_dep();
                    NodeOutcome::Restart
                }
            }
            Shape::Fail(_id) => NodeOutcome::Error(TErr::Invalidated),
            Shape::Retracting(id) => {
                let attempt = env.get_state(|| 0usize);
                let mut count = attempt.lock();
                *count += 1;
                let n = *count;
                drop(count);
                if n == 1 {
                    // Declare the dep we're about to retract, then restart
                    // unconditionally without waiting for it to resolve.
                    let _ = env.get_value(&self.with_shape(Shape::Fact(100 + id)));
                    NodeOutcome::Restart
                } else {
                    match env.get_value(&self.with_shape(Shape::Fact(200 + id))) {
                        Some(value) => NodeOutcome::Value(value),
                        None => NodeOutcome::Restart,
                    }
                }
            }
        }
    }
}

/// A throwaway Tokio runtime just to hand `Graph::new` an `Executor` handle;
/// nothing in these tests spawns onto it.
fn test_graph() -> (tokio::runtime::Runtime, Graph<TNode>) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let graph = Graph::new(task_executor::Executor::from_handle(rt.handle().clone()));
    (rt, graph)
}

#[test]
fn evaluate_with_no_roots_does_nothing() {
    let (_rt, graph) = test_graph();
    let result = graph.evaluate(&[], false).unwrap();
    assert!(result.results.is_empty());
    assert!(result.cycles.is_empty());
}

#[test]
fn chain_computes_bottom_up_and_is_cached_on_rerun() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let c = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 3);
    let b = TNode::sum(&ctx, 2, vec![c.shape()]);
    let a = TNode::sum(&ctx, 3, vec![b.shape()]);

    let result = graph.evaluate(&[a.clone()], false).unwrap();
    assert_eq!(result.results.get(&a), Some(&Ok(3)));

    let runs_before = ctx.total_runs();
    let result = graph.evaluate(&[a.clone()], false).unwrap();
    assert_eq!(result.results.get(&a), Some(&Ok(3)));
    assert_eq!(
        ctx.total_runs(),
        runs_before,
        "a Done root should not re-invoke any evaluator"
    );
}

#[test]
fn change_pruning_skips_recompute_when_dep_value_is_unchanged() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let b = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 5);
    let a = TNode::sum(&ctx, 2, vec![b.shape()]);

    graph.evaluate(&[a.clone()], false).unwrap();
    assert_eq!(ctx.run_count(&a), 1);

    // Re-set the same value and invalidate: b recomputes (DirtyType::Change
    // always re-runs its evaluator), but produces the identical value, so
    // a's generation check during CheckDependencies finds nothing changed.
    ctx.set_fact(1, 5);
    graph.invalidate(&[b.clone()]);
    let result = graph.evaluate(&[a.clone()], false).unwrap();

    assert_eq!(result.results.get(&a), Some(&Ok(5)));
    assert_eq!(ctx.run_count(&b), 2);
    assert_eq!(
        ctx.run_count(&a),
        1,
        "a should be change-pruned rather than recomputed"
    );
}

#[test]
fn change_pruning_recomputes_when_dep_value_changes() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let b = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 5);
    let a = TNode::sum(&ctx, 2, vec![b.shape()]);

    graph.evaluate(&[a.clone()], false).unwrap();
    assert_eq!(ctx.run_count(&a), 1);

    ctx.set_fact(1, 9);
    graph.invalidate(&[b.clone()]);
    let result = graph.evaluate(&[a.clone()], false).unwrap();

    assert_eq!(result.results.get(&a), Some(&Ok(9)));
    assert_eq!(ctx.run_count(&a), 2);
}

#[test]
fn invalidate_reports_cleared_and_affected_counts() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let b = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 1);
    let a = TNode::sum(&ctx, 2, vec![b.shape()]);
    graph.evaluate(&[a.clone()], false).unwrap();

    let result = graph.invalidate(&[b.clone()]);
    assert_eq!(
        result,
        InvalidationResult {
            cleared: 1,
            dirtied: 1,
        }
    );
}

#[test]
fn parallel_fan_out_sums_a_thousand_facts() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let dep_shapes: Vec<Shape> = (0..1000u64)
        .map(|id| {
            ctx.set_fact(id, id as i32);
            Shape::Fact(id)
        })
        .collect();
    let root = TNode::sum(&ctx, u64::MAX, dep_shapes);

    let result = graph.evaluate(&[root.clone()], false).unwrap();
    assert_eq!(result.results.get(&root), Some(&Ok(499_500)));

    let runs_before = ctx.total_runs();
    graph.evaluate(&[root.clone()], false).unwrap();
    assert_eq!(
        ctx.total_runs(),
        runs_before,
        "a no-op re-run must not re-invoke a single evaluator"
    );
}

#[test]
fn a_three_node_cycle_fails_with_keep_going_false() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let root = TNode::ring(&ctx, 0, 3);
    let result = graph.evaluate(&[root.clone()], false).unwrap();

    assert_eq!(result.cycles.len(), 1);
    assert_eq!(result.cycles[0].len(), 3);
    match result.results.get(&root) {
        Some(Err(TErr::Cyclic(_))) => {}
        other => panic!("expected a cyclic-error outcome, got {other:?}"),
    }
}

#[test]
fn a_cycle_does_not_block_an_unrelated_root_under_keep_going() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let cyclic_root = TNode::ring(&ctx, 0, 3);
    let fact_root = TNode::fact(&ctx, 7);
    ctx.set_fact(7, 42);

    let result = graph
        .evaluate(&[cyclic_root.clone(), fact_root.clone()], true)
        .unwrap();

    assert!(matches!(
        result.results.get(&cyclic_root),
        Some(Err(TErr::Cyclic(_)))
    ));
    assert_eq!(result.results.get(&fact_root), Some(&Ok(42)));
}

#[test]
fn external_dep_suspends_until_signaled() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();
    let node = TNode::wait(&ctx, 11);

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            ctx.external_ready.store(true, Ordering::SeqCst);
            graph.signal_external_dep(&node);
        });
        let result = graph.evaluate(&[node.clone()], false).unwrap();
        assert_eq!(result.results.get(&node), Some(&Ok(11)));
    });
}

#[test]
fn a_single_node_depending_on_itself_is_a_length_one_cycle() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let root = TNode::ring(&ctx, 0, 1);
    let result = graph.evaluate(&[root.clone()], false).unwrap();

    assert_eq!(result.cycles.len(), 1);
    assert_eq!(result.cycles[0].len(), 1);
    match result.results.get(&root) {
        Some(Err(TErr::Cyclic(_))) => {}
        other => panic!("expected a cyclic-error outcome, got {other:?}"),
    }
}

#[test]
fn visit_live_reachable_only_yields_entries_reachable_from_the_given_roots() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let shared = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 4);
    let unrelated = TNode::fact(&ctx, 2);
    ctx.set_fact(2, 9);
    let root = TNode::sum(&ctx, 3, vec![shared.shape()]);

    graph
        .evaluate(&[root.clone(), unrelated.clone()], false)
        .unwrap();

    let mut seen: Vec<TNode> = Vec::new();
    graph.visit_live_reachable(&[root.clone()], |key, outcome| {
        seen.push(key.clone());
        assert!(outcome.is_ok());
    });

    assert!(seen.contains(&root));
    assert!(seen.contains(&shared));
    assert!(
        !seen.contains(&unrelated),
        "unrelated root should not be reachable from `root`'s declared deps"
    );
}

#[test]
fn visualize_writes_a_dot_file_naming_every_reachable_node() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let b = TNode::fact(&ctx, 1);
    ctx.set_fact(1, 5);
    let a = TNode::sum(&ctx, 2, vec![b.shape()]);
    graph.evaluate(&[a.clone()], false).unwrap();

    let path = std::env::temp_dir().join(format!("ridge-visualize-test-{:?}.dot", thread::current().id()));
    graph.visualize(&[a.clone()], &path).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert!(contents.contains("digraph"));
    assert!(contents.contains("Sum"));
    assert!(contents.contains("Fact"));
}

#[test]
fn a_plain_dependency_error_propagates_automatically_instead_of_hanging() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let failing = TNode::fail(&ctx, 1);
    let root = TNode::sum(&ctx, 2, vec![failing.shape()]);

    let result = graph.evaluate(&[root.clone()], false).unwrap();
    assert_eq!(result.results.get(&root), Some(&Err(TErr::Invalidated)));
}

#[test]
fn a_plain_dependency_error_does_not_block_an_unrelated_root_under_keep_going() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let failing = TNode::fail(&ctx, 1);
    let root = TNode::sum(&ctx, 2, vec![failing.shape()]);
    let fact_root = TNode::fact(&ctx, 7);
    ctx.set_fact(7, 42);

    let result = graph
        .evaluate(&[root.clone(), fact_root.clone()], true)
        .unwrap();

    assert_eq!(result.results.get(&root), Some(&Err(TErr::Invalidated)));
    assert_eq!(result.results.get(&fact_root), Some(&Ok(42)));
}

#[test]
fn retracting_a_dep_on_restart_removes_the_stale_reverse_dep() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    ctx.set_fact(201, 77);
    let root = TNode::retracting(&ctx, 1);

    let result = graph.evaluate(&[root.clone()], false).unwrap();
    assert_eq!(result.results.get(&root), Some(&Ok(77)));

    // `root` requested Fact(101) on its first attempt but never redeclared
    // it once it switched to Fact(201); invalidating it should not reach
    // back to `root` if the stale reverse dep was actually released.
    let retracted_dep = TNode::fact(&ctx, 101);
    let invalidation = graph.invalidate(&[retracted_dep]);
    assert_eq!(
        invalidation.dirtied, 0,
        "a retracted dep must not keep a reverse-dep link back to the node that dropped it"
    );
}

#[test]
fn delete_if_runs_clean_up_and_drops_matching_entries() {
    let ctx = TContext::new();
    let (_rt, graph) = test_graph();

    let a = TNode::fact(&ctx, 1);
    let b = TNode::fact(&ctx, 2);
    graph.evaluate(&[a.clone(), b.clone()], false).unwrap();
    assert_eq!(graph.len(), 2);

    graph.delete_if(|n| *n == a);
    assert_eq!(graph.len(), 1);
}

// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use thiserror::Error;

/// Engine-internal failures. Evaluator-reported errors are never carried
/// here: they travel as `N::Error` and are committed as ordinary node
/// values (see `crate::node::NodeOutcome::Error`).
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no evaluator is registered for a requested dependency")]
    MissingDep,
    #[error("evaluation was cancelled")]
    Cancelled,
}

//! Structured fan-out over independent sub-resources.
//!
//! A [`FanOut`] owns one future per sub-resource (per-unit config value,
//! per-unit certificate pair, per-unit delete, ...). `run` drives them all to
//! completion and only then folds the failures into a single error. No task
//! sees another task's result, and a failure never stops the others from
//! being issued. Partial successes stay applied.

use std::future::Future;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error};

use crate::Error;

type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// A group of independent fallible tasks joined before returning.
pub struct FanOut<'a> {
    context: String,
    tasks: Vec<(String, TaskFuture<'a>)>,
}

impl<'a> FanOut<'a> {
    /// Create an empty group; `context` names the operation in errors and logs
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            tasks: Vec::new(),
        }
    }

    /// Queue a task labelled with the sub-resource it works on
    pub fn push<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'a,
    {
        self.tasks.push((label.into(), Box::pin(task)));
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing was queued
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task to completion and aggregate the failures.
    pub async fn run(self) -> Result<(), Error> {
        let context = self.context;
        if self.tasks.is_empty() {
            return Ok(());
        }

        let count = self.tasks.len();
        debug!(count, context = %context, "running sub-resource tasks concurrently");

        let mut pending: FuturesUnordered<_> = self
            .tasks
            .into_iter()
            .map(|(label, task)| async move { (label, task.await) })
            .collect();

        let mut errors = Vec::new();
        while let Some((label, result)) = pending.next().await {
            if let Err(e) = result {
                error!(task = %label, context = %context, error = %e, "sub-resource task failed");
                errors.push(e);
            }
        }

        Error::aggregate(context, errors)
    }
}

// ========================================================================================
//                          Queue configuration & startup
// ========================================================================================
//
// A queue instance is configured entirely before it runs. The `Builder` is the
// Created stage of the lifecycle: it owns the capacity, the worker stage and
// the merger stage, and nothing it holds can change once `start` has spawned
// the pool. Misconfiguration is caught here, before the first task could ever
// be accepted.

use crate::pipeline::WorkQueue;
use crate::types::{Fold, Transform};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Why a configured queue could not be brought up to the Running state.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("No worker stage was configured. Call `worker` before `start`.")]
    MissingWorker,

    #[error("No merger stage was configured. Call `merger` before `start`.")]
    MissingMerger,

    #[error("The operating system refused to spawn the {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Staged configuration for a [`WorkQueue`].
///
/// `T` is the task payload, `R` the per-task result, `A` the accumulator. All
/// three are fixed for the lifetime of the instance.
pub struct Builder<T, R, A> {
    capacity: usize,
    transform: Option<Transform<T, R>>,
    concurrency: usize,
    merger: Option<(Fold<A, R>, A)>,
}

impl<T, R, A> Builder<T, R, A>
where
    T: Send + 'static,
    R: Send + 'static,
    A: Send + 'static,
{
    /// Begins configuring a queue whose task channel buffers up to `capacity`
    /// pending tasks.
    ///
    /// A capacity of zero means synchronous handoff: `submit` blocks until a
    /// worker is ready to receive the task, so a fast producer is paced by the
    /// pool instead of buffering without bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            transform: None,
            concurrency: 0,
            merger: None,
        }
    }

    /// Registers the per-task transform and the number of workers applying it.
    ///
    /// A `concurrency` of zero resolves to one worker per available CPU
    /// (`num_cpus::get().max(1)`); any positive value is used verbatim. The
    /// resolved count is observable via [`WorkQueue::concurrency`].
    ///
    /// The transform is invoked concurrently from every worker, each call on a
    /// different task; it must not mutate shared state without its own
    /// synchronization. The pool has no retry path, so a transform that can
    /// fail should report failure in its result type (`R = Result<V, E>`
    /// works well, letting the fold pattern-match) rather than panic: a panic
    /// escaping the transform kills the worker and is re-raised from
    /// [`WorkQueue::join`].
    pub fn worker<F>(mut self, transform: F, concurrency: usize) -> Self
    where
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self.concurrency = concurrency;
        self
    }

    /// Registers the fold function and the seed accumulator.
    ///
    /// The fold runs on a single dedicated thread and sees results in
    /// completion order, which for more than one worker is unordered with
    /// respect to submission. Callers must supply a fold whose outcome does
    /// not depend on arrival order (sums, histograms, set unions).
    pub fn merger<F>(mut self, fold: F, seed: A) -> Self
    where
        F: FnMut(A, R) -> A + Send + 'static,
    {
        self.merger = Some((Box::new(fold), seed));
        self
    }

    /// Spawns the reducer and the worker pool, consuming the configuration.
    ///
    /// On success the returned queue is Running and accepting tasks. Both
    /// stages must have been configured first.
    pub fn start(self) -> Result<WorkQueue<T, A>, BuildError> {
        let transform = self.transform.ok_or(BuildError::MissingWorker)?;
        let (fold, seed) = self.merger.ok_or(BuildError::MissingMerger)?;
        let concurrency = resolve_concurrency(self.concurrency);
        WorkQueue::spawn(self.capacity, transform, concurrency, fold, seed)
    }
}

fn resolve_concurrency(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().max(1)
    } else {
        requested
    }
}

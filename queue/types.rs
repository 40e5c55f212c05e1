// ========================================================================================
//                             Shared Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::sync::Arc;

/// The per-task transform, shared by every worker in the pool.
pub(crate) type Transform<T, R> = Arc<dyn Fn(T) -> R + Send + Sync>;

/// The fold function, owned exclusively by the reducer thread.
pub(crate) type Fold<A, R> = Box<dyn FnMut(A, R) -> A + Send>;

/// The lifecycle of a running queue instance.
///
/// Transitions are strictly linear: Running -> Draining -> Completed. There is
/// no path back to Running, and the configuration stage before Running is the
/// [`Builder`](crate::config::Builder) itself, which cannot accept tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Workers and the reducer are live; `submit` is accepting tasks.
    Running,
    /// `join` has been called: the queue is closed and in-flight work is
    /// finishing. `submit` is illegal.
    Draining,
    /// Every result has been folded and the accumulator has been handed back.
    /// The instance is not reusable.
    Completed,
}

impl Lifecycle {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Running => 0,
            Lifecycle::Draining => 1,
            Lifecycle::Completed => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Running,
            1 => Lifecycle::Draining,
            2 => Lifecycle::Completed,
            other => unreachable!("corrupt lifecycle flag: {other}"),
        }
    }
}

//! Error types produced by the runtime and by the tasks it drives.
//!
//! A single [`Error`] enum covers cancellation, I/O failure, supervision and
//! application failures. It is `Clone + Send + Sync` so that a task outcome can
//! be memoized, handed to any number of joiners, and shipped to other threads.
//!
//! Cancellation is never a panic or an unwind: every suspension point returns
//! `Result<_, Error>`, and the two cancellation variants travel up the task's
//! own call stack through `?` like any other error.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::scope::ScopeId;
use crate::task::TaskId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the runtime and by task bodies.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Soft cancellation: a `move_on_after` deadline fired. The owning scope
    /// swallows it and evaluates to `None`.
    #[error("cancelled by {scope}")]
    Cancelled {
        /// Scope whose deadline fired.
        scope: ScopeId,
    },

    /// Hard cancellation: explicit termination, a `cancel_after` deadline, or an
    /// explicit scope cancel. Always re-raised.
    #[error("terminated{}", .scope.map(|s| format!(" by {s}")).unwrap_or_default())]
    Terminated {
        /// Scope that fired, or `None` for an explicit `terminate`.
        scope: Option<ScopeId>,
    },

    /// An I/O operation failed while the task was suspended on it.
    #[error("i/o failure: {0}")]
    Io(Arc<io::Error>),

    /// A supervised child terminated with an error; its siblings were cancelled.
    #[error("{task} failed: {source}")]
    ChildFailed {
        /// The child that failed first.
        task: TaskId,
        /// The child's own error.
        source: Box<Error>,
    },

    /// A task body panicked. The panic is caught at the task boundary.
    #[error("{task} panicked: {message}")]
    Panicked {
        /// The task whose body panicked.
        task: TaskId,
        /// Panic payload rendered as text.
        message: String,
    },

    /// An application failure carrying only a message.
    #[error("{0}")]
    Raised(Arc<str>),

    /// An application failure wrapping an arbitrary error.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),

    /// A throttle rate that is not finite and positive.
    #[error("invalid rate {0}: must be finite and positive")]
    InvalidRate(f64),

    /// Nothing can ever wake the remaining tasks.
    #[error("runtime stalled: {blocked} task(s) blocked with nothing left to wake them")]
    Deadlock {
        /// Number of tasks still registered with the scheduler.
        blocked: usize,
    },

    /// A runtime thread died before recording its root task's result.
    #[error("runtime thread exited without a result")]
    ThreadPanicked,
}

impl Error {
    /// Builds an application error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Raised(Arc::from(message.into()))
    }

    /// Wraps an arbitrary error.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(error))
    }

    /// `true` for the soft and hard cancellation variants.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::Terminated { .. })
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Cancelled { .. } => "cancelled",
            Error::Terminated { .. } => "terminated",
            Error::Io(_) => "io_failure",
            Error::ChildFailed { .. } => "child_failed",
            Error::Panicked { .. } => "panicked",
            Error::Raised(_) => "raised",
            Error::Other(_) => "other",
            Error::InvalidRate(_) => "invalid_rate",
            Error::Deadlock { .. } => "deadlock",
            Error::ThreadPanicked => "thread_panicked",
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(Error::msg("boom").as_label(), "raised");
        assert_eq!(Error::Terminated { scope: None }.as_label(), "terminated");
        assert_eq!(Error::InvalidRate(0.0).as_label(), "invalid_rate");
    }

    #[test]
    fn only_cancellation_variants_are_cancellations() {
        assert!(Error::Terminated { scope: None }.is_cancellation());
        assert!(Error::Cancelled {
            scope: ScopeId::next()
        }
        .is_cancellation());
        assert!(!Error::msg("boom").is_cancellation());
        assert!(!Error::from(io::Error::other("disk")).is_cancellation());
    }

    #[test]
    fn display_renders_context() {
        assert_eq!(Error::Terminated { scope: None }.to_string(), "terminated");

        let scope = ScopeId::next();
        let hard = Error::Terminated { scope: Some(scope) };
        assert_eq!(hard.to_string(), format!("terminated by {scope}"));

        let child = Error::ChildFailed {
            task: TaskId::next(),
            source: Box::new(Error::msg("boom")),
        };
        assert!(child.to_string().ends_with("failed: boom"));
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {other:?}"),
        }
    }
}

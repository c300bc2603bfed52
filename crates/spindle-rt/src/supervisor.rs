//! Structured supervision of a group of child tasks.
//!
//! `cx.supervise(|sup| ...)` opens a hard-cancel scope around its body, runs
//! it, then waits for every child spawned through the [`Supervisor`]. The
//! first child to fail fires the scope, which terminates its siblings, and
//! its error is re-raised from `supervise` once all of them are gone.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{poll_fn, Future};
use std::rc::Rc;
use std::task::Poll;

use tracing::debug;

use crate::context::Cx;
use crate::error::{Error, Result};
use crate::scope::{is_own_cancellation, Mode, ScopeCore, ScopeGuard, ScopeId};
use crate::task::{JoinHandle, Suspension, TaskCore, TaskId};

struct SupervisorState {
    scope: Rc<ScopeCore>,
    owner: Rc<TaskCore>,
    pending: Cell<usize>,
    failure: RefCell<Option<(TaskId, Error)>>,
}

impl SupervisorState {
    fn child_exited(&self, child: TaskId, outcome: Option<&Error>) {
        self.pending.set(self.pending.get().saturating_sub(1));
        if let Some(err) = outcome {
            // Siblings torn down by this supervisor's own scope are not
            // failures, and neither is a child terminated through its handle.
            let recorded = self.failure.borrow().is_some();
            let explicit = matches!(err, Error::Terminated { scope: None });
            if !recorded && !explicit && !is_own_cancellation(&self.scope, err) {
                debug!(task = %child, error = %err, scope = %self.scope.id(), "supervised task failed");
                *self.failure.borrow_mut() = Some((child, err.clone()));
                self.scope.fire();
            }
        }
        self.owner.wake();
    }
}

/// Spawns children into a supervision group. Passed to the body of
/// [`Cx::supervise`]; clones may be handed to children to grow the group.
#[derive(Clone)]
pub struct Supervisor {
    cx: Cx,
    state: Rc<SupervisorState>,
}

impl Supervisor {
    /// Spawn a supervised child. It runs inside the supervisor's scope and
    /// `supervise` does not return before it terminates.
    pub fn spawn<F, Fut, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce(Cx) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let handle = self.cx.spawn(body);
        let core = handle.core();
        core.adopt_scope(&self.state.scope);
        self.state.pending.set(self.state.pending.get() + 1);

        let state = self.state.clone();
        let id = core.id();
        core.add_exit_hook(Box::new(move |outcome| state.child_exited(id, outcome)));
        handle
    }

    /// Children that have not terminated yet.
    pub fn pending(&self) -> usize {
        self.state.pending.get()
    }

    pub fn scope_id(&self) -> ScopeId {
        self.state.scope.id()
    }

    /// Terminate every supervised child.
    pub fn cancel(&self) {
        self.state.scope.fire();
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("scope", &self.state.scope.id())
            .field("pending", &self.state.pending.get())
            .field("failed", &self.state.failure.borrow().is_some())
            .finish()
    }
}

impl Cx {
    /// Run `body` with a [`Supervisor`], then wait for all supervised
    /// children.
    ///
    /// If the body fails, or the calling task is cancelled while waiting,
    /// the remaining children are terminated and awaited before the error is
    /// returned. If a child fails, its siblings are terminated and the call
    /// returns `Error::ChildFailed` naming it. A child that ended through a
    /// cancellation from an enclosing scope passes that cancellation through
    /// unchanged so the enclosing scope can handle it. A child terminated
    /// through its own [`JoinHandle::terminate`] counts as a normal exit.
    pub async fn supervise<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Supervisor) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = ScopeGuard::enter(self, Mode::Cancel, None);
        let state = Rc::new(SupervisorState {
            scope: guard.scope().clone(),
            owner: self.task.clone(),
            pending: Cell::new(0),
            failure: RefCell::new(None),
        });
        let supervisor = Supervisor {
            cx: self.clone(),
            state: state.clone(),
        };

        let outcome = match self.task.check() {
            Ok(()) => body(supervisor).await,
            Err(err) => Err(err),
        };
        // The owner waits outside its own scope so a failing child does not
        // interrupt the wait.
        self.task.leave_scope(&state.scope);
        if outcome.is_err() {
            state.scope.fire();
        }

        let waited = self.wait_supervised(&state, true).await;
        if waited.is_err() {
            state.scope.fire();
            let _ = self.wait_supervised(&state, false).await;
        }
        drop(guard);

        if let Some((task, err)) = state.failure.borrow_mut().take() {
            if err.is_cancellation() {
                return Err(err);
            }
            return Err(Error::ChildFailed {
                task,
                source: Box::new(err),
            });
        }
        let value = outcome?;
        waited?;
        Ok(value)
    }

    async fn wait_supervised(&self, state: &SupervisorState, interruptible: bool) -> Result<()> {
        poll_fn(|_| {
            if state.pending.get() == 0 {
                return Poll::Ready(Ok(()));
            }
            if interruptible {
                if let Err(err) = self.task.check() {
                    return Poll::Ready(Err(err));
                }
            }
            self.task.suspend(Suspension::Children);
            Poll::Pending
        })
        .await
    }
}

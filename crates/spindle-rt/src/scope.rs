//! Cancellation scopes.
//!
//! A scope covers the dynamic extent of a guarded future plus every task
//! spawned inside it. When a scope fires (deadline or explicit cancel) each
//! registered task is woken and sees the scope's error at its next
//! suspension point. Soft scopes swallow their own error at the boundary and
//! evaluate to `None`; hard scopes re-raise it.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::Cx;
use crate::error::{Error, Result};
use crate::reactor::TimerToken;
use crate::scheduler::Scheduler;
use crate::task::{TaskCore, TaskId};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque scope identity, carried by the cancellation errors a scope raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// How a scope behaves when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Abort the guarded work and evaluate to `None`.
    MoveOn,
    /// Abort the guarded work and raise `Error::Terminated`.
    Cancel,
}

pub(crate) struct ScopeCore {
    id: ScopeId,
    mode: Mode,
    deadline: Option<Instant>,
    fired: Cell<bool>,
    closed: Cell<bool>,
    timer: Cell<Option<TimerToken>>,
    tasks: RefCell<Vec<(TaskId, Weak<TaskCore>)>>,
    sched: Weak<Scheduler>,
}

impl ScopeCore {
    /// Creates a scope, arming a reactor timer when it has a deadline.
    pub(crate) fn new(sched: &Rc<Scheduler>, mode: Mode, deadline: Option<Instant>) -> Rc<Self> {
        let scope = Rc::new(Self {
            id: ScopeId::next(),
            mode,
            deadline,
            fired: Cell::new(false),
            closed: Cell::new(false),
            timer: Cell::new(None),
            tasks: RefCell::new(Vec::new()),
            sched: Rc::downgrade(sched),
        });
        if let Some(deadline) = deadline {
            let weak = Rc::downgrade(&scope);
            let token = sched.reactor.arm_callback(
                deadline,
                Box::new(move || {
                    if let Some(scope) = weak.upgrade() {
                        scope.timer.set(None);
                        scope.fire();
                    }
                }),
            );
            scope.timer.set(Some(token));
        }
        scope
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error tasks inside this scope observe once it fired.
    pub(crate) fn error(&self) -> Error {
        match self.mode {
            Mode::MoveOn => Error::Cancelled { scope: self.id },
            Mode::Cancel => Error::Terminated {
                scope: Some(self.id),
            },
        }
    }

    pub(crate) fn fired_error(&self) -> Option<Error> {
        self.fired.get().then(|| self.error())
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.get()
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.get()
    }

    /// Whether `err` is this scope's own soft cancellation.
    fn swallows(&self, err: &Error) -> bool {
        matches!(err, Error::Cancelled { scope } if *scope == self.id)
    }

    /// Whether `err` is this scope's own hard cancellation.
    fn owns(&self, err: &Error) -> bool {
        matches!(err, Error::Terminated { scope: Some(scope) } if *scope == self.id)
    }

    pub(crate) fn register(&self, task: &Rc<TaskCore>) {
        let id = task.id();
        let mut tasks = self.tasks.borrow_mut();
        if !tasks.iter().any(|(t, _)| *t == id) {
            tasks.push((id, Rc::downgrade(task)));
        }
    }

    pub(crate) fn deregister(&self, task: TaskId) {
        self.tasks.borrow_mut().retain(|(t, _)| *t != task);
    }

    /// Trigger cancellation for every task currently registered.
    pub(crate) fn fire(&self) {
        if self.closed.get() || self.fired.replace(true) {
            return;
        }
        self.disarm();
        let tasks: Vec<Rc<TaskCore>> = self
            .tasks
            .borrow()
            .iter()
            .filter_map(|(_, t)| t.upgrade())
            .collect();
        debug!(scope = %self.id, mode = ?self.mode, tasks = tasks.len(), "scope fired");
        for task in tasks {
            task.notify_cancelled();
        }
    }

    fn disarm(&self) {
        if let Some(token) = self.timer.take() {
            if let Some(sched) = self.sched.upgrade() {
                sched.reactor.timer_cancel(token);
            }
        }
    }

    /// Disarm the timer and forget tracked tasks. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.disarm();
        self.tasks.borrow_mut().clear();
    }
}

/// Leaves and closes a scope on every exit path, including drop of the
/// enclosing future.
pub(crate) struct ScopeGuard {
    task: Rc<TaskCore>,
    scope: Rc<ScopeCore>,
}

impl ScopeGuard {
    pub(crate) fn enter(cx: &Cx, mode: Mode, deadline: Option<Instant>) -> Self {
        let scope = ScopeCore::new(&cx.sched, mode, deadline);
        cx.task.enter_scope(&scope);
        Self {
            task: cx.task.clone(),
            scope,
        }
    }

    pub(crate) fn scope(&self) -> &Rc<ScopeCore> {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.task.leave_scope(&self.scope);
        self.scope.close();
    }
}

/// Handle to an explicit cancel scope, passed to the body of
/// [`Cx::cancel_scope`].
#[derive(Clone)]
pub struct ScopeHandle {
    scope: Rc<ScopeCore>,
}

impl ScopeHandle {
    pub fn id(&self) -> ScopeId {
        self.scope.id
    }

    /// Fire the scope now. Tasks inside it observe the cancellation at their
    /// next suspension point.
    pub fn cancel(&self) {
        self.scope.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_fired()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.scope.deadline
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.scope.id)
            .field("mode", &self.scope.mode)
            .field("cancelled", &self.scope.is_fired())
            .finish()
    }
}

/// Map a guarded outcome at its own scope boundary.
fn settle<T>(scope: &ScopeCore, outcome: Result<T>) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(err) if scope.swallows(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

impl Cx {
    async fn guarded<T, Fut>(&self, mode: Mode, deadline: Option<Instant>, fut: Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        let guard = ScopeGuard::enter(self, mode, deadline);
        let outcome = match self.task.check() {
            Ok(()) => fut.await,
            Err(err) => Err(err),
        };
        settle(guard.scope(), outcome)
    }

    /// Run `fut` for at most `duration`. On expiry the guarded work is
    /// abandoned and the call returns `Ok(None)`. Cancellation coming from an
    /// enclosing scope or an explicit terminate is still raised.
    pub async fn move_on_after<T, Fut>(&self, duration: Duration, fut: Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.timeout(duration, Mode::MoveOn, fut).await
    }

    /// Run `fut` for at most `duration`. On expiry the guarded work is
    /// abandoned and `Error::Terminated` naming this scope is raised.
    pub async fn cancel_after<T, Fut>(&self, duration: Duration, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _guard = ScopeGuard::enter(self, Mode::Cancel, self.now().checked_add(duration));
        self.task.check()?;
        fut.await
    }

    /// General form of [`move_on_after`](Self::move_on_after) and
    /// [`cancel_after`](Self::cancel_after).
    pub async fn timeout<T, Fut>(&self, duration: Duration, mode: Mode, fut: Fut) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        // An unrepresentable deadline means no deadline.
        let deadline = self.now().checked_add(duration);
        self.guarded(mode, deadline, fut).await
    }

    /// Open a scope without a deadline that the body (or anyone holding the
    /// handle) can fire with [`ScopeHandle::cancel`].
    ///
    /// In `MoveOn` mode a cancelled body yields `Ok(None)`; in `Cancel` mode
    /// the scope's `Error::Terminated` is raised.
    pub async fn cancel_scope<T, F, Fut>(&self, mode: Mode, body: F) -> Result<Option<T>>
    where
        F: FnOnce(ScopeHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = ScopeGuard::enter(self, mode, None);
        let handle = ScopeHandle {
            scope: guard.scope().clone(),
        };
        let outcome = match self.task.check() {
            Ok(()) => body(handle).await,
            Err(err) => Err(err),
        };
        settle(guard.scope(), outcome)
    }
}

/// Split a supervisor outcome into "own scope cancelled" and everything else.
pub(crate) fn is_own_cancellation(scope: &ScopeCore, err: &Error) -> bool {
    scope.owns(err) || scope.swallows(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;

    fn runtime() -> Runtime {
        init_test_logging();
        Runtime::new().unwrap()
    }

    // ── move_on_after ───────────────────────────────────────────────

    #[test]
    fn move_on_after_returns_none_on_expiry() {
        let start = Instant::now();
        let out = runtime()
            .block_on(|cx| async move {
                let sleeper = cx.clone();
                cx.move_on_after(Duration::from_millis(20), async move {
                    sleeper.sleep(Duration::from_secs(10)).await?;
                    Ok(1)
                })
                .await
            })
            .unwrap();
        assert_eq!(out, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn move_on_after_returns_value_in_time() {
        let out = runtime()
            .block_on(|cx| async move {
                let sleeper = cx.clone();
                cx.move_on_after(Duration::from_secs(5), async move {
                    sleeper.sleep(Duration::from_millis(5)).await?;
                    Ok("done")
                })
                .await
            })
            .unwrap();
        assert_eq!(out, Some("done"));
    }

    #[test]
    fn zero_duration_expires_at_first_suspension() {
        let out = runtime()
            .block_on(|cx| async move {
                let inner = cx.clone();
                cx.move_on_after(Duration::ZERO, async move {
                    inner.sleep(Duration::from_millis(50)).await?;
                    Ok(())
                })
                .await
            })
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn expired_scope_disarms_and_cleans_up() {
        let rt = runtime();
        let idle = rt
            .block_on(|cx| async move {
                let inner = cx.clone();
                let _ = cx
                    .move_on_after(Duration::from_secs(30), async move {
                        inner.sleep(Duration::from_millis(1)).await
                    })
                    .await?;
                // The 30s scope timer must be gone once the block exits.
                Ok(cx.sched.reactor.is_idle() && cx.deadline().is_none())
            })
            .unwrap();
        assert!(idle);
    }

    #[test]
    fn fired_scope_cleans_up_on_exit() {
        let (scope, child) = runtime()
            .block_on(|cx| async move {
                let inner = cx.clone();
                let (out, scope, child) = {
                    let captured: Rc<RefCell<Option<(Rc<ScopeCore>, crate::JoinHandle<()>)>>> =
                        Rc::default();
                    let slot = captured.clone();
                    let out = cx
                        .move_on_after(Duration::from_millis(10), async move {
                            let scope = inner.task.innermost_scope().unwrap();
                            let child = inner.spawn(|cx| async move { cx.sleep(Duration::from_secs(10)).await });
                            *slot.borrow_mut() = Some((scope, child.clone()));
                            child.join(&inner).await
                        })
                        .await?;
                    let (scope, child) = captured.borrow_mut().take().unwrap();
                    (out, scope, child)
                };
                assert_eq!(out, None);
                Ok((scope, child))
            })
            .unwrap();
        assert!(scope.is_fired());
        assert!(!scope.is_open());
        assert!(scope.tasks.borrow().is_empty());
        assert!(scope.timer.get().is_none());
        assert!(child.is_finished());
    }

    #[test]
    fn scope_abandoned_by_outer_cancel_disarms_its_timer() {
        let (err, scope, idle) = runtime()
            .block_on(|cx| async move {
                let captured: Rc<RefCell<Option<Rc<ScopeCore>>>> = Rc::default();
                let slot = captured.clone();
                let outer = cx.clone();
                let err = cx
                    .cancel_after(Duration::from_millis(10), async move {
                        let inner = outer.clone();
                        outer
                            .move_on_after(Duration::from_secs(30), async move {
                                *slot.borrow_mut() = inner.task.innermost_scope();
                                inner.sleep(Duration::from_secs(10)).await
                            })
                            .await
                    })
                    .await
                    .unwrap_err();
                let scope = captured.borrow_mut().take().unwrap();
                Ok((err, scope, cx.sched.reactor.is_idle()))
            })
            .unwrap();
        assert!(matches!(err, Error::Terminated { scope: Some(_) }));
        // The inner scope never fired itself, but its 30s timer is gone.
        assert!(!scope.is_fired());
        assert!(!scope.is_open());
        assert!(scope.timer.get().is_none());
        assert!(scope.tasks.borrow().is_empty());
        assert!(idle);
    }

    // ── cancel_after ────────────────────────────────────────────────

    #[test]
    fn cancel_after_raises_terminated() {
        let err = runtime()
            .block_on(|cx| async move {
                let inner = cx.clone();
                cx.cancel_after(Duration::from_millis(10), async move {
                    inner.sleep(Duration::from_secs(10)).await?;
                    Ok(())
                })
                .await
            })
            .unwrap_err();
        assert!(matches!(err, Error::Terminated { scope: Some(_) }));
    }

    #[test]
    fn cancel_after_passes_value_through() {
        let out = runtime()
            .block_on(|cx| async move { cx.cancel_after(Duration::from_secs(1), async { Ok(3) }).await })
            .unwrap();
        assert_eq!(out, 3);
    }

    // ── Nesting ─────────────────────────────────────────────────────

    #[test]
    fn outer_hard_cancel_wins_over_inner_soft_scope() {
        let start = Instant::now();
        let err = runtime()
            .block_on(|cx| async move {
                let outer = cx.clone();
                cx.cancel_after(Duration::from_millis(20), async move {
                    let inner = outer.clone();
                    let swallowed = outer
                        .move_on_after(Duration::from_secs(5), async move {
                            inner.sleep(Duration::from_secs(10)).await?;
                            Ok(())
                        })
                        .await?;
                    Ok(swallowed)
                })
                .await
            })
            .unwrap_err();
        assert!(matches!(err, Error::Terminated { scope: Some(_) }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn outer_soft_cancel_passes_through_inner_soft_scope() {
        let (outer_result, inner_reached_end) = runtime()
            .block_on(|cx| async move {
                let reached = Rc::new(Cell::new(false));
                let flag = reached.clone();
                let outer = cx.clone();
                let result = cx
                    .move_on_after(Duration::from_millis(20), async move {
                        let inner = outer.clone();
                        outer
                            .move_on_after(Duration::from_secs(5), async move {
                                inner.sleep(Duration::from_secs(10)).await
                            })
                            .await?;
                        // Not reached: the outer cancellation is not swallowed.
                        flag.set(true);
                        Ok(())
                    })
                    .await?;
                Ok((result, reached.get()))
            })
            .unwrap();
        assert_eq!(outer_result, None);
        assert!(!inner_reached_end);
    }

    #[test]
    fn inner_soft_scope_fires_first() {
        let out = runtime()
            .block_on(|cx| async move {
                let outer = cx.clone();
                cx.cancel_after(Duration::from_secs(5), async move {
                    let inner = outer.clone();
                    let first = outer
                        .move_on_after(Duration::from_millis(10), async move {
                            inner.sleep(Duration::from_secs(10)).await
                        })
                        .await?;
                    Ok((first, outer.is_cancelled()))
                })
                .await
            })
            .unwrap();
        assert_eq!(out, (None, false));
    }

    #[test]
    fn deadline_reports_nearest_enclosing_scope() {
        let (outer_only, nested) = runtime()
            .block_on(|cx| async move {
                let outer = cx.clone();
                cx.cancel_after(Duration::from_secs(10), async move {
                    let outer_only = outer.deadline();
                    let inner = outer.clone();
                    let nested = outer
                        .move_on_after(Duration::from_secs(1), async move { Ok(inner.deadline()) })
                        .await?
                        .flatten();
                    Ok((outer_only, nested))
                })
                .await
            })
            .unwrap();
        let (outer_only, nested) = (outer_only.unwrap(), nested.unwrap());
        assert!(nested < outer_only);
    }

    // ── Children ────────────────────────────────────────────────────

    #[test]
    fn scope_cancels_children_spawned_inside() {
        let start = Instant::now();
        let child_err = runtime()
            .block_on(|cx| async move {
                let slot: Rc<RefCell<Option<crate::JoinHandle<()>>>> = Rc::default();
                let inner_slot = slot.clone();
                let inner = cx.clone();
                cx.move_on_after(Duration::from_millis(20), async move {
                    let child = inner.spawn(|cx| async move { cx.sleep(Duration::from_secs(10)).await });
                    *inner_slot.borrow_mut() = Some(child.clone());
                    child.join(&inner).await
                })
                .await?;
                let child = slot.borrow().clone().unwrap();
                Ok(child.join(&cx).await.unwrap_err())
            })
            .unwrap();
        assert!(matches!(child_err, Error::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn scope_does_not_touch_tasks_outside_it() {
        let out = runtime()
            .block_on(|cx| async move {
                let bystander = cx.spawn(|cx| async move {
                    cx.sleep(Duration::from_millis(40)).await?;
                    Ok("alive")
                });
                let inner = cx.clone();
                cx.move_on_after(Duration::from_millis(10), async move {
                    inner.sleep(Duration::from_secs(10)).await
                })
                .await?;
                bystander.join(&cx).await
            })
            .unwrap();
        assert_eq!(out, "alive");
    }

    // ── Explicit cancel ─────────────────────────────────────────────

    #[test]
    fn explicit_cancel_scope() {
        let (soft, hard) = runtime()
            .block_on(|cx| async move {
                let inner = cx.clone();
                let soft = cx
                    .cancel_scope(Mode::MoveOn, |scope| async move {
                        let canceller = inner.spawn(move |cx| async move {
                            cx.sleep(Duration::from_millis(10)).await?;
                            scope.cancel();
                            Ok(())
                        });
                        inner.sleep(Duration::from_secs(10)).await?;
                        canceller.join(&inner).await
                    })
                    .await?;
                let hard = cx
                    .cancel_scope(Mode::Cancel, |scope| async move {
                        scope.cancel();
                        assert!(scope.is_cancelled());
                        Ok(())
                    })
                    .await;
                Ok((soft, hard))
            })
            .unwrap();
        assert_eq!(soft, None);
        // The body finished without another suspension point, so the value stands.
        assert_eq!(hard.unwrap(), Some(()));
    }
}

//! Tasks: the schedulable unit.
//!
//! A task is an `async-task` allocation driven by its scheduler plus a
//! [`TaskCore`] record holding everything the runtime needs to cancel it,
//! reap its children and deliver its outcome: lifecycle state, the pending
//! cancellation signal, the scope stack, join waiters and exit hooks.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::{poll_fn, Future};
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Poll, Waker};
use std::time::Instant;

use futures::FutureExt;
use tracing::debug;

use crate::context::Cx;
use crate::error::{Error, Result};
use crate::mailbox::Message;
use crate::scheduler::Scheduler;
use crate::scope::ScopeCore;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque task identity, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Why a suspended task is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    Timer,
    Io,
    Task(TaskId),
    Thread,
    Children,
    Yield,
    /// Waiting for a message in the task's mailbox.
    Mailbox,
    /// A future the runtime does not know about.
    Foreign,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Suspended(Suspension),
    /// Cancellation was requested and has not been observed yet.
    Cancelled,
    Terminated,
}

type ExitHook = Box<dyn FnOnce(Option<&Error>)>;

pub(crate) struct TaskCore {
    id: TaskId,
    state: Cell<TaskState>,
    /// Sticky: set once any cancellation was requested.
    cancelled: Cell<bool>,
    /// Someone will look at the outcome, so failures need not be reported.
    observed: Cell<bool>,
    waker: RefCell<Option<Waker>>,
    /// Pending signals in arrival order, one consumed per cancellation point.
    interrupts: RefCell<VecDeque<Error>>,
    mailbox: RefCell<VecDeque<Message>>,
    parent: Option<Weak<TaskCore>>,
    children: RefCell<Vec<Rc<TaskCore>>>,
    /// Enclosing cancellation scopes, outermost first.
    scopes: RefCell<Vec<Rc<ScopeCore>>>,
    join_waiters: RefCell<Vec<Waker>>,
    exit_hooks: RefCell<Vec<ExitHook>>,
}

impl TaskCore {
    /// Creates a task record. A child joins its parent's children and inherits
    /// the parent's current scope stack.
    pub(crate) fn new(parent: Option<&Rc<TaskCore>>) -> Rc<Self> {
        let core = Rc::new(Self {
            id: TaskId::next(),
            state: Cell::new(TaskState::Ready),
            cancelled: Cell::new(false),
            observed: Cell::new(false),
            waker: RefCell::new(None),
            interrupts: RefCell::new(VecDeque::new()),
            mailbox: RefCell::new(VecDeque::new()),
            parent: parent.map(Rc::downgrade),
            children: RefCell::new(Vec::new()),
            scopes: RefCell::new(Vec::new()),
            join_waiters: RefCell::new(Vec::new()),
            exit_hooks: RefCell::new(Vec::new()),
        });

        if let Some(parent) = parent {
            parent.children.borrow_mut().push(core.clone());
            let inherited: Vec<Rc<ScopeCore>> = parent
                .scopes
                .borrow()
                .iter()
                .filter(|s| s.is_open() || s.is_fired())
                .cloned()
                .collect();
            for scope in inherited {
                core.enter_scope(&scope);
            }
        }
        core
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        if self.state.get() != TaskState::Terminated {
            self.state.set(state);
        }
    }

    pub(crate) fn suspend(&self, reason: Suspension) {
        self.set_state(TaskState::Suspended(reason));
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.get() == TaskState::Terminated
    }

    pub(crate) fn observe(&self) {
        self.observed.set(true);
    }

    fn set_waker(&self, waker: Waker) {
        *self.waker.borrow_mut() = Some(waker);
    }

    /// Reschedule the task so it observes whatever changed.
    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.borrow().as_ref() {
            waker.wake_by_ref();
        }
    }

    /// Wake the task because a scope it belongs to fired.
    pub(crate) fn notify_cancelled(&self) {
        if self.is_terminated() {
            return;
        }
        self.set_state(TaskState::Cancelled);
        self.wake();
    }

    /// Request cancellation with `error`. Requests queue up behind any still
    /// pending; a second plain termination is folded into the first.
    pub(crate) fn interrupt(&self, error: Error) {
        if self.is_terminated() {
            return;
        }
        self.cancelled.set(true);
        {
            let mut pending = self.interrupts.borrow_mut();
            let duplicate = matches!(error, Error::Terminated { scope: None })
                && pending
                    .iter()
                    .any(|e| matches!(e, Error::Terminated { scope: None }));
            if !duplicate {
                pending.push_back(error);
            }
        }
        self.set_state(TaskState::Cancelled);
        self.wake();
    }

    /// Terminate children first (depth-first), then this task.
    pub(crate) fn terminate(&self) {
        if self.is_terminated() {
            return;
        }
        let children: Vec<Rc<TaskCore>> = self.children.borrow().clone();
        for child in children {
            child.terminate();
        }
        self.interrupt(Error::Terminated { scope: None });
    }

    /// Cancellation point: consumes the oldest pending signal, then reports
    /// the outermost fired scope on the task's scope stack.
    pub(crate) fn check(&self) -> Result<()> {
        if let Some(err) = self.interrupts.borrow_mut().pop_front() {
            return Err(err);
        }
        let scopes = self.scopes.borrow();
        match scopes.iter().find_map(|scope| scope.fired_error()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
            || !self.interrupts.borrow().is_empty()
            || self.scopes.borrow().iter().any(|s| s.is_fired())
    }

    /// Nearest deadline among the open scopes enclosing this task.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.scopes
            .borrow()
            .iter()
            .filter(|s| s.is_open())
            .filter_map(|s| s.deadline())
            .min()
    }

    pub(crate) fn enter_scope(self: &Rc<Self>, scope: &Rc<ScopeCore>) {
        self.scopes.borrow_mut().push(scope.clone());
        scope.register(self);
    }

    /// Like `enter_scope`, unless the task is already inside `scope`.
    pub(crate) fn adopt_scope(self: &Rc<Self>, scope: &Rc<ScopeCore>) {
        let present = self.scopes.borrow().iter().any(|s| s.id() == scope.id());
        if !present {
            self.enter_scope(scope);
        }
    }

    #[cfg(test)]
    pub(crate) fn innermost_scope(&self) -> Option<Rc<ScopeCore>> {
        self.scopes.borrow().last().cloned()
    }

    pub(crate) fn leave_scope(&self, scope: &ScopeCore) {
        self.scopes.borrow_mut().retain(|s| s.id() != scope.id());
        scope.deregister(self.id);
    }

    /// Queue `message` for the task. Returns `false` if it already terminated.
    pub(crate) fn post(&self, message: Message) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.mailbox.borrow_mut().push_back(message);
        if self.state() == TaskState::Suspended(Suspension::Mailbox) {
            self.wake();
        }
        true
    }

    pub(crate) fn next_message(&self) -> Option<Message> {
        self.mailbox.borrow_mut().pop_front()
    }

    pub(crate) fn add_exit_hook(&self, hook: ExitHook) {
        self.exit_hooks.borrow_mut().push(hook);
    }

    fn add_join_waiter(&self, waker: &Waker) {
        let mut waiters = self.join_waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    fn has_children(&self) -> bool {
        !self.children.borrow().is_empty()
    }

    fn terminate_children(&self) {
        let children: Vec<Rc<TaskCore>> = self.children.borrow().clone();
        debug!(task = %self.id, count = children.len(), "terminating children");
        for child in children {
            child.terminate();
        }
    }

    /// Mark the task terminated exactly once: run exit hooks, wake joiners,
    /// report unobserved failures, and detach from scopes, parent and registry.
    fn finish(&self, error: Option<&Error>, sched: &Scheduler) {
        if self.is_terminated() {
            return;
        }
        self.state.set(TaskState::Terminated);
        self.interrupts.borrow_mut().clear();
        self.mailbox.borrow_mut().clear();

        let hooks = self.exit_hooks.take();
        let waiters = self.join_waiters.take();
        let handled = self.observed.get() || !hooks.is_empty() || !waiters.is_empty();

        for hook in hooks {
            hook(error);
        }
        for waiter in waiters {
            waiter.wake();
        }
        if let Some(err) = error {
            if !handled && !err.is_cancellation() {
                sched.report_unhandled(self.id, err);
            }
        }

        for scope in self.scopes.take() {
            scope.deregister(self.id);
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.children.borrow_mut().retain(|c| c.id != self.id);
            if parent.state() == TaskState::Suspended(Suspension::Children) {
                parent.wake();
            }
        }
        sched.deregister(self.id);
        self.waker.take();

        debug!(
            task = %self.id,
            outcome = error.map(Error::as_label).unwrap_or("ok"),
            "task terminated"
        );
    }

    /// Drop every link that may keep a task allocation alive. Shutdown only.
    pub(crate) fn release(&self) {
        self.waker.take();
        self.children.take();
        self.scopes.take();
        self.join_waiters.take();
        self.exit_hooks.take();
        self.mailbox.take();
    }
}

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

/// Spawns `body` as a new task on `sched`, as a child of `parent` if given.
///
/// The task is enqueued; spawning never suspends the caller.
pub(crate) fn spawn<F, Fut, T>(
    sched: &Rc<Scheduler>,
    parent: Option<&Rc<TaskCore>>,
    body: F,
) -> JoinHandle<T>
where
    F: FnOnce(Cx) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let core = TaskCore::new(parent);
    let slot: Slot<T> = Rc::new(RefCell::new(None));
    let cx = Cx::new(core.clone(), sched.clone());
    let future = run(cx, body, slot.clone());

    let remote = sched.remote.clone();
    let (runnable, task) =
        async_task::spawn_local(future, move |runnable| remote.schedule(runnable));
    core.set_waker(runnable.waker());
    task.detach();
    sched.register(core.clone());

    debug!(task = %core.id, parent = ?parent.map(|p| p.id), "task spawned");
    runnable.schedule();

    JoinHandle { core, slot }
}

/// The future every task actually runs: body, then child reaping, then outcome.
async fn run<F, Fut, T>(cx: Cx, body: F, slot: Slot<T>)
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let core = cx.task.clone();

    let outcome = match core.check() {
        // Cancelled before it was ever resumed: the body never runs.
        Err(err) => Err(err),
        Ok(()) => {
            let mut body = Box::pin(AssertUnwindSafe(body(cx.clone())).catch_unwind());
            let caught = poll_fn(|ctx| {
                core.set_state(TaskState::Running);
                let poll = body.as_mut().poll(ctx);
                if poll.is_pending() && core.state() == TaskState::Running {
                    core.suspend(Suspension::Foreign);
                }
                poll
            })
            .await;
            match caught {
                Ok(result) => result,
                Err(payload) => Err(Error::Panicked {
                    task: core.id,
                    message: panic_message(payload.as_ref()),
                }),
            }
        }
    };

    if core.has_children() {
        core.terminate_children();
        poll_fn(|_| {
            if core.has_children() {
                core.suspend(Suspension::Children);
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await;
    }

    let error = outcome.as_ref().err().cloned();
    *slot.borrow_mut() = Some(outcome);
    core.finish(error.as_ref(), &cx.sched);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a spawned task.
///
/// Cloning the handle does not clone the task. Dropping every handle leaves
/// the task running under its parent.
pub struct JoinHandle<T> {
    core: Rc<TaskCore>,
    slot: Slot<T>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Request cancellation. A suspended task resumes with
    /// `Error::Terminated` at its next scheduling opportunity; a task that
    /// has not run yet terminates without running its body. Children are
    /// terminated first.
    pub fn terminate(&self) {
        self.core.terminate();
    }

    pub(crate) fn core(&self) -> &Rc<TaskCore> {
        &self.core
    }

    pub(crate) fn take_result(&self) -> Option<Result<T>> {
        self.slot.borrow_mut().take()
    }
}

impl<T: Clone> JoinHandle<T> {
    /// The stored outcome, if the task has terminated.
    pub fn result(&self) -> Option<Result<T>> {
        self.slot.borrow().clone()
    }

    /// Suspend the calling task until this task terminates, then return its
    /// outcome. Memoized: any number of joiners, any number of times, and the
    /// body never runs again.
    pub async fn join(&self, cx: &Cx) -> Result<T> {
        self.core.observe();
        poll_fn(|ctx| {
            if let Some(outcome) = self.slot.borrow().as_ref() {
                return Poll::Ready(outcome.clone());
            }
            if let Err(err) = cx.task.check() {
                return Poll::Ready(Err(err));
            }
            self.core.add_join_waiter(ctx.waker());
            cx.task.suspend(Suspension::Task(self.core.id));
            Poll::Pending
        })
        .await
    }
}

impl<T> Clone for JoinHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

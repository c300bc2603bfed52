//! The per-task context.

use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::task::{self, JoinHandle, TaskCore, TaskId};
use crate::timer::{Sleep, YieldNow};

/// Handle a task uses to reach its scheduler.
///
/// Every task body receives its own `Cx`. It is cheap to clone, bound to the
/// scheduler's thread (`!Send`), and is the only way to spawn, sleep, open
/// cancellation scopes or supervise children.
#[derive(Clone)]
pub struct Cx {
    pub(crate) task: Rc<TaskCore>,
    pub(crate) sched: Rc<Scheduler>,
}

impl Cx {
    pub(crate) fn new(task: Rc<TaskCore>, sched: Rc<Scheduler>) -> Self {
        Self { task, sched }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Whether cancellation was requested for this task, directly or through
    /// an enclosing scope.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// A cancellation point that does not suspend. Returns the pending
    /// cancellation, if any.
    pub fn check(&self) -> Result<()> {
        self.task.check()
    }

    /// Nearest deadline among the open scopes around this task.
    pub fn deadline(&self) -> Option<Instant> {
        self.task.deadline()
    }

    /// Spawn a child task. It is enqueued immediately and inherits the
    /// caller's cancellation scopes. When the caller terminates, the child is
    /// terminated and awaited first.
    pub fn spawn<F, Fut, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce(Cx) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        task::spawn(&self.sched, Some(&self.task), body)
    }

    /// Spawn a task with no structured parent. It is not reaped by the
    /// caller and ignores the caller's scopes; the runtime terminates it once
    /// the root task has finished.
    pub fn spawn_detached<F, Fut, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce(Cx) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        task::spawn(&self.sched, None, body)
    }

    /// Turn `f` into a function that runs each call in a new child task.
    ///
    /// ```no_run
    /// # use spindle_rt::{Cx, Result};
    /// # async fn demo(cx: Cx) -> Result<()> {
    /// let fetch = cx.spawner(|cx: Cx, n: u64| async move {
    ///     cx.sleep(std::time::Duration::from_millis(n)).await?;
    ///     Ok(n * 2)
    /// });
    /// let a = fetch(10);
    /// let b = fetch(20);
    /// assert_eq!(a.join(&cx).await? + b.join(&cx).await?, 60);
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawner<F, A, Fut, T>(&self, f: F) -> impl Fn(A) -> JoinHandle<T>
    where
        F: Fn(Cx, A) -> Fut + Clone + 'static,
        A: 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let cx = self.clone();
        move |arg| {
            let f = f.clone();
            cx.spawn(move |cx| f(cx, arg))
        }
    }

    /// Suspend for `duration`. Returns early with the pending cancellation.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), self.now().checked_add(duration))
    }

    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::new(self.clone(), Some(deadline))
    }

    /// Go to the back of the ready queue.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new(self.clone())
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("task", &self.task.id())
            .field("state", &self.task.state())
            .finish()
    }
}

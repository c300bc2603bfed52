use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;
use polling::Poller;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mailbox::Message;
use crate::reactor::Reactor;
use crate::task::{TaskCore, TaskId};

/// The thread-safe half of a scheduler.
///
/// Wakers, runtime threads and thread handles reach a scheduler only through
/// this: pushing runnables, raising signals into the root task, and
/// interrupting a blocked poll.
pub(crate) struct Remote {
    /// Ready queue: tasks whose wakers have fired.
    queue: ConcurrentQueue<Runnable>,
    /// Errors raised into the root task from other threads.
    inbox: ConcurrentQueue<Error>,
    /// Messages sent to the root task's mailbox from other threads.
    mail: ConcurrentQueue<Message>,
    poller: Arc<Poller>,
    /// Set while the scheduler is (about to be) blocked in the reactor.
    parked: AtomicBool,
    /// Live `ThreadHandle`s that may still raise into this scheduler.
    pub(crate) holders: AtomicUsize,
    /// Local tasks waiting on something only another thread can complete.
    pub(crate) waiting: AtomicUsize,
}

impl Remote {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            queue: ConcurrentQueue::unbounded(),
            inbox: ConcurrentQueue::unbounded(),
            mail: ConcurrentQueue::unbounded(),
            poller: Arc::new(Poller::new()?),
            parked: AtomicBool::new(false),
            holders: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Schedule function for async-task. `Fn(Runnable) + Send + Sync`, so it is
    /// safe to call from wakers on any thread.
    pub(crate) fn schedule(&self, runnable: Runnable) {
        let _ = self.queue.push(runnable);
        self.unpark();
    }

    /// Deliver `error` to the root task at the scheduler's next pass.
    pub(crate) fn raise(&self, error: Error) {
        let _ = self.inbox.push(error);
        self.unpark();
    }

    /// Post `message` to the root task's mailbox at the scheduler's next pass.
    pub(crate) fn post(&self, message: Message) {
        let _ = self.mail.push(message);
        self.unpark();
    }

    /// Interrupt a blocked reactor poll, if the scheduler is parked.
    pub(crate) fn unpark(&self) {
        if self.parked.load(Ordering::SeqCst) {
            let _ = self.poller.notify();
        }
    }

    fn has_work(&self) -> bool {
        !self.queue.is_empty() || !self.inbox.is_empty() || !self.mail.is_empty()
    }

    fn externally_held(&self) -> bool {
        self.holders.load(Ordering::SeqCst) > 0 || self.waiting.load(Ordering::SeqCst) > 0
    }
}

/// The per-thread scheduler: ready queue, task registry and reactor.
pub(crate) struct Scheduler {
    pub(crate) remote: Arc<Remote>,
    pub(crate) reactor: Reactor,
    /// Every non-terminated task owned by this scheduler.
    tasks: RefCell<HashMap<TaskId, Rc<TaskCore>>>,
    pub(crate) config: Config,
}

impl Scheduler {
    pub(crate) fn new(config: Config, remote: Arc<Remote>) -> Rc<Self> {
        let reactor = Reactor::new(remote.poller.clone(), config.event_capacity);
        Rc::new(Self {
            remote,
            reactor,
            tasks: RefCell::new(HashMap::new()),
            config,
        })
    }

    pub(crate) fn register(&self, task: Rc<TaskCore>) {
        self.tasks.borrow_mut().insert(task.id(), task);
    }

    pub(crate) fn deregister(&self, id: TaskId) {
        self.tasks.borrow_mut().remove(&id);
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub(crate) fn report_unhandled(&self, id: TaskId, err: &Error) {
        match &self.config.on_unhandled {
            Some(hook) => hook(id, err),
            None => error!(task = %id, error = %err, label = err.as_label(), "unhandled task error"),
        }
    }

    /// Resume every task that was ready when the pass began, in FIFO order.
    /// Tasks woken during the pass run in the next one.
    fn run_pass(&self) -> usize {
        let ready = self.remote.queue.len();
        let budget = match self.config.max_pass {
            0 => ready,
            max => ready.min(max),
        };
        let mut ran = 0;
        while ran < budget {
            match self.remote.queue.pop() {
                Ok(runnable) => {
                    runnable.run();
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    fn deliver_signals(&self, root: &TaskCore) {
        while let Ok(err) = self.remote.inbox.pop() {
            if root.is_terminated() {
                continue;
            }
            debug!(task = %root.id(), error = %err, "signal raised into root task");
            root.interrupt(err);
        }
        while let Ok(message) = self.remote.mail.pop() {
            trace!(task = %root.id(), message = message.type_name(), "message delivered to root task");
            root.post(message);
        }
    }

    /// Drive the loop until `root` has terminated and every task is gone.
    ///
    /// Detached tasks still alive after the root finished are terminated and
    /// drained. Returns `Error::Deadlock` when the root is unfinished and
    /// nothing can ever wake it.
    pub(crate) fn drive(&self, root: &TaskCore) -> Result<()> {
        let mut reaped = false;
        loop {
            self.deliver_signals(root);
            let ran = self.run_pass();

            if root.is_terminated() {
                if self.live_tasks() == 0 {
                    return Ok(());
                }
                if !reaped {
                    reaped = true;
                    let leftovers: Vec<Rc<TaskCore>> =
                        self.tasks.borrow().values().cloned().collect();
                    debug!(count = leftovers.len(), "terminating detached tasks");
                    for task in leftovers {
                        task.terminate();
                    }
                    continue;
                }
            }

            // Publish "parked" before the final emptiness check so a concurrent
            // push either sees the flag or is seen by the check.
            self.remote.parked.store(true, Ordering::SeqCst);
            let timeout = if self.remote.has_work() {
                Some(Duration::ZERO)
            } else if self.reactor.is_idle()
                && (root.is_terminated() || !self.remote.externally_held())
            {
                self.remote.parked.store(false, Ordering::SeqCst);
                let blocked = self.live_tasks();
                if root.is_terminated() {
                    warn!(blocked, "abandoning detached tasks that can never wake");
                    return Ok(());
                }
                warn!(blocked, "no task can make progress");
                return Err(Error::Deadlock { blocked });
            } else {
                None
            };

            let woke = self.reactor.react(timeout);
            self.remote.parked.store(false, Ordering::SeqCst);
            let woke = woke?;
            trace!(ran, woke, live = self.live_tasks(), "scheduler pass");
        }
    }

    /// Break task/waker cycles and drop every remaining task on this thread.
    pub(crate) fn shutdown(&self) {
        let cores: Vec<Rc<TaskCore>> = self.tasks.borrow_mut().drain().map(|(_, t)| t).collect();
        for core in &cores {
            core.release();
        }
        drop(cores);

        self.reactor.clear();

        // Dropping a runnable drops its future, which may wake (and enqueue) others.
        while let Ok(runnable) = self.remote.queue.pop() {
            drop(runnable);
        }
        while self.remote.inbox.pop().is_ok() {}
        while self.remote.mail.pop().is_ok() {}
    }
}

//! Runtimes on other OS threads.
//!
//! [`spawn`] starts an OS thread with its own scheduler and reactor and runs
//! a root task on it. The returned [`ThreadHandle`] lets tasks on any other
//! scheduler wait for that root task's result or raise an error into it.
//!
//! The result is published through a mutex-guarded completion record. Storing
//! the result and registering a waiter take the same lock, so a waiter is
//! either registered before the result lands (and woken) or sees it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use slab::Slab;
use tracing::debug;

use crate::config::Config;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::mailbox::Message;
use crate::runtime::Runtime;
use crate::scheduler::Remote;
use crate::task::Suspension;

static NEXT_THREAD: AtomicUsize = AtomicUsize::new(1);

struct CompletionState<T> {
    result: Option<Result<T>>,
    waiters: Slab<Waker>,
}

struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                result: None,
                waiters: Slab::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Store the result once and wake every waiter. Later calls are ignored.
    fn complete(&self, result: Result<T>) {
        let waiters: Vec<Waker> = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            state.waiters.drain().collect()
        };
        self.done.notify_all();
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

/// Records `ThreadPanicked` if the thread unwinds before completing.
struct FinishGuard<T>(Arc<Completion<T>>);

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        self.0.complete(Err(Error::ThreadPanicked));
    }
}

/// Handle to a root task running on another OS thread.
pub struct ThreadHandle<T> {
    name: Arc<str>,
    remote: Arc<Remote>,
    completion: Arc<Completion<T>>,
}

/// Start a runtime thread with the default configuration.
pub fn spawn<F, Fut, T>(body: F) -> Result<ThreadHandle<T>>
where
    F: FnOnce(Cx) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: Send + 'static,
{
    spawn_with(Config::default(), body)
}

/// Start a runtime thread running `body` as its root task.
///
/// The thread owns a fresh scheduler and reactor built from `config`. When
/// the root task terminates its children are reaped, the result is
/// published to every joiner, and the thread exits.
pub fn spawn_with<F, Fut, T>(config: Config, body: F) -> Result<ThreadHandle<T>>
where
    F: FnOnce(Cx) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: Send + 'static,
{
    let remote = Arc::new(Remote::new()?);
    let completion = Arc::new(Completion::new());
    let name = format!("{}-{}", config.thread_name, NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
    let handle = ThreadHandle::new(Arc::from(name.as_str()), remote.clone(), completion.clone());

    let _thread = std::thread::Builder::new().name(name.clone()).spawn(move || {
        let guard = FinishGuard(completion);
        let outcome = Runtime::from_remote(config, remote).block_on(body);
        debug!(thread = %name, ok = outcome.is_ok(), "runtime thread finished");
        guard.0.complete(outcome);
    })?;

    Ok(handle)
}

impl<T> ThreadHandle<T> {
    fn new(name: Arc<str>, remote: Arc<Remote>, completion: Arc<Completion<T>>) -> Self {
        remote.holders.fetch_add(1, Ordering::SeqCst);
        Self {
            name,
            remote,
            completion,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    /// Deliver `error` to the thread's root task. It is observed at the root
    /// task's next suspension point, once that thread's scheduler runs.
    /// Does nothing if the thread already finished.
    pub fn raise(&self, error: Error) {
        if self.is_finished() {
            return;
        }
        debug!(thread = %self.name, error = %error, "raising into runtime thread");
        self.remote.raise(error);
    }

    /// Terminate the thread's root task (and so its children).
    pub fn kill(&self) {
        self.raise(Error::Terminated { scope: None });
    }

    /// Post `value` to the root task's mailbox, where
    /// [`Cx::receive`] picks it up. Returns `false`, dropping the value, if
    /// the thread already finished.
    pub fn send<M: Any + Send>(&self, value: M) -> bool {
        if self.is_finished() {
            return false;
        }
        self.remote.post(Message::new(value));
        true
    }
}

impl<T: Clone + Send> ThreadHandle<T> {
    /// Suspend the calling task until the thread's root task terminates.
    /// Returns immediately with the stored result if it already has.
    pub async fn join(&self, cx: &Cx) -> Result<T> {
        ThreadJoin {
            cx,
            completion: &self.completion,
            key: None,
        }
        .await
    }

    /// [`join`](Self::join) bounded by `timeout`: `Ok(None)` on expiry.
    pub async fn join_timeout(&self, cx: &Cx, timeout: Duration) -> Result<Option<T>> {
        cx.move_on_after(timeout, self.join(cx)).await
    }

    /// Block the calling OS thread until the result is available. Not for use
    /// from inside a task.
    pub fn join_blocking(&self) -> Result<T> {
        let mut state = self.completion.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return result.clone();
            }
            self.completion.done.wait(&mut state);
        }
    }
}

impl<T> Clone for ThreadHandle<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone(), self.remote.clone(), self.completion.clone())
    }
}

impl<T> Drop for ThreadHandle<T> {
    fn drop(&mut self) {
        self.remote.holders.fetch_sub(1, Ordering::SeqCst);
        // The thread may be parked only because this handle could raise.
        self.remote.unpark();
    }
}

impl<T> fmt::Debug for ThreadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Registers the joining task's waker in the completion record.
struct ThreadJoin<'a, T> {
    cx: &'a Cx,
    completion: &'a Completion<T>,
    key: Option<usize>,
}

impl<T> ThreadJoin<'_, T> {
    /// Forget the waiter slot. The joining scheduler stops counting this
    /// task as waiting on another thread.
    fn release(&mut self, state: &mut CompletionState<T>) {
        if let Some(key) = self.key.take() {
            state.waiters.try_remove(key);
            self.cx.sched.remote.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T: Clone> Future for ThreadJoin<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = self.get_mut();
        let completion = this.completion;
        let mut state = completion.state.lock();

        if let Some(result) = state.result.clone() {
            this.release(&mut state);
            return Poll::Ready(result);
        }
        if let Err(err) = this.cx.task.check() {
            this.release(&mut state);
            return Poll::Ready(Err(err));
        }

        match this.key {
            Some(key) => {
                if let Some(waker) = state.waiters.get_mut(key) {
                    if !waker.will_wake(ctx.waker()) {
                        *waker = ctx.waker().clone();
                    }
                }
            }
            None => {
                this.key = Some(state.waiters.insert(ctx.waker().clone()));
                this.cx.sched.remote.waiting.fetch_add(1, Ordering::SeqCst);
            }
        }
        this.cx.task.suspend(Suspension::Thread);
        Poll::Pending
    }
}

impl<T> Drop for ThreadJoin<'_, T> {
    fn drop(&mut self) {
        if self.key.is_some() {
            let completion = self.completion;
            let mut state = completion.state.lock();
            self.release(&mut state);
        }
    }
}

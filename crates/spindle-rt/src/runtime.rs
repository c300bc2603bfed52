use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::scheduler::{Remote, Scheduler};
use crate::task;

/// One scheduler and its reactor, owned by the current OS thread.
///
/// A thread may own any number of runtimes, but tasks never move between
/// them. Use [`crate::thread::spawn`] to run a root task on a new thread.
pub struct Runtime {
    sched: Rc<Scheduler>,
    running: Cell<bool>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self::from_remote(config, Arc::new(Remote::new()?)))
    }

    /// Builds a runtime around a remote that other threads may already hold.
    pub(crate) fn from_remote(config: Config, remote: Arc<Remote>) -> Self {
        Self {
            sched: Scheduler::new(config, remote),
            running: Cell::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.sched.config
    }

    /// Run `body` as the root task and drive the loop until it terminates.
    ///
    /// Children of the root are terminated and awaited before this returns;
    /// detached tasks still alive at that point are terminated too. Returns
    /// `Error::Deadlock` if the root can never be woken again.
    pub fn block_on<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Cx) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        if self.running.replace(true) {
            return Err(Error::msg("runtime is already driving a root task"));
        }
        let root = task::spawn(&self.sched, None, body);
        root.core().observe();
        debug!(task = %root.id(), "root task started");

        let driven = self.sched.drive(root.core());
        self.running.set(false);
        driven?;

        root.take_result().unwrap_or(Err(Error::Deadlock {
            blocked: self.sched.live_tasks(),
        }))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.sched.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.sched.config)
            .field("live_tasks", &self.sched.live_tasks())
            .finish()
    }
}

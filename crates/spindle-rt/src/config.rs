//! # Runtime configuration.
//!
//! [`Config`] controls the reactor's event buffer, the per-pass resume budget,
//! the names of runtime threads, and how errors nobody waits for are reported.
//!
//! # Example
//! ```
//! use spindle_rt::Config;
//!
//! let mut cfg = Config::default();
//! cfg.max_pass = 64;
//! cfg.thread_name = "worker".into();
//!
//! assert_eq!(cfg.event_capacity, 1024);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::task::TaskId;

/// Hook invoked when a task terminates with an error and nothing waits for it.
pub type UnhandledHook = Arc<dyn Fn(TaskId, &Error) + Send + Sync>;

const ENV_EVENT_CAPACITY: &str = "SPINDLE_EVENT_CAPACITY";
const ENV_MAX_PASS: &str = "SPINDLE_MAX_PASS";

/// Configuration for one runtime (one scheduler and its reactor).
#[derive(Clone)]
pub struct Config {
    /// Initial capacity of the OS event buffer used by each reactor poll.
    pub event_capacity: usize,
    /// Maximum number of tasks resumed in a single pass (0 = every task that was
    /// ready when the pass began).
    pub max_pass: usize,
    /// Name prefix for threads started by [`crate::thread::spawn`].
    pub thread_name: String,
    /// Replaces the default `tracing::error!` report for unobserved failures.
    pub on_unhandled: Option<UnhandledHook>,
}

impl Config {
    /// Default configuration with `SPINDLE_EVENT_CAPACITY` and
    /// `SPINDLE_MAX_PASS` overrides applied from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(capacity) = lookup(ENV_EVENT_CAPACITY).and_then(|v| v.trim().parse().ok()) {
            cfg.event_capacity = capacity;
        }
        if let Some(max_pass) = lookup(ENV_MAX_PASS).and_then(|v| v.trim().parse().ok()) {
            cfg.max_pass = max_pass;
        }
        cfg
    }

    /// Installs a hook for errors that terminate a task nobody waits on.
    pub fn with_unhandled_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(TaskId, &Error) + Send + Sync + 'static,
    {
        self.on_unhandled = Some(Arc::new(hook));
        self
    }
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `event_capacity = 1024`
    /// - `max_pass = 0` (whole ready snapshot)
    /// - `thread_name = "spindle"`
    /// - `on_unhandled = None` (report through `tracing`)
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            max_pass: 0,
            thread_name: "spindle".to_string(),
            on_unhandled: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("event_capacity", &self.event_capacity)
            .field("max_pass", &self.max_pass)
            .field("thread_name", &self.thread_name)
            .field("on_unhandled", &self.on_unhandled.is_some())
            .finish()
    }
}

//! spindle-rt: a structured-concurrency runtime built on per-thread schedulers.
//!
//! Each OS thread that wants concurrency owns a [`Runtime`]: one cooperative
//! scheduler and one reactor (timers and descriptor readiness). Tasks are
//! `!Send` futures that run on the thread that spawned them and suspend only
//! at explicit points: timers, I/O readiness, joins and yields.
//!
//! Every task body receives a [`Cx`]. Through it a task spawns children,
//! sleeps, opens cancellation scopes (`move_on_after`, `cancel_after`),
//! supervises groups of children and throttles loops. Cancellation is
//! delivered as an [`Error`] from the next suspension point and travels up
//! the task's own stack through `?`.
//!
//! ```no_run
//! use std::time::Duration;
//! use spindle_rt::{Runtime, Result};
//!
//! fn main() -> Result<()> {
//!     let rt = Runtime::new()?;
//!     let value = rt.block_on(|cx| async move {
//!         let worker = cx.spawn(|cx| async move {
//!             cx.sleep(Duration::from_millis(10)).await?;
//!             Ok(21)
//!         });
//!         let slow = cx.clone();
//!         let gave_up = cx
//!             .move_on_after(Duration::from_millis(50), async move {
//!                 slow.sleep(Duration::from_secs(5)).await
//!             })
//!             .await?;
//!         assert!(gave_up.is_none());
//!         Ok(worker.join(&cx).await? * 2)
//!     })?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```
//!
//! Tasks also own a mailbox: [`JoinHandle::send`] posts a [`Message`] and
//! [`Cx::receive`] waits for the next one.
//!
//! Threads: [`thread::spawn`] starts a runtime on a new OS thread; its
//! [`ThreadHandle`] can be joined from a task on any other runtime, or used to
//! raise an error into the thread's root task.

mod config;
mod context;
mod error;
pub mod io;
mod mailbox;
mod reactor;
mod runtime;
mod scheduler;
mod scope;
mod supervisor;
mod task;
pub mod thread;
mod throttle;
mod timer;

#[cfg(test)]
mod test_utils;

pub use config::{Config, UnhandledHook};
pub use context::Cx;
pub use error::{Error, Result};
pub use io::Registration;
pub use mailbox::Message;
pub use runtime::Runtime;
pub use scope::{Mode, ScopeHandle, ScopeId};
pub use supervisor::Supervisor;
pub use task::{JoinHandle, Suspension, TaskId, TaskState};
pub use thread::ThreadHandle;
pub use throttle::Throttler;
pub use timer::{Pulser, Sleep, Timer, YieldNow, MIN_PERIOD};

//! spindle-iface: the application-facing API of the spindle runtime.
//!
//! Re-exports the runtime (tasks, scopes, supervision, throttling, threads)
//! and adds async wrappers for non-blocking descriptors. Applications depend
//! on this crate alone.
//!
//! # Quick Start
//!
//! ```no_run
//! use spindle_iface::{sys, Async, Runtime};
//!
//! let rt = Runtime::new()?;
//! let echoed = rt.block_on(|cx| async move {
//!     let (reader, writer) = sys::pipe()?;
//!     let mut writer = Async::new(&cx, writer)?;
//!     let mut reader = Async::new(&cx, reader)?;
//!     writer.write_all(b"ping").await?;
//!     let mut buf = [0u8; 4];
//!     let n = reader.read(&mut buf).await?;
//!     Ok(buf[..n].to_vec())
//! })?;
//! assert_eq!(echoed, b"ping");
//! # Ok::<(), spindle_iface::Error>(())
//! ```

pub mod async_io;
pub mod sys;

pub use async_io::{Async, IoAwaitable};
pub use spindle_rt::*;

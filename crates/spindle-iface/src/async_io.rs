//! Async wrapper for non-blocking descriptors.
//!
//! [`Async<T>`] puts any descriptor-backed IO object into non-blocking mode,
//! registers it with the current task's reactor and retries operations that
//! would block after waiting for readiness.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use spindle_rt::{Cx, Registration, Result};
use tracing::trace;

use crate::sys;

/// Readiness waits shared by every registered IO object.
#[allow(async_fn_in_trait)]
pub trait IoAwaitable {
    fn registration(&self) -> &Registration;

    /// Wait until the descriptor is readable. Cancellable.
    async fn readable(&self) -> Result<()> {
        self.registration().readable().await
    }

    /// Wait until the descriptor is writable. Cancellable.
    async fn writable(&self) -> Result<()> {
        self.registration().writable().await
    }
}

impl IoAwaitable for Registration {
    fn registration(&self) -> &Registration {
        self
    }
}

/// A non-blocking IO object registered with a task's reactor.
pub struct Async<T: AsRawFd> {
    // Declared first: the registration must be dropped before `io` closes the fd.
    reg: Registration,
    io: T,
}

impl<T: AsRawFd> Async<T> {
    /// Switch `io` to non-blocking mode and register it with `cx`'s reactor.
    pub fn new(cx: &Cx, io: T) -> Result<Self> {
        let fd = io.as_raw_fd();
        sys::set_nonblocking(fd)?;
        Ok(Self {
            reg: Registration::new(cx, fd),
            io,
        })
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn into_inner(self) -> T {
        let Self { reg, io } = self;
        drop(reg);
        io
    }

    /// Run `op` until it stops returning `WouldBlock`, waiting for
    /// readability in between.
    pub async fn read_with<R>(&self, mut op: impl FnMut(&T) -> io::Result<R>) -> Result<R> {
        loop {
            match op(&self.io) {
                Err(err) if retry(&err) => {
                    trace!(fd = self.as_raw_fd(), "read would block");
                    self.reg.readable().await?;
                }
                other => return Ok(other?),
            }
        }
    }

    /// Like [`read_with`](Self::read_with) with mutable access to the object.
    pub async fn read_with_mut<R>(&mut self, mut op: impl FnMut(&mut T) -> io::Result<R>) -> Result<R> {
        loop {
            match op(&mut self.io) {
                Err(err) if retry(&err) => self.reg.readable().await?,
                other => return Ok(other?),
            }
        }
    }

    /// Run `op` until it stops returning `WouldBlock`, waiting for
    /// writability in between.
    pub async fn write_with<R>(&self, mut op: impl FnMut(&T) -> io::Result<R>) -> Result<R> {
        loop {
            match op(&self.io) {
                Err(err) if retry(&err) => {
                    trace!(fd = self.as_raw_fd(), "write would block");
                    self.reg.writable().await?;
                }
                other => return Ok(other?),
            }
        }
    }

    pub async fn write_with_mut<R>(&mut self, mut op: impl FnMut(&mut T) -> io::Result<R>) -> Result<R> {
        loop {
            match op(&mut self.io) {
                Err(err) if retry(&err) => self.reg.writable().await?,
                other => return Ok(other?),
            }
        }
    }
}

impl<T: AsRawFd + Read> Async<T> {
    /// Read into `buf`. Returns the number of bytes read, 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_with_mut(|io| io.read(buf)).await
    }

    /// Append up to `max` bytes to `buf`. Returns the number of bytes
    /// appended, 0 at end of stream.
    pub async fn read_into(&mut self, buf: &mut Vec<u8>, max: usize) -> Result<usize> {
        let start = buf.len();
        buf.resize(start + max, 0);
        let read = self.read_with_mut(|io| io.read(&mut buf[start..])).await;
        let n = *read.as_ref().unwrap_or(&0);
        buf.truncate(start + n);
        read
    }

    /// Read until end of stream, appending to `buf`.
    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.read_into(buf, 4096).await? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }
}

impl<T: AsRawFd + Write> Async<T> {
    /// Write from `buf`. Returns the number of bytes written, which may be
    /// less than `buf.len()`.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_with_mut(|io| io.write(buf)).await
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

impl<T: AsRawFd> IoAwaitable for Async<T> {
    fn registration(&self) -> &Registration {
        &self.reg
    }
}

impl<T: AsRawFd> AsRawFd for Async<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

fn retry(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

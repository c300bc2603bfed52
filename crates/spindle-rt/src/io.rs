//! Descriptor readiness.
//!
//! Registers a raw fd with the task's reactor and provides cancellable
//! readability/writability waits.

use std::fmt;
use std::future::poll_fn;
use std::os::fd::RawFd;
use std::task::Poll;

use crate::context::Cx;
use crate::error::Result;
use crate::reactor::{Direction, WatchToken};
use crate::task::Suspension;

/// A file descriptor registered with the reactor of the task that created it.
///
/// `Registration` does NOT own the file descriptor, it only manages the
/// reactor registration. The fd must stay open until the registration is
/// dropped, and it should be in non-blocking mode.
pub struct Registration {
    cx: Cx,
    token: WatchToken,
    fd: RawFd,
}

impl Registration {
    pub fn new(cx: &Cx, fd: RawFd) -> Self {
        let token = cx.sched.reactor.watch(fd);
        Self {
            cx: cx.clone(),
            token,
            fd,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wait until the fd is readable.
    ///
    /// After this returns `Ok(())`, attempt the read. If it returns
    /// `WouldBlock`, call `readable()` again (spurious wake).
    pub async fn readable(&self) -> Result<()> {
        let _interest = Interest::new(self, Direction::Read);
        poll_fn(|ctx| {
            self.cx.task.check()?;
            match self.cx.sched.reactor.poll_readable(self.token, ctx.waker()) {
                Poll::Ready(ready) => Poll::Ready(ready.map_err(Into::into)),
                Poll::Pending => {
                    self.cx.task.suspend(Suspension::Io);
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Wait until the fd is writable.
    pub async fn writable(&self) -> Result<()> {
        let _interest = Interest::new(self, Direction::Write);
        poll_fn(|ctx| {
            self.cx.task.check()?;
            match self.cx.sched.reactor.poll_writable(self.token, ctx.waker()) {
                Poll::Ready(ready) => Poll::Ready(ready.map_err(Into::into)),
                Poll::Pending => {
                    self.cx.task.suspend(Suspension::Io);
                    Poll::Pending
                }
            }
        })
        .await
    }
}

/// Drops the stored waker when a readiness wait ends, including when the
/// wait is abandoned by cancellation.
struct Interest<'a> {
    reg: &'a Registration,
    dir: Direction,
}

impl<'a> Interest<'a> {
    fn new(reg: &'a Registration, dir: Direction) -> Self {
        Self { reg, dir }
    }
}

impl Drop for Interest<'_> {
    fn drop(&mut self) {
        self.reg.cx.sched.reactor.clear_interest(self.reg.token, self.dir);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cx.sched.reactor.unwatch(self.token);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("fd", &self.fd).finish()
    }
}

//! Per-task mailboxes.
//!
//! Every task owns a FIFO of [`Message`]s. Other tasks on the same scheduler
//! post with [`JoinHandle::send`]; other threads post into a runtime
//! thread's root task with [`ThreadHandle::send`](crate::ThreadHandle::send).
//! The owner takes them out with [`Cx::receive`], which suspends while the
//! mailbox is empty and is a cancellation point.

use std::any::{self, Any};
use std::fmt;
use std::future::poll_fn;
use std::task::Poll;

use tracing::trace;

use crate::context::Cx;
use crate::error::Result;
use crate::task::{JoinHandle, Suspension};

/// A type-erased value sent to a task's mailbox.
pub struct Message {
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl Message {
    pub fn new<M: Any + Send>(value: M) -> Self {
        Self {
            type_name: any::type_name::<M>(),
            value: Box::new(value),
        }
    }

    pub fn is<M: Any>(&self) -> bool {
        self.value.is::<M>()
    }

    /// Take the value out as `M`, or get the message back unchanged.
    pub fn downcast<M: Any>(self) -> Result<M, Message> {
        let Self { type_name, value } = self;
        match value.downcast::<M>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self { type_name, value }),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&self.type_name).finish()
    }
}

impl Cx {
    /// Take the oldest message from this task's mailbox, suspending until one
    /// arrives.
    pub async fn receive(&self) -> Result<Message> {
        poll_fn(|_| {
            self.task.check()?;
            match self.task.next_message() {
                Some(message) => Poll::Ready(Ok(message)),
                None => {
                    self.task.suspend(Suspension::Mailbox);
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Take a message without suspending.
    pub fn try_receive(&self) -> Option<Message> {
        self.task.next_message()
    }
}

impl<T> JoinHandle<T> {
    /// Post `value` to the task's mailbox. Returns `false`, dropping the
    /// value, if the task already terminated.
    pub fn send<M: Any + Send>(&self, value: M) -> bool {
        let message = Message::new(value);
        trace!(task = %self.id(), message = message.type_name, "message posted");
        self.core().post(message)
    }
}

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use slab::Slab;

/// Opaque handle for an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerToken(u64);

/// Opaque handle for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchToken(usize);

/// Readiness direction of an IO wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// What happens when a timer expires.
pub(crate) enum Alarm {
    /// Wake a suspended task.
    Wake(Waker),
    /// Run a one-shot callback on the scheduler thread.
    Call(Box<dyn FnOnce()>),
}

/// An IO source registered with the reactor.
struct Source {
    raw_fd: RawFd,
    key: usize,
    /// Whether we've called poller.add() for this source.
    registered: bool,
    /// Waker to fire when readable.
    read_waker: Option<Waker>,
    /// Waker to fire when writable.
    write_waker: Option<Waker>,
    /// Set by react() when OS reports readable; cleared by poll_readable.
    read_ready: bool,
    /// Set by react() when OS reports writable; cleared by poll_writable.
    write_ready: bool,
}

/// Timer state: BTreeMap for ordered expiry iteration, HashMap for handle→deadline lookup.
#[derive(Default)]
struct TimerState {
    /// Armed timers ordered by (deadline, id).
    heap: BTreeMap<(Instant, u64), Alarm>,
    /// Every live timer id → deadline, including timers not yet armed with an alarm.
    deadlines: HashMap<u64, Instant>,
}

/// The per-scheduler reactor: owns the OS event buffer, IO sources and timer heap.
///
/// Only the scheduler's own thread touches it. Other threads interrupt a
/// blocking `react` through the shared poller's `notify`.
pub(crate) struct Reactor {
    poller: Arc<Poller>,
    sources: RefCell<Slab<Source>>,
    timers: RefCell<TimerState>,
    timer_id: Cell<u64>,
    events: RefCell<Events>,
}

impl Reactor {
    pub(crate) fn new(poller: Arc<Poller>, event_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(event_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            poller,
            sources: RefCell::new(Slab::new()),
            timers: RefCell::new(TimerState::default()),
            timer_id: Cell::new(0),
            events: RefCell::new(Events::with_capacity(capacity)),
        }
    }

    // ── IO ──────────────────────────────────────────────────────────

    /// Register a file descriptor. The fd is NOT added to the OS poller yet;
    /// that happens on the first poll of interest.
    pub(crate) fn watch(&self, fd: RawFd) -> WatchToken {
        let mut sources = self.sources.borrow_mut();
        let entry = sources.vacant_entry();
        let key = entry.key();
        entry.insert(Source {
            raw_fd: fd,
            key,
            registered: false,
            read_waker: None,
            write_waker: None,
            read_ready: false,
            write_ready: false,
        });
        WatchToken(key)
    }

    /// Deregister an IO source. Removes it from the OS poller if registered.
    pub(crate) fn unwatch(&self, token: WatchToken) {
        let mut sources = self.sources.borrow_mut();
        if let Some(source) = sources.try_remove(token.0) {
            if source.registered {
                let borrowed = unsafe { BorrowedFd::borrow_raw(source.raw_fd) };
                // The owner may already have closed the fd.
                let _ = self.poller.delete(borrowed);
            }
        }
    }

    /// Poll for readability. Stores the waker and registers interest.
    pub(crate) fn poll_readable(&self, token: WatchToken, waker: &Waker) -> Poll<io::Result<()>> {
        let mut sources = self.sources.borrow_mut();
        let Some(source) = sources.get_mut(token.0) else {
            return Poll::Ready(Ok(()));
        };

        if source.read_ready {
            source.read_ready = false;
            return Poll::Ready(Ok(()));
        }

        source.read_waker = Some(waker.clone());
        match self.update_interest(source) {
            Ok(()) => Poll::Pending,
            Err(err) => {
                source.read_waker = None;
                Poll::Ready(Err(err))
            }
        }
    }

    /// Poll for writability. Stores the waker and registers interest.
    pub(crate) fn poll_writable(&self, token: WatchToken, waker: &Waker) -> Poll<io::Result<()>> {
        let mut sources = self.sources.borrow_mut();
        let Some(source) = sources.get_mut(token.0) else {
            return Poll::Ready(Ok(()));
        };

        if source.write_ready {
            source.write_ready = false;
            return Poll::Ready(Ok(()));
        }

        source.write_waker = Some(waker.clone());
        match self.update_interest(source) {
            Ok(()) => Poll::Pending,
            Err(err) => {
                source.write_waker = None;
                Poll::Ready(Err(err))
            }
        }
    }

    /// Forget the waiter for `dir`, e.g. because its wait was abandoned, and
    /// narrow the OS interest to match.
    pub(crate) fn clear_interest(&self, token: WatchToken, dir: Direction) {
        let stale = {
            let mut sources = self.sources.borrow_mut();
            let Some(source) = sources.get_mut(token.0) else {
                return;
            };
            let stale = match dir {
                Direction::Read => source.read_waker.take(),
                Direction::Write => source.write_waker.take(),
            };
            if stale.is_some() && source.registered {
                // Best effort: a stray readiness event is harmless.
                let _ = self.update_interest(source);
            }
            stale
        };
        drop(stale);
    }

    /// Sync OS poller interest with current waker state.
    fn update_interest(&self, source: &mut Source) -> io::Result<()> {
        let interest = Event::new(
            source.key,
            source.read_waker.is_some(),
            source.write_waker.is_some(),
        );

        if source.registered {
            let borrowed = unsafe { BorrowedFd::borrow_raw(source.raw_fd) };
            // modify() re-arms oneshot interest.
            self.poller.modify(borrowed, interest)
        } else {
            // add() is unsafe because the source must be deleted before the fd closes;
            // unwatch() does that and owners drop their registration first.
            unsafe { self.poller.add(source.raw_fd, interest)? };
            source.registered = true;
            Ok(())
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Create a timer for `deadline`. The waker is stored on first `timer_poll`.
    pub(crate) fn timer_create(&self, deadline: Instant) -> TimerToken {
        let id = self.next_timer_id();
        self.timers.borrow_mut().deadlines.insert(id, deadline);
        TimerToken(id)
    }

    /// Arm a timer that runs `callback` on this thread once `deadline` passes.
    pub(crate) fn arm_callback(&self, deadline: Instant, callback: Box<dyn FnOnce()>) -> TimerToken {
        let id = self.next_timer_id();
        let mut state = self.timers.borrow_mut();
        state.deadlines.insert(id, deadline);
        state.heap.insert((deadline, id), Alarm::Call(callback));
        TimerToken(id)
    }

    /// Cancel a pending timer. Its waker or callback is dropped, never fired.
    pub(crate) fn timer_cancel(&self, token: TimerToken) {
        let removed = {
            let mut state = self.timers.borrow_mut();
            state
                .deadlines
                .remove(&token.0)
                .and_then(|deadline| state.heap.remove(&(deadline, token.0)))
        };
        // Dropped outside the borrow: a callback may own things that touch the reactor.
        drop(removed);
    }

    /// Poll a timer. Returns Ready once the deadline passed or the timer is gone.
    pub(crate) fn timer_poll(&self, token: TimerToken, waker: &Waker) -> Poll<()> {
        let mut state = self.timers.borrow_mut();
        let deadline = match state.deadlines.get(&token.0) {
            Some(&d) => d,
            None => return Poll::Ready(()), // Already fired or cancelled.
        };

        if Instant::now() >= deadline {
            state.deadlines.remove(&token.0);
            state.heap.remove(&(deadline, token.0));
            return Poll::Ready(());
        }

        // Not yet expired, store or replace the waker.
        state
            .heap
            .insert((deadline, token.0), Alarm::Wake(waker.clone()));
        Poll::Pending
    }

    /// Earliest armed deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .borrow()
            .heap
            .keys()
            .next()
            .map(|&(deadline, _)| deadline)
    }

    /// No armed timer and no task waiting on descriptor readiness.
    pub(crate) fn is_idle(&self) -> bool {
        self.timers.borrow().heap.is_empty()
            && self
                .sources
                .borrow()
                .iter()
                .all(|(_, s)| s.read_waker.is_none() && s.write_waker.is_none())
    }

    fn next_timer_id(&self) -> u64 {
        let id = self.timer_id.get();
        self.timer_id.set(id.wrapping_add(1));
        id
    }

    fn expire(&self, now: Instant, fired: &mut Vec<Alarm>) {
        let mut state = self.timers.borrow_mut();
        while let Some(&(deadline, id)) = state.heap.keys().next() {
            if deadline > now {
                break;
            }
            if let Some(alarm) = state.heap.remove(&(deadline, id)) {
                fired.push(alarm);
            }
            state.deadlines.remove(&id);
        }
    }

    // ── React (drives IO + timers) ─────────────────────────────────

    /// Process expired timers, poll OS for IO events, wake ready tasks.
    ///
    /// Blocks for at most `min(timeout, next deadline)`; `None` waits until an
    /// event or a cross-thread notify arrives. Returns the number of wake-ups
    /// delivered.
    pub(crate) fn react(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut fired = Vec::new();

        // 1. Process expired timers.
        let now = Instant::now();
        self.expire(now, &mut fired);

        // 2. Compute effective timeout: min(caller, next_timer). Anything already
        //    fired must be delivered without blocking.
        let timeout = if fired.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let next_timer = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let effective_timeout = match (timeout, next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        // 3. Poll OS for IO events.
        let event_list: Vec<(usize, bool, bool)> = {
            let mut events = self.events.borrow_mut();
            events.clear();
            match self.poller.wait(&mut events, effective_timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
            events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable))
                .collect()
        };

        // 4. Process IO events, collecting wakers.
        let mut wakers = Vec::new();
        {
            let mut sources = self.sources.borrow_mut();
            for (key, readable, writable) in event_list {
                if let Some(source) = sources.get_mut(key) {
                    if readable {
                        source.read_ready = true;
                        if let Some(waker) = source.read_waker.take() {
                            wakers.push(waker);
                        }
                    }
                    if writable {
                        source.write_ready = true;
                        if let Some(waker) = source.write_waker.take() {
                            wakers.push(waker);
                        }
                    }
                }
            }
        }

        // 5. Timers that expired while we were blocked.
        self.expire(Instant::now(), &mut fired);

        // 6. Wake all; tasks re-enter the scheduler's ready queue.
        let delivered = wakers.len() + fired.len();
        for waker in wakers {
            waker.wake();
        }
        for alarm in fired {
            match alarm {
                Alarm::Wake(waker) => waker.wake(),
                Alarm::Call(callback) => callback(),
            }
        }

        Ok(delivered)
    }

    /// Drop every timer and stored waker. Used at runtime shutdown.
    pub(crate) fn clear(&self) {
        let heap = {
            let mut state = self.timers.borrow_mut();
            state.deadlines.clear();
            std::mem::take(&mut state.heap)
        };
        drop(heap);

        let wakers: Vec<Waker> = {
            let mut sources = self.sources.borrow_mut();
            sources
                .iter_mut()
                .flat_map(|(_, s)| [s.read_waker.take(), s.write_waker.take()])
                .flatten()
                .collect()
        };
        drop(wakers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::Wake;

    fn reactor() -> Reactor {
        Reactor::new(Arc::new(Poller::new().unwrap()), 64)
    }

    struct FlagWaker(AtomicBool);

    impl Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn flag_waker() -> (Arc<FlagWaker>, Waker) {
        let flag = Arc::new(FlagWaker(AtomicBool::new(false)));
        (flag.clone(), Waker::from(flag))
    }

    #[test]
    fn timer_create_and_poll_expired() {
        let reactor = reactor();
        let token = reactor.timer_create(Instant::now());

        std::thread::sleep(Duration::from_millis(1));

        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(token, &waker), Poll::Ready(()));
    }

    #[test]
    fn timer_create_and_poll_pending() {
        let reactor = reactor();
        let token = reactor.timer_create(Instant::now() + Duration::from_secs(1));

        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(token, &waker), Poll::Pending);
        assert!(!reactor.is_idle());

        reactor.timer_cancel(token);
        assert!(reactor.is_idle());
    }

    #[test]
    fn timer_cancel_removes_entry() {
        let reactor = reactor();
        let token = reactor.timer_create(Instant::now() + Duration::from_secs(1));
        let (_, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(token, &waker), Poll::Pending);

        reactor.timer_cancel(token);

        // Poll after cancel should return Ready (no entry found).
        assert_eq!(reactor.timer_poll(token, &waker), Poll::Ready(()));
    }

    #[test]
    fn react_fires_expired_timers() {
        let reactor = reactor();
        let token = reactor.timer_create(Instant::now() + Duration::from_millis(10));
        let (flag, waker) = flag_waker();
        assert_eq!(reactor.timer_poll(token, &waker), Poll::Pending);

        // The reactor blocks until the deadline on its own.
        let start = Instant::now();
        let delivered = reactor.react(None).unwrap();

        assert_eq!(delivered, 1);
        assert!(start.elapsed() >= Duration::from_millis(9));
        assert!(flag.0.load(Ordering::SeqCst), "timer waker should have fired");
    }

    #[test]
    fn callbacks_run_in_deadline_order() {
        let reactor = reactor();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Instant::now();
        for (i, ms) in [(1, 6u64), (0, 2), (2, 9)] {
            let order = order.clone();
            reactor.arm_callback(
                now + Duration::from_millis(ms),
                Box::new(move || order.lock().unwrap().push(i)),
            );
        }
        assert_eq!(reactor.next_deadline(), Some(now + Duration::from_millis(2)));

        std::thread::sleep(Duration::from_millis(12));
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_callback_never_runs() {
        let reactor = reactor();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let token = reactor.arm_callback(
            Instant::now(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        reactor.timer_cancel(token);
        reactor.react(Some(Duration::ZERO)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn readable_source_wakes_after_write() {
        let reactor = reactor();
        let (reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let token = reactor.watch(reader.as_raw_fd());

        let (flag, waker) = flag_waker();
        assert!(reactor.poll_readable(token, &waker).is_pending());
        assert!(!reactor.is_idle());

        writer.write_all(b"x").unwrap();
        reactor.react(Some(Duration::from_secs(1))).unwrap();
        assert!(flag.0.load(Ordering::SeqCst));

        // Readiness is latched until consumed by the next poll.
        assert!(matches!(reactor.poll_readable(token, &waker), Poll::Ready(Ok(()))));
        reactor.unwatch(token);
        assert!(reactor.is_idle());
    }

    #[test]
    fn cleared_interest_leaves_reactor_idle() {
        let reactor = reactor();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let token = reactor.watch(a.as_raw_fd());
        let (_flag, waker) = flag_waker();

        assert!(reactor.poll_readable(token, &waker).is_pending());
        assert!(!reactor.is_idle());
        reactor.clear_interest(token, Direction::Read);
        assert!(reactor.is_idle());
        // Clearing twice, or after unwatch, is a no-op.
        reactor.clear_interest(token, Direction::Read);
        reactor.unwatch(token);
        reactor.clear_interest(token, Direction::Write);
    }

    #[test]
    fn notify_interrupts_blocking_react() {
        let poller = Arc::new(Poller::new().unwrap());
        let reactor = Reactor::new(poller.clone(), 8);
        let remote = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poller.notify().unwrap();
        });
        let start = Instant::now();
        reactor.react(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        remote.join().unwrap();
    }
}

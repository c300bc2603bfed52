//! Timer-based suspension points and callback timers.
//!
//! [`Sleep`] and [`YieldNow`] are the futures behind `cx.sleep` and
//! `cx.yield_now`. [`Timer`] is a handle for callbacks run by the reactor
//! (`cx.after`, `cx.every`), and [`Pulser`] wakes a task on a fixed schedule.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::context::Cx;
use crate::error::Result;
use crate::reactor::TimerToken;
use crate::scheduler::Scheduler;
use crate::task::Suspension;

/// Shortest period accepted by [`Cx::every`] and [`Cx::pulse`].
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Future returned by [`Cx::sleep`] and [`Cx::sleep_until`].
///
/// Resolves to `Err` with the pending cancellation if the task is cancelled
/// while asleep. Cancels its reactor timer on drop.
pub struct Sleep {
    cx: Cx,
    deadline: Option<Instant>,
    token: Option<TimerToken>,
    done: bool,
}

impl Sleep {
    pub(crate) fn new(cx: Cx, deadline: Option<Instant>) -> Self {
        Self {
            cx,
            deadline,
            token: None,
            done: false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn disarm(&mut self) {
        if let Some(token) = self.token.take() {
            self.cx.sched.reactor.timer_cancel(token);
        }
    }
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if let Err(err) = this.cx.task.check() {
            this.disarm();
            return Poll::Ready(Err(err));
        }
        if this.done {
            return Poll::Ready(Ok(()));
        }

        let Some(deadline) = this.deadline else {
            // Unrepresentable deadline: only cancellation ends this sleep.
            this.cx.task.suspend(Suspension::Timer);
            return Poll::Pending;
        };

        if this.token.is_none() && deadline <= this.cx.now() {
            // Zero or past deadline: go to the back of the ready queue once.
            this.done = true;
            this.cx.task.suspend(Suspension::Yield);
            ctx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let reactor = &this.cx.sched.reactor;
        let token = *this.token.get_or_insert_with(|| reactor.timer_create(deadline));
        match reactor.timer_poll(token, ctx.waker()) {
            Poll::Ready(()) => {
                this.token = None;
                this.done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => {
                this.cx.task.suspend(Suspension::Timer);
                Poll::Pending
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("armed", &self.token.is_some())
            .finish()
    }
}

/// Future returned by [`Cx::yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    cx: Cx,
    yielded: bool,
}

impl YieldNow {
    pub(crate) fn new(cx: Cx) -> Self {
        Self { cx, yielded: false }
    }
}

impl Future for YieldNow {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<()>> {
        self.cx.task.check()?;
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        self.cx.task.suspend(Suspension::Yield);
        ctx.waker().wake_by_ref();
        Poll::Pending
    }
}

struct TimerState {
    sched: Weak<Scheduler>,
    token: Cell<Option<TimerToken>>,
    active: Cell<bool>,
    fires: Cell<u64>,
}

/// Handle to a callback timer created by [`Cx::after`] or [`Cx::every`].
///
/// Dropping the handle leaves the timer armed; call [`Timer::cancel`] to
/// disarm it.
#[derive(Clone)]
pub struct Timer {
    state: Rc<TimerState>,
}

impl Timer {
    fn new(sched: &Rc<Scheduler>) -> Self {
        Self {
            state: Rc::new(TimerState {
                sched: Rc::downgrade(sched),
                token: Cell::new(None),
                active: Cell::new(true),
                fires: Cell::new(0),
            }),
        }
    }

    /// Disarm the timer. A callback that has not run yet never runs.
    pub fn cancel(&self) {
        self.state.active.set(false);
        if let Some(token) = self.state.token.take() {
            if let Some(sched) = self.state.sched.upgrade() {
                sched.reactor.timer_cancel(token);
            }
        }
    }

    /// `false` once a one-shot timer fired or any timer was cancelled.
    pub fn is_active(&self) -> bool {
        self.state.active.get()
    }

    /// Number of times the callback ran.
    pub fn fire_count(&self) -> u64 {
        self.state.fires.get()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .field("fires", &self.fire_count())
            .finish()
    }
}

type Repeating = Rc<RefCell<Box<dyn FnMut()>>>;

fn arm_repeating(
    sched: &Rc<Scheduler>,
    state: Rc<TimerState>,
    deadline: Instant,
    period: Duration,
    callback: Repeating,
) {
    let weak = Rc::downgrade(sched);
    let fired = state.clone();
    let token = sched.reactor.arm_callback(
        deadline,
        Box::new(move || {
            fired.token.set(None);
            if !fired.active.get() {
                return;
            }
            fired.fires.set(fired.fires.get() + 1);
            (callback.borrow_mut())();
            // The callback may have cancelled its own timer.
            if !fired.active.get() {
                return;
            }
            if let Some(sched) = weak.upgrade() {
                let next = (deadline + period).max(Instant::now());
                arm_repeating(&sched, fired, next, period, callback);
            }
        }),
    );
    state.token.set(Some(token));
}

/// Periodic wake-up on a fixed schedule, created by [`Cx::pulse`].
///
/// Ticks fall on `start + n * period`. Periods missed while the task was busy
/// are skipped, never replayed in a burst.
pub struct Pulser {
    cx: Cx,
    period: Duration,
    next: Cell<Instant>,
}

impl Pulser {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Suspend until the next period boundary and return the wake-up time.
    /// If the boundary already passed, returns without suspending.
    pub async fn tick(&self) -> Result<Instant> {
        let due = self.next.get();
        if due > self.cx.now() {
            self.cx.sleep_until(due).await?;
        } else {
            self.cx.check()?;
        }
        let fired = self.cx.now();
        self.next.set(next_boundary(due, self.period, fired));
        Ok(fired)
    }
}

impl fmt::Debug for Pulser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pulser")
            .field("period", &self.period)
            .field("next", &self.next.get())
            .finish()
    }
}

/// First `due + k * period` (k >= 1) strictly after `now`.
fn next_boundary(due: Instant, period: Duration, now: Instant) -> Instant {
    let next = due + period;
    if next > now {
        return next;
    }
    let behind = now.duration_since(due).as_nanos() / period.as_nanos();
    u32::try_from(behind + 1)
        .ok()
        .and_then(|k| period.checked_mul(k))
        .and_then(|offset| due.checked_add(offset))
        .unwrap_or(now + period)
}

impl Cx {
    /// Run `callback` on this scheduler's thread once `delay` has elapsed.
    ///
    /// The callback runs from the reactor, outside any task, so it must not
    /// block. Spawn from it through a captured `Cx` to do async work.
    pub fn after<F>(&self, delay: Duration, callback: F) -> Timer
    where
        F: FnOnce() + 'static,
    {
        let timer = Timer::new(&self.sched);
        let state = timer.state.clone();
        let deadline = self.now() + delay;
        let token = self.sched.reactor.arm_callback(
            deadline,
            Box::new(move || {
                state.token.set(None);
                if state.active.replace(false) {
                    state.fires.set(state.fires.get() + 1);
                    callback();
                }
            }),
        );
        timer.state.token.set(Some(token));
        timer
    }

    /// Run `callback` every `period` until the returned timer is cancelled.
    /// Periods shorter than [`MIN_PERIOD`] are raised to it.
    pub fn every<F>(&self, period: Duration, callback: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let timer = Timer::new(&self.sched);
        let callback: Box<dyn FnMut()> = Box::new(callback);
        arm_repeating(
            &self.sched,
            timer.state.clone(),
            self.now() + period,
            period,
            Rc::new(RefCell::new(callback)),
        );
        timer
    }

    /// A [`Pulser`] whose first tick is one `period` from now.
    pub fn pulse(&self, period: Duration) -> Pulser {
        let period = period.max(MIN_PERIOD);
        Pulser {
            cx: self.clone(),
            period,
            next: Cell::new(self.now() + period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;

    fn runtime() -> Runtime {
        init_test_logging();
        Runtime::new().unwrap()
    }

    // ── Sleep ───────────────────────────────────────────────────────

    #[test]
    fn cancelled_sleep_releases_its_timer() {
        let idle = runtime()
            .block_on(|cx| async move {
                let sleeper = cx.spawn(|cx| async move { cx.sleep(Duration::from_secs(30)).await });
                cx.yield_now().await?;
                sleeper.terminate();
                let err = sleeper.join(&cx).await.unwrap_err();
                assert!(matches!(err, Error::Terminated { .. }));
                Ok(cx.sched.reactor.is_idle())
            })
            .unwrap();
        assert!(idle);
    }

    #[test]
    fn sleep_until_past_instant_returns_promptly() {
        let start = Instant::now();
        runtime()
            .block_on(|cx| async move {
                let earlier = cx.now() - Duration::from_millis(5);
                cx.sleep_until(earlier).await
            })
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    // ── Callback timers ─────────────────────────────────────────────

    #[test]
    fn after_fires_once() {
        let (fires, elapsed) = runtime()
            .block_on(|cx| async move {
                let start = cx.now();
                let hits = Rc::new(Cell::new(0));
                let counter = hits.clone();
                let timer = cx.after(Duration::from_millis(20), move || counter.set(counter.get() + 1));
                assert!(timer.is_active());
                cx.sleep(Duration::from_millis(60)).await?;
                assert!(!timer.is_active());
                assert_eq!(timer.fire_count(), 1);
                Ok((hits.get(), start.elapsed()))
            })
            .unwrap();
        assert_eq!(fires, 1);
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn cancelled_after_never_fires() {
        let fires = runtime()
            .block_on(|cx| async move {
                let hits = Rc::new(Cell::new(0));
                let counter = hits.clone();
                let timer = cx.after(Duration::from_millis(10), move || counter.set(counter.get() + 1));
                timer.cancel();
                cx.sleep(Duration::from_millis(40)).await?;
                Ok(hits.get())
            })
            .unwrap();
        assert_eq!(fires, 0);
    }

    #[test]
    fn every_repeats_until_cancelled() {
        let fires = runtime()
            .block_on(|cx| async move {
                let hits = Rc::new(Cell::new(0u32));
                let counter = hits.clone();
                let timer = cx.every(Duration::from_millis(10), move || counter.set(counter.get() + 1));
                cx.sleep(Duration::from_millis(75)).await?;
                timer.cancel();
                let at_cancel = hits.get();
                cx.sleep(Duration::from_millis(40)).await?;
                assert_eq!(hits.get(), at_cancel);
                Ok(at_cancel)
            })
            .unwrap();
        assert!((3..=8).contains(&fires), "fired {fires} times");
    }

    #[test]
    fn callback_can_spawn_tasks() {
        let out = runtime()
            .block_on(|cx| async move {
                let slot: Rc<RefCell<Option<crate::JoinHandle<u32>>>> = Rc::default();
                let inner_slot = slot.clone();
                let spawner = cx.clone();
                cx.after(Duration::from_millis(5), move || {
                    let handle = spawner.spawn(|_| async { Ok(42) });
                    *inner_slot.borrow_mut() = Some(handle);
                });
                cx.sleep(Duration::from_millis(30)).await?;
                let handle = slot.borrow().clone();
                match handle {
                    Some(handle) => handle.join(&cx).await,
                    None => Ok(0),
                }
            })
            .unwrap();
        assert_eq!(out, 42);
    }

    // ── Pulser ──────────────────────────────────────────────────────

    #[test]
    fn pulse_ticks_on_schedule() {
        let (ticks, elapsed) = runtime()
            .block_on(|cx| async move {
                let start = cx.now();
                let pulser = cx.pulse(Duration::from_millis(20));
                let mut ticks = Vec::new();
                for _ in 0..3 {
                    ticks.push(pulser.tick().await?);
                }
                Ok((ticks, start.elapsed()))
            })
            .unwrap();
        assert!(ticks.windows(2).all(|w| w[1] > w[0]));
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn missed_periods_are_skipped() {
        let base = Instant::now();
        let period = Duration::from_millis(10);
        let next = next_boundary(base, period, base + Duration::from_millis(35));
        assert_eq!(next, base + Duration::from_millis(40));
        assert_eq!(next_boundary(base, period, base), base + period);
    }
}

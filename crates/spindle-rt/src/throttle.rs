//! Rate limiting for loops.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::context::Cx;
use crate::error::{Error, Result};

/// Interval between permitted executions for `rate` executions per second.
fn interval_for(rate: f64) -> Result<Duration> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::InvalidRate(rate));
    }
    Duration::try_from_secs_f64(1.0 / rate).map_err(|_| Error::InvalidRate(rate))
}

/// A reusable gate that lets the calling task through at most `rate` times
/// per second.
///
/// Each wait is measured from the previous actual pass through the gate, so
/// a late wake-up is neither compounded nor made up for with a burst.
pub struct Throttler {
    cx: Cx,
    interval: Duration,
    last: Cell<Option<Instant>>,
}

impl Throttler {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Suspend for whatever is left of the interval since the previous pass,
    /// then record this pass. The first call passes immediately.
    pub async fn tick(&self) -> Result<Instant> {
        let due = self.last.get().map(|last| last + self.interval);
        match due {
            Some(due) if due > self.cx.now() => self.cx.sleep_until(due).await?,
            _ => self.cx.check()?,
        }
        let now = self.cx.now();
        self.last.set(Some(now));
        Ok(now)
    }

    /// Pass the gate, then run `fut`.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.tick().await?;
        fut.await
    }
}

impl fmt::Debug for Throttler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("interval", &self.interval)
            .field("last", &self.last.get())
            .finish()
    }
}

impl Cx {
    /// A [`Throttler`] for `rate` executions per second. The rate must be
    /// finite and positive.
    pub fn throttle(&self, rate: f64) -> Result<Throttler> {
        Ok(Throttler {
            cx: self.clone(),
            interval: interval_for(rate)?,
            last: Cell::new(None),
        })
    }

    /// Run `body` at most `rate` times per second.
    ///
    /// Stops after `count` iterations if given, when `body` returns
    /// `ControlFlow::Break`, or when the task is cancelled (the cancellation
    /// is returned). Returns the number of iterations run.
    pub async fn throttled_loop<F, Fut>(&self, rate: f64, count: Option<usize>, mut body: F) -> Result<usize>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        let throttler = self.throttle(rate)?;
        let mut iterations = 0;
        while count.map_or(true, |limit| iterations < limit) {
            throttler.tick().await?;
            iterations += 1;
            trace!(task = %self.task_id(), iterations, "throttled iteration");
            if body().await?.is_break() {
                break;
            }
        }
        Ok(iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::test_utils::init_test_logging;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn runtime() -> Runtime {
        init_test_logging();
        Runtime::new().unwrap()
    }

    #[test]
    fn rejects_invalid_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(interval_for(rate), Err(Error::InvalidRate(_))));
        }
        assert_eq!(interval_for(4.0).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn loop_with_count_paces_iterations() {
        let start = Instant::now();
        let stamps = runtime()
            .block_on(|cx| async move {
                let stamps: Rc<RefCell<Vec<Instant>>> = Rc::default();
                let log = stamps.clone();
                let n = cx
                    .throttled_loop(10.0, Some(3), || {
                        log.borrow_mut().push(Instant::now());
                        async { Ok(ControlFlow::Continue(())) }
                    })
                    .await?;
                assert_eq!(n, 3);
                let stamps = stamps.borrow().clone();
                Ok(stamps)
            })
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
    }

    #[test]
    fn break_stops_the_loop() {
        let n = runtime()
            .block_on(|cx| async move {
                let mut seen = 0;
                cx.throttled_loop(1000.0, None, || {
                    seen += 1;
                    let stop = seen == 4;
                    async move {
                        Ok(if stop {
                            ControlFlow::Break(())
                        } else {
                            ControlFlow::Continue(())
                        })
                    }
                })
                .await
            })
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn unbounded_loop_runs_until_cancelled() {
        let (result, runs) = runtime()
            .block_on(|cx| async move {
                let runs = Rc::new(Cell::new(0));
                let counter = runs.clone();
                let inner = cx.clone();
                let result = cx
                    .move_on_after(Duration::from_millis(55), async move {
                        inner
                            .throttled_loop(50.0, None, || {
                                counter.set(counter.get() + 1);
                                async { Ok(ControlFlow::Continue(())) }
                            })
                            .await
                    })
                    .await?;
                Ok((result, runs.get()))
            })
            .unwrap();
        assert_eq!(result, None);
        assert!((2..=4).contains(&runs), "ran {runs} times");
    }

    #[test]
    fn gate_measures_from_previous_pass() {
        let gaps = runtime()
            .block_on(|cx| async move {
                let gate = cx.throttle(20.0)?;
                let first = gate.tick().await?;
                // A slow iteration uses up the whole interval.
                cx.sleep(Duration::from_millis(80)).await?;
                let second = gate.tick().await?;
                let third = gate.tick().await?;
                Ok((second - first, third - second))
            })
            .unwrap();
        assert!(gaps.0 >= Duration::from_millis(80));
        assert!(gaps.0 < Duration::from_millis(120));
        assert!(gaps.1 >= Duration::from_millis(50));
    }

    #[test]
    fn call_runs_after_the_gate() {
        let out = runtime()
            .block_on(|cx| async move {
                let gate = cx.throttle(100.0)?;
                let a = gate.call(async { Ok(1) }).await?;
                let b = gate.call(async { Ok(2) }).await?;
                Ok(a + b)
            })
            .unwrap();
        assert_eq!(out, 3);
    }
}

//! Periodic work under a deadline.
//!
//! A supervised group of workers ticks at different rates until an outer
//! `move_on_after` gives up on all of them. Run with
//! `RUST_LOG=spindle_rt=debug cargo run --example pulse`.

use std::ops::ControlFlow;
use std::time::Duration;

use spindle_iface::{Cx, Result, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn heartbeat(cx: Cx, name: &'static str, period: Duration) -> Result<()> {
    let pulser = cx.pulse(period);
    loop {
        let at = pulser.tick().await?;
        info!(worker = name, ?at, "tick");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = Runtime::new()?;
    rt.block_on(|cx| async move {
        let group = cx.clone();
        let finished: Option<()> = cx
            .move_on_after(Duration::from_millis(700), async move {
                group
                    .supervise(|sup| async move {
                        sup.spawn(|cx| heartbeat(cx, "fast", Duration::from_millis(100)));
                        sup.spawn(|cx| heartbeat(cx, "slow", Duration::from_millis(250)));
                        Ok(())
                    })
                    .await
            })
            .await?;
        info!(finished = finished.is_some(), "heartbeats stopped");

        let polls = cx
            .throttled_loop(5.0, Some(5), || async {
                info!("throttled poll");
                Ok(ControlFlow::Continue(()))
            })
            .await?;
        info!(polls, "done");
        Ok(())
    })
}

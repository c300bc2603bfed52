//! Lines travel through a pipe to a worker thread and back.
//!
//! The main runtime writes to one pipe; a runtime thread reads it, upper-cases
//! each chunk and writes it to a second pipe, which the main runtime reads
//! until end of stream.

use std::time::Duration;

use spindle_iface::{sys, thread, Async, Result, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (to_worker, worker_in) = {
        let (reader, writer) = sys::pipe()?;
        (writer, reader)
    };
    let (worker_out, from_worker) = {
        let (reader, writer) = sys::pipe()?;
        (writer, reader)
    };

    let worker = thread::spawn(move |cx| async move {
        let mut input = Async::new(&cx, worker_in)?;
        let mut output = Async::new(&cx, worker_out)?;
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            buf[..n].make_ascii_uppercase();
            output.write_all(&buf[..n]).await?;
            total += n;
        }
    })?;

    let rt = Runtime::new()?;
    let echoed = rt.block_on(move |cx| async move {
        let writer = cx.spawn(move |cx| async move {
            let mut out = Async::new(&cx, to_worker)?;
            let gate = cx.throttle(20.0)?;
            for line in ["hello\n", "from\n", "spindle\n"] {
                gate.tick().await?;
                out.write_all(line.as_bytes()).await?;
            }
            Ok(())
        });

        let mut input = Async::new(&cx, from_worker)?;
        let mut echoed = Vec::new();
        let reader = cx.clone();
        reader
            .cancel_after(Duration::from_secs(5), async {
                input.read_to_end(&mut echoed).await
            })
            .await?;
        writer.join(&cx).await?;
        Ok(String::from_utf8_lossy(&echoed).into_owned())
    })?;

    let bytes = worker.join_blocking()?;
    info!(bytes, "worker finished");
    print!("{echoed}");
    Ok(())
}

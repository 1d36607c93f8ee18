//! Rate-limited publisher driving the `exchange_server` example.
//!
//! Connects to `tcp://127.0.0.1:8000`, announces `start` on `/`, then
//! unicasts payloads to `/queue` through a once-a-second token bucket.
//! After five seconds it announces `stop` and disconnects.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbar::{
    ClientCore, ClientEvents, EventLoop, LoopCtx, LoopHandle, RemoteClient, StreamConfig,
};
use tracing::info;

/// Messages per bucket refill.
const BUCKET_RATE: usize = 100;
/// Payload size of one `/queue` message.
const PAYLOAD_LEN: usize = 100_000;
const RUN_FOR: Duration = Duration::from_secs(5);

struct Reporter;

impl ClientEvents for Reporter {
    fn on_connected(&mut self, client: &mut ClientCore, ctx: &LoopCtx<'_>) {
        info!("connected to the exchange");
        client.subscribe(&crossbar::Qid::literal("/"), ctx).unwrap();
        client.send("/", "start", true, ctx).unwrap();
    }

    fn on_message(
        &mut self,
        client: &mut ClientCore,
        ctx: &LoopCtx<'_>,
        qid: &Bytes,
        message: &Bytes,
    ) {
        if qid.as_ref() == b"/" && message.as_ref() == b"stop" {
            info!("run finished, disconnecting");
            client.close(ctx);
        }
    }

    fn on_disconnected(&mut self, ctx: &LoopCtx<'_>) {
        info!("disconnected");
        ctx.shutdown();
    }
}

/// Refill the token bucket and queue a burst of unicasts, then re-arm for
/// the next second.
fn arm_refill(client: Rc<RefCell<RemoteClient>>, handle: LoopHandle, payload: Bytes) {
    handle.add_timeout(Instant::now() + Duration::from_secs(1), move |ctx| {
        {
            let mut client = client.borrow_mut();
            let core = client.core();
            if !core.is_connected() {
                return;
            }
            for _ in 0..BUCKET_RATE {
                if core.send("/queue", payload.clone(), false, ctx).is_err() {
                    return;
                }
            }
        }
        arm_refill(client, ctx.handle(), payload);
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut event_loop = EventLoop::new()?;
    let client = RemoteClient::connect_tcp(
        "127.0.0.1:8000".parse()?,
        Box::new(Reporter),
        StreamConfig::default(),
        &event_loop.ctx(),
    )?;

    let payload = Bytes::from(vec![b'x'; PAYLOAD_LEN]);
    arm_refill(client.clone(), event_loop.handle(), payload);

    // End the run after five seconds, whatever state the bucket is in.
    let stopper = client.clone();
    event_loop.handle().add_timeout(Instant::now() + RUN_FOR, move |ctx| {
        let mut client = stopper.borrow_mut();
        let core = client.core();
        if core.is_connected() {
            let _ = core.send("/", "stop", true, ctx);
        }
    });

    event_loop.run()?;
    Ok(())
}

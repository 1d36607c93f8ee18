//! Serve an exchange over TCP with two in-process observers.
//!
//! Pair with the `throughput_client` example:
//!
//! ```text
//! cargo run --example exchange_server
//! cargo run --example throughput_client
//! ```
//!
//! The observers subscribe to `/` for control messages and `/queue` for
//! the measured traffic; between a `start` and a `stop` on `/` they count
//! messages and bytes and report the rate.

use std::time::Instant;

use bytes::Bytes;
use crossbar::{
    Endpoint, Exchange, EventLoop, Listener, LocalClient, LocalEvents, Qid, StreamConfig,
};
use tracing::info;

struct Meter {
    name: &'static str,
    started: Option<Instant>,
    count: u64,
    bytes: u64,
}

impl Meter {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            started: None,
            count: 0,
            bytes: 0,
        }
    }
}

impl LocalEvents for Meter {
    fn on_connected(&mut self, client: &LocalClient) {
        info!(name = self.name, "observer connected");
        client.subscribe(Qid::literal("/")).unwrap();
        client.subscribe(Qid::literal("/queue")).unwrap();
    }

    fn on_disconnected(&mut self, _client: &LocalClient) {
        info!(name = self.name, "observer disconnected");
    }

    fn on_message(&mut self, _client: &LocalClient, qid: &Bytes, message: &Bytes) {
        match qid.as_ref() {
            b"/" if message.as_ref() == b"start" => {
                info!(name = self.name, "ticking");
                self.started = Some(Instant::now());
                self.count = 0;
                self.bytes = 0;
            }
            b"/" if message.as_ref() == b"stop" => {
                if let Some(started) = self.started.take() {
                    let secs = started.elapsed().as_secs_f64();
                    info!(
                        name = self.name,
                        kmsg_per_s = self.count as f64 / secs / 1e3,
                        mib_per_s = self.bytes as f64 / secs / 1024.0 / 1024.0,
                        "throughput"
                    );
                }
            }
            b"/queue" => {
                if self.started.is_some() {
                    self.count += 1;
                    self.bytes += message.len() as u64;
                }
            }
            _ => {}
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut event_loop = EventLoop::new()?;
    let exchange = Exchange::new();

    let a1 = LocalClient::new(Box::new(Meter::new("a1")));
    a1.connect(&exchange)?;
    let a2 = LocalClient::new(Box::new(Meter::new("a2")));
    a2.connect(&exchange)?;

    let endpoint = Endpoint::parse("tcp://127.0.0.1:8000")?;
    let _listener = Listener::bind(
        &exchange,
        &endpoint,
        StreamConfig::default(),
        &event_loop.ctx(),
    )?;
    info!(%endpoint, subscriptions = exchange.subscription_count(), "serving");

    event_loop.run()?;
    Ok(())
}

#![deny(clippy::as_conversions)]
use opts::Opts;
use std::io;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();
    let params = opts.to_params()?;

    let node = fleetd::Node::new(params)?;

    let node_ctrl = node.get_ctrl();
    node_ctrl.install_signal_handler()?;
    info!(local_addr = %node_ctrl.local_addr(), leader = node.is_leader(), "Node started");

    node.wait();

    if node_ctrl.has_failed() {
        anyhow::bail!("node could not find a leader to follow");
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}

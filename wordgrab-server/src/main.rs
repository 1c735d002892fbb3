//! The wordgrab server binary.
//!
//! One OS thread runs everything: the accept loop, every connection task
//! and the periodic sweep all live on a `LocalSet` over a current-thread
//! runtime, so conversations are only ever touched from one thread and
//! event ordering is simply arrival order.

use anyhow::Context;
use clap::Parser;
use registry::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::LocalSet;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod connection;
mod registry;
mod ws;

/// How long closing connections get to flush after a shutdown signal.
const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "wordgrab-server", about = "Realtime word-tile game server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:5144")]
    listen: SocketAddr,

    /// Append the log to this file instead of stderr.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.log.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    LocalSet::new().block_on(&runtime, serve(args))
}

fn init_logging(log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(address = %args.listen, "listening");

    let registry = Rc::new(Registry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Every connection holds a clone; the count tells the shutdown path
    // when everyone has flushed and gone.
    let live_connections = Rc::new(());

    {
        let registry = registry.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::task::spawn_local(async move {
            let mut tick = tokio::time::interval(registry::TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => registry.sweep(std::time::Instant::now()),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(%peer, "accepted connection");

                        let guard = live_connections.clone();
                        let registry = registry.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::task::spawn_local(async move {
                            connection::run(stream, registry, shutdown).await;
                            drop(guard);
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for the shutdown signal")?;
                break;
            }
        }
    }

    // Stop accepting, end every conversation, then give the connection
    // tasks a bounded window to flush their backlogs and close.
    info!("shutting down");
    drop(listener);
    registry.shutdown(std::time::Instant::now());
    shutdown_tx.send_replace(true);

    let deadline = tokio::time::Instant::now() + SHUTDOWN_FLUSH_DEADLINE;
    while Rc::strong_count(&live_connections) > 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("goodbye");
    Ok(())
}

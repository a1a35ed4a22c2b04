#![warn(clippy::all)]

mod config;
mod error;
mod http;
mod ladder;
mod manifest;
mod proxy;
mod server;
mod session;
mod stats;
mod transfer_log;
mod upstream;

use std::io::ErrorKind;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{Args, ProxyConfig};
use crate::proxy::ProxyContext;
use crate::transfer_log::TransferLog;
use crate::upstream::UpstreamPool;

const LISTEN_BACKLOG: i32 = 1024;

// ============================================================================
// MAIN
// ============================================================================

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        // --help and --version
        Err(e) => e.exit(),
    };

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = start(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn start(args: Args) -> anyhow::Result<()> {
    let config = ProxyConfig::from_args(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let origin = config.origin_addr()?;
    let transfer_log = TransferLog::open(&config.log_path)?;
    let listener = bind_listener(&config)?;

    let upstream = UpstreamPool::new(
        config.upstream,
        origin,
        config.connect_timeout,
        config.idle_timeout,
    );
    let ctx = Arc::new(ProxyContext::new(
        config.alpha,
        upstream,
        transfer_log,
        config.idle_timeout,
    ));

    if let Some(interval) = config.stats_interval {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                ctx.stats.print(ctx.sessions.len(), ctx.ladders.len());
            }
        });
    }

    info!("🚀 Proxy listening on http://{}", config.listen_addr());
    info!(
        "Origin {} (upstream {:?}), alpha={}, transfer log {:?}",
        origin, config.upstream, config.alpha, config.log_path
    );

    server::serve(listener, ctx).await
}

fn bind_listener(config: &ProxyConfig) -> anyhow::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr = config.listen_addr();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match socket.bind(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            anyhow::bail!("port {} is already in use", config.listen_port);
        }
        Err(e) => anyhow::bail!("bind to {} failed: {}", addr, e),
    }

    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

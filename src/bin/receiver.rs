//! The Receiver (§4.1): binds a UDP socket, appends each datagram as one
//! line to the hot buffer file, flushing at line granularity. Grounded on
//! the `netflow_parser` crate's tokio UDP listener examples for the
//! accept-loop shape, and on the teacher's signal-driven graceful shutdown
//! posture.

use clap::Parser;
use natshard_core::config::Config;
use snafu::{ResultExt, Snafu};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "UDP ingestion endpoint for the CGNAT log pipeline")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "NATSHARD_CONFIG", default_value = "natshard.toml")]
    config: PathBuf,
}

#[derive(Debug, Snafu)]
enum FatalError {
    #[snafu(display("config error: {source}"))]
    Config { source: natshard_core::ConfigError },

    #[snafu(display("failed to bind UDP socket on {addr}: {source}"))]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[snafu(display("hot buffer write failed persistently: {source}"))]
    BufferWrite { source: std::io::Error },
}

const MAX_DATAGRAM: usize = 65535;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_WRITE_RETRIES: u32 = 5;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => std::process::exit(exitcode::OK),
        Err(e) => {
            tracing::error!(error = %e, "receiver exiting after fatal error");
            std::process::exit(exitcode::SOFTWARE);
        }
    }
}

async fn run() -> Result<(), FatalError> {
    let args = Args::parse();
    let config = Config::load(&args.config).context(ConfigSnafu)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.syslog_port)
        .parse()
        .expect("formatted from a valid u16 port");
    let socket = UdpSocket::bind(addr).await.context(BindSnafu { addr })?;
    tracing::info!(%addr, "receiver listening for UDP syslog datagrams");

    let buffer_path = config.hot_buffer_path();
    let mut buffer_file = open_append(&buffer_path).context(BufferWriteSnafu)?;

    let stats = Arc::new(natshard_core::stats::ReceiverStats::new());
    let running = Arc::new(AtomicBool::new(true));
    spawn_signal_handler(running.clone());
    spawn_stats_logger(stats.clone(), running.clone());

    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Relaxed) {
        let recv = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await;
        let (len, _peer) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "socket read error");
                stats.record_error();
                continue;
            }
            Err(_timeout) => continue,
        };

        stats.record_datagram();

        let line = String::from_utf8_lossy(&buf[..len]);
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }

        if let Err(e) = write_line_with_retry(&mut buffer_file, trimmed).await {
            tracing::error!(error = %e, "persistent write failure to hot buffer, terminating");
            return Err(FatalError::BufferWrite { source: e });
        }
        stats.record_written();
    }

    buffer_file.flush().ok();
    let snap = stats.snapshot();
    tracing::info!(
        received = snap.received,
        written = snap.written,
        errors = snap.errors,
        uptime_secs = snap.uptime_secs,
        "receiver shutting down cleanly"
    );
    Ok(())
}

fn open_append(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Writes one line, retrying a failing write after a short backoff
/// (§4.1 "Write errors to the buffer file are retried after a short
/// backoff; persistent write failure terminates the process").
async fn write_line_with_retry(file: &mut std::fs::File, line: &str) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        match writeln!(file, "{line}").and_then(|_| file.flush()) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_WRITE_RETRIES => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "retrying hot buffer write");
                tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn spawn_signal_handler(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs on Unix");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        tracing::info!("shutdown signal received");
        running.store(false, Ordering::Relaxed);
    });
}

fn spawn_stats_logger(stats: Arc<natshard_core::stats::ReceiverStats>, running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            let snap = stats.snapshot();
            tracing::info!(
                received = snap.received,
                written = snap.written,
                errors = snap.errors,
                uptime_secs = snap.uptime_secs,
                "receiver heartbeat"
            );
        }
    });
}

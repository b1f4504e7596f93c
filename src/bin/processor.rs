//! The Processor (§4.2): tails the hot buffer on an offset/fingerprint
//! discipline, filters and parses each new line, normalizes it against the
//! day's shard dictionaries, batches inserts, and rotates shards at local
//! midnight. Grounded on the teacher's `file-source` tail loop for the
//! offset/rotation handling, adapted to a single well-known buffer file
//! rather than a glob.

use clap::Parser;
use natshard_core::config::Config;
use natshard_core::offset::{BufferFingerprint, OffsetTracker};
use natshard_core::parse::{is_noise, parse_line};
use natshard_core::shard::{self, ShardHandle, StoreOptions};
use natshard_core::stats::ProcessorStats;
use snafu::{ResultExt, Snafu};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "processor", about = "Tails, normalizes, and shards the CGNAT hot buffer")]
struct Args {
    #[arg(long, env = "NATSHARD_CONFIG", default_value = "natshard.toml")]
    config: PathBuf,
}

#[derive(Debug, Snafu)]
enum FatalError {
    #[snafu(display("config error: {source}"))]
    Config { source: natshard_core::ConfigError },

    #[snafu(display("failed to load offset tracker: {source}"))]
    Offset { source: std::io::Error },
}

const TICK: Duration = Duration::from_millis(500);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => std::process::exit(exitcode::OK),
        Err(e) => {
            tracing::error!(error = %e, "processor exiting after fatal error");
            std::process::exit(exitcode::SOFTWARE);
        }
    }
}

struct DayShard {
    date: chrono::NaiveDate,
    handle: ShardHandle,
}

/// A line pulled past the committed offset, still awaiting its batch.
struct PendingLine {
    date: chrono::NaiveDate,
    text: String,
}

async fn run() -> Result<(), FatalError> {
    let args = Args::parse();
    let config = Config::load(&args.config).context(ConfigSnafu)?;

    let mut offsets = OffsetTracker::load(&config.offset_path()).context(OffsetSnafu)?;
    let store_opts = StoreOptions {
        journal_mode: config.db_journal_mode.clone(),
        synchronous: config.db_synchronous.clone(),
        busy_timeout: Duration::from_secs(config.db_timeout_sec),
    };

    let stats = Arc::new(ProcessorStats::new());
    let running = Arc::new(AtomicBool::new(true));
    spawn_signal_handler(running.clone());

    let mut day_shard: Option<DayShard> = None;
    let mut pending: Vec<PendingLine> = Vec::new();
    // In-memory read cursor: how far into the buffer we've queued lines for,
    // which may run ahead of `offsets`' durably committed value until the
    // batch containing them is inserted (§4.2.1 commit-then-offset order).
    let mut cursor = offsets.offset();
    let mut last_flush = std::time::Instant::now();
    let mut last_sweep_day: Option<chrono::NaiveDate> = None;

    while running.load(Ordering::Relaxed) {
        let today = chrono::Local::now().date_naive();
        if last_sweep_day != Some(today) {
            natshard_core::retention::sweep(&config.cold_storage_dir, today, config.log_retention_days);
            last_sweep_day = Some(today);
        }

        match tail_once(&config.hot_buffer_path(), &mut offsets, cursor, &config, &stats) {
            Ok(outcome) => {
                cursor = outcome.new_cursor;
                pending.extend(outcome.lines);
            }
            Err(e) => tracing::warn!(error = %e, "tail read failed this tick, will retry"),
        }

        let timeout_elapsed = last_flush.elapsed() >= Duration::from_secs(config.batch_timeout_sec);
        if pending.len() >= config.batch_size || (timeout_elapsed && !pending.is_empty()) {
            flush_batch(&mut day_shard, &mut pending, &config, &store_opts, &mut offsets, cursor, &stats);
            last_flush = std::time::Instant::now();
        }

        if let Some(shard) = &day_shard {
            write_heartbeat(shard, &stats);
        }

        tokio::time::sleep(TICK).await;
    }

    if !pending.is_empty() {
        flush_batch(&mut day_shard, &mut pending, &config, &store_opts, &mut offsets, cursor, &stats);
    }
    if let Some(shard) = &day_shard {
        write_heartbeat(shard, &stats);
    }
    tracing::info!("processor shut down cleanly");
    Ok(())
}

struct TailOutcome {
    lines: Vec<PendingLine>,
    new_cursor: u64,
}

/// Reads whatever bytes exist between `cursor` and the buffer's current
/// length, reconciling rotation/truncation against the tracker's last
/// *committed* fingerprint first (§4.2.1). Noise lines are dropped before
/// parsing; parse failures are counted and skipped, never retried (§7).
fn tail_once(
    buffer_path: &std::path::Path,
    offsets: &mut OffsetTracker,
    cursor: u64,
    config: &Config,
    stats: &ProcessorStats,
) -> std::io::Result<TailOutcome> {
    let mut file = match std::fs::File::open(buffer_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TailOutcome { lines: Vec::new(), new_cursor: cursor });
        }
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let fingerprint = BufferFingerprint::of_file(&file)?;
    offsets.reconcile(len, fingerprint);

    // Rotation resets the durable offset to 0; mirror that onto our ahead-
    // of-commit cursor too, since the bytes it was counting no longer exist.
    let start = if offsets.offset() == 0 && cursor > len { 0 } else { cursor.min(len) };
    if start >= len {
        return Ok(TailOutcome { lines: Vec::new(), new_cursor: start });
    }

    file.seek(SeekFrom::Start(start))?;
    let mut reader = std::io::BufReader::new(file);
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;

    let now = chrono::Local::now();
    let mut lines = Vec::new();
    let mut consumed = start;
    for text in raw.lines() {
        consumed += text.len() as u64 + 1;
        if is_noise(text, &config.noise_filters) {
            stats.record_filtered();
            continue;
        }
        match parse_line(text, now) {
            Ok(rec) => {
                let date = chrono::DateTime::from_timestamp(rec.ts_unix, 0)
                    .unwrap_or_default()
                    .with_timezone(&chrono::Local)
                    .date_naive();
                lines.push(PendingLine { date, text: text.to_string() });
            }
            Err(e) => {
                stats.record_parse_failure();
                tracing::debug!(error = %e, line = text, "dropping unparseable line");
            }
        }
    }

    Ok(TailOutcome { lines, new_cursor: consumed })
}

fn flush_batch(
    day_shard: &mut Option<DayShard>,
    pending: &mut Vec<PendingLine>,
    config: &Config,
    store_opts: &StoreOptions,
    offsets: &mut OffsetTracker,
    cursor: u64,
    stats: &ProcessorStats,
) {
    if pending.is_empty() {
        return;
    }

    let mut rows_by_date: std::collections::BTreeMap<chrono::NaiveDate, Vec<String>> = Default::default();
    for line in pending.drain(..) {
        rows_by_date.entry(line.date).or_default().push(line.text);
    }

    let mut all_committed = true;
    for (date, lines) in rows_by_date {
        ensure_day_shard(day_shard, date, config, store_opts, stats);
        let Some(shard) = day_shard else {
            all_committed = false;
            continue;
        };

        let now = chrono::Local::now();
        let mut rows = Vec::with_capacity(lines.len());
        for line in &lines {
            let Ok(rec) = parse_line(line, now) else { continue };
            match shard::prepare_row(&mut shard.handle, &rec) {
                Ok(row) => {
                    rows.push(row);
                    stats.record_parsed(rec.ts_unix);
                }
                Err(e) => {
                    stats.record_parse_failure();
                    tracing::warn!(error = %e, "dropping row that failed dictionary normalization");
                }
            }
        }

        if let Err(e) = shard::insert_batch(&mut shard.handle, &rows) {
            tracing::error!(error = %e, "batch insert failed, lines remain unacknowledged for retry");
            all_committed = false;
        }
    }

    if all_committed {
        if let Err(e) = offsets.commit(cursor) {
            tracing::error!(error = %e, "failed to persist offset after committed batch");
        }
    }
}

fn ensure_day_shard(
    day_shard: &mut Option<DayShard>,
    date: chrono::NaiveDate,
    config: &Config,
    store_opts: &StoreOptions,
    stats: &ProcessorStats,
) {
    let needs_rotation = match day_shard {
        Some(ds) => ds.date != date,
        None => true,
    };
    if !needs_rotation {
        return;
    }
    if day_shard.is_some() {
        stats.record_rotation();
        tracing::info!(date = %date, "rotating to new day's shard");
    }
    match shard::open_shard(&config.shard_path(date), store_opts) {
        Ok(handle) => *day_shard = Some(DayShard { date, handle }),
        Err(e) => tracing::error!(error = %e, date = %date, "failed to open day shard"),
    }
}

fn write_heartbeat(shard: &DayShard, stats: &ProcessorStats) {
    for (key, value) in stats.as_kv_pairs() {
        if let Err(e) = shard::upsert_stats(&shard.handle, key, &value) {
            tracing::warn!(error = %e, key, "failed to upsert processor stat");
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

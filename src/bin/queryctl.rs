//! `queryctl`: a CLI front-end over the shard query engine, standing in for
//! the out-of-scope web UI (§2 Non-goals). Grounded on the teacher's `vector
//! top`-style operational CLIs: a `clap` derive with subcommands, one per
//! read-only operation the engine exposes.

use clap::{Parser, Subcommand};
use natshard_core::config::Config;
use natshard_core::query::{self, Filters};
use natshard_core::shard::StoreOptions;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "queryctl", about = "Search and inspect the CGNAT log shards")]
struct Cli {
    #[arg(long, env = "NATSHARD_CONFIG", default_value = "natshard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search logs across a date range with optional field filters.
    Search {
        /// Inclusive start, `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`.
        #[arg(long)]
        start: String,
        /// Inclusive end, same formats as `--start`.
        #[arg(long)]
        end: String,
        #[arg(long)]
        src_ip: Option<String>,
        #[arg(long)]
        src_port: Option<String>,
        #[arg(long)]
        nat_ip: Option<String>,
        #[arg(long)]
        nat_port: Option<String>,
        #[arg(long)]
        dst_ip: Option<String>,
        #[arg(long)]
        dst_port: Option<String>,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 100)]
        page_size: usize,
    },
    /// List every day that has a shard on disk.
    Dates,
    /// Row count, file size, and processor stats for one day.
    Summary {
        #[arg(long)]
        date: String,
    },
    /// Per-protocol/interface/hour/top-IP aggregates for one day.
    Chart {
        #[arg(long)]
        date: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(msg) = run() {
        eprintln!("error: {msg}");
        std::process::exit(exitcode::SOFTWARE);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).map_err(|e| e.to_string())?;
    let store_opts = StoreOptions {
        journal_mode: config.db_journal_mode.clone(),
        synchronous: config.db_synchronous.clone(),
        busy_timeout: Duration::from_secs(config.db_timeout_sec),
    };

    match cli.command {
        Command::Search {
            start,
            end,
            src_ip,
            src_port,
            nat_ip,
            nat_port,
            dst_ip,
            dst_port,
            page,
            page_size,
        } => {
            let start_dt = parse_datetime(&start)?;
            let end_dt = parse_datetime(&end)?;
            let filters = Filters {
                src_ip_priv: src_ip.as_deref().map(query::parse_ip_filter).transpose().map_err(|e| e.to_string())?,
                src_port_priv: src_port.as_deref().map(query::parse_port_filter).transpose().map_err(|e| e.to_string())?,
                nat_ip_pub: nat_ip.as_deref().map(query::parse_ip_filter).transpose().map_err(|e| e.to_string())?,
                nat_port_pub: nat_port.as_deref().map(query::parse_port_filter).transpose().map_err(|e| e.to_string())?,
                dst_ip: dst_ip.as_deref().map(query::parse_ip_filter).transpose().map_err(|e| e.to_string())?,
                dst_port: dst_port.as_deref().map(query::parse_port_filter).transpose().map_err(|e| e.to_string())?,
            };

            let result = query::search(
                &config.cold_storage_dir,
                start_dt,
                end_dt,
                &filters,
                page,
                page_size,
                config.query_result_limit,
                &store_opts,
            )
            .map_err(|e| e.to_string())?;

            println!("{:<20} {:<8} {:<8} {:<8} {:<8} {:<21} {:<21} {:<21}",
                "timestamp", "in", "out", "state", "proto", "src", "dst", "nat");
            for row in &result.rows {
                println!(
                    "{:<20} {:<8} {:<8} {:<8} {:<8} {:<21} {:<21} {:<21}",
                    row.timestamp,
                    row.iface_in,
                    row.iface_out,
                    row.state.as_deref().unwrap_or("N/A"),
                    row.proto,
                    format!("{}:{}", row.src_ip_priv, row.src_port_priv),
                    format!("{}:{}", row.dst_ip, row.dst_port),
                    format!("{}:{}", row.nat_ip_pub, row.nat_port_pub),
                );
            }
            println!("\n{} row(s) on this page, {} total{}", result.rows.len(), result.total,
                if result.truncated { " (truncated by result limit)" } else { "" });
            Ok(())
        }
        Command::Dates => {
            for date in query::available_dates(&config.cold_storage_dir) {
                println!("{date}");
            }
            Ok(())
        }
        Command::Summary { date } => {
            let date = parse_date(&date)?;
            let summary = query::daily_summary(&config.cold_storage_dir, date, &store_opts);
            if !summary.exists {
                println!("no shard for {date}");
                return Ok(());
            }
            println!("date: {date}");
            println!("total_logs: {}", summary.total_logs);
            println!("shard_size_bytes: {}", summary.shard_size_bytes);
            for (k, v) in &summary.processor_stats {
                println!("{k}: {v}");
            }
            Ok(())
        }
        Command::Chart { date } => {
            let date = parse_date(&date)?;
            match query::chart_aggregates(&config.cold_storage_dir, date, &store_opts).map_err(|e| e.to_string())? {
                None => println!("no shard for {date}"),
                Some(agg) => {
                    println!("protocols: {:?}", agg.protocols);
                    println!("interfaces: {:?}", agg.interfaces);
                    println!("timeline_by_hour: {:?}", agg.timeline_by_hour);
                    println!("top_nat_ips: {:?}", agg.top_nat_ips);
                    println!("top_dst_ips: {:?}", agg.top_dst_ips);
                }
            }
            Ok(())
        }
    }
}

fn parse_date(raw: &str) -> Result<chrono::NaiveDate, String> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("invalid date {raw:?}: {e}"))
}

fn parse_datetime(raw: &str) -> Result<chrono::NaiveDateTime, String> {
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt);
    }
    parse_date(raw).map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
}

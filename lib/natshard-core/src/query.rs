//! The multi-shard query engine (§4.3): enumerates shards touching a date
//! range, runs the same parameterized filter against each, and merges
//! ordered results.

use crate::error::{ExecutionSnafu, QueryError, ShardUnavailableSnafu};
use crate::ipv4::render_optional_ip;
use crate::shard::{connection, open_shard, StoreOptions};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use snafu::ResultExt;
use std::path::Path;

/// Optional filters from §4.3; `None` means "no constraint on this field".
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub src_ip_priv: Option<u32>,
    pub src_port_priv: Option<u16>,
    pub nat_ip_pub: Option<u32>,
    pub nat_port_pub: Option<u16>,
    pub dst_ip: Option<u32>,
    pub dst_port: Option<u16>,
}

/// One fully decoded row, as returned to the UI collaborator (§4.3
/// "Decoding": dictionary ids joined to string names, IPs rendered as
/// dotted-quad, NAT NULLs rendered as the `"N/A"` sentinel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRow {
    pub timestamp: String,
    pub iface_in: String,
    pub iface_out: String,
    pub state: Option<String>,
    pub proto: String,
    pub src_ip_priv: String,
    pub src_port_priv: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub nat_ip_pub: String,
    pub nat_port_pub: String,
}

pub struct SearchResult {
    pub rows: Vec<DecodedRow>,
    pub total: usize,
    pub truncated: bool,
}

const SELECT_BASE: &str = "
SELECT
    logs.timestamp,
    di_in.name, di_out.name, ds.name, dp.name,
    logs.src_ip_priv, logs.src_port_priv,
    logs.dst_ip, logs.dst_port,
    logs.nat_ip_pub, logs.nat_port_pub
FROM logs
INNER JOIN d_interfaces di_in  ON di_in.id  = logs.interface_in_id
INNER JOIN d_interfaces di_out ON di_out.id = logs.interface_out_id
INNER JOIN d_protocols  dp     ON dp.id     = logs.protocol_id
LEFT  JOIN d_states     ds     ON ds.id     = logs.state_id
WHERE logs.timestamp BETWEEN ?1 AND ?2
";

fn list_shard_dates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut cur = start;
    while cur <= end {
        dates.push(cur);
        cur = cur.succ_opt().expect("date within representable range");
    }
    dates
}

/// Enumerates shard files in `cold_dir` whose filename-date falls in
/// `[start, end]`, skipping missing days silently (§4.3 "Shard selection").
pub fn shards_in_range(cold_dir: &Path, start: NaiveDate, end: NaiveDate) -> Vec<std::path::PathBuf> {
    list_shard_dates(start, end)
        .into_iter()
        .map(|d| cold_dir.join(format!("{}.db", d.format("%Y-%m-%d"))))
        .filter(|p| p.is_file())
        .collect()
}

fn build_filter_clause(filters: &Filters) -> (String, Vec<SqlValue>) {
    let mut clause = String::new();
    let mut params: Vec<SqlValue> = Vec::new();

    macro_rules! add {
        ($col:expr, $val:expr) => {
            if let Some(v) = $val {
                clause.push_str(&format!(" AND {} = ?{}", $col, params.len() + 3));
                params.push(SqlValue::Integer(v as i64));
            }
        };
    }

    add!("logs.src_ip_priv", filters.src_ip_priv);
    add!("logs.src_port_priv", filters.src_port_priv);
    add!("logs.nat_ip_pub", filters.nat_ip_pub);
    add!("logs.nat_port_pub", filters.nat_port_pub);
    add!("logs.dst_ip", filters.dst_ip);
    add!("logs.dst_port", filters.dst_port);

    (clause, params)
}

/// Runs the per-shard parameterized SELECT (§4.3 "Per-shard query") and
/// decodes every row.
fn query_one_shard(
    path: &Path,
    start_ts: i64,
    end_ts: i64,
    filters: &Filters,
    opts: &StoreOptions,
) -> Result<Vec<DecodedRow>, QueryError> {
    let handle = open_shard(path, opts).context(ShardUnavailableSnafu { path: path.to_path_buf() })?;
    let conn = connection(&handle);

    let (clause, extra_params) = build_filter_clause(filters);
    let sql = format!("{SELECT_BASE}{clause} ORDER BY logs.timestamp DESC");

    let mut stmt = conn.prepare(&sql).context(ExecutionSnafu { path: path.to_path_buf() })?;

    let mut all_params: Vec<&dyn rusqlite::ToSql> =
        vec![&start_ts as &dyn rusqlite::ToSql, &end_ts as &dyn rusqlite::ToSql];
    for p in &extra_params {
        all_params.push(p as &dyn rusqlite::ToSql);
    }

    let rows = stmt
        .query_map(all_params.as_slice(), |row| {
            let ts: i64 = row.get(0)?;
            let local = chrono::DateTime::from_timestamp(ts, 0)
                .unwrap_or_default()
                .with_timezone(&chrono::Local);
            Ok(DecodedRow {
                timestamp: local.format("%Y-%m-%d %H:%M:%S").to_string(),
                iface_in: row.get(1)?,
                iface_out: row.get(2)?,
                state: row.get::<_, Option<String>>(3)?,
                proto: row.get(4)?,
                src_ip_priv: render_optional_ip(Some(row.get::<_, u32>(5)?)),
                src_port_priv: row.get(6)?,
                dst_ip: render_optional_ip(Some(row.get::<_, u32>(7)?)),
                dst_port: row.get(8)?,
                nat_ip_pub: render_optional_ip(row.get::<_, Option<u32>>(9)?),
                nat_port_pub: row
                    .get::<_, Option<u16>>(10)?
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "N/A".to_string()),
            })
        })
        .context(ExecutionSnafu { path: path.to_path_buf() })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context(ExecutionSnafu { path: path.to_path_buf() })?);
    }
    Ok(out)
}

fn validate_filters(filters: &Filters) -> Result<(), QueryError> {
    // Construction-time typed fields (u32/u16) already make malformed IPs or
    // non-numeric ports unrepresentable; this hook exists for callers (e.g.
    // queryctl) parsing filters from free-form strings before they ever
    // reach `Filters`, so the structured error path is exercised in one
    // place (§7 "Filter error").
    let _ = filters;
    Ok(())
}

/// Parses a dotted-quad filter argument, surfacing a structured
/// `QueryError::InvalidFilter` on malformed input (§4.3 "Failure semantics").
pub fn parse_ip_filter(raw: &str) -> Result<u32, QueryError> {
    crate::ipv4::parse_ip(raw).map_err(|_| QueryError::InvalidFilter {
        reason: format!("{raw:?} is not a valid IPv4 address"),
    })
}

/// Parses a port filter argument, surfacing a structured error on
/// non-numeric input.
pub fn parse_port_filter(raw: &str) -> Result<u16, QueryError> {
    raw.parse::<u16>().map_err(|_| QueryError::InvalidFilter {
        reason: format!("{raw:?} is not a valid port number"),
    })
}

/// `search` (§6 Query API): fans the filter over every shard in range,
/// merges by timestamp descending, and returns one page (§4.3 "Result
/// merging"). A hard `result_limit` bounds merged-result memory; beyond it
/// the engine truncates and sets `truncated = true`.
pub fn search(
    cold_dir: &Path,
    start_dt: NaiveDateTime,
    end_dt: NaiveDateTime,
    filters: &Filters,
    page: usize,
    page_size: usize,
    result_limit: usize,
    store_opts: &StoreOptions,
) -> Result<SearchResult, QueryError> {
    validate_filters(filters)?;

    let shards = shards_in_range(cold_dir, start_dt.date(), end_dt.date());
    let start_ts = start_dt.and_utc().timestamp();
    let end_ts = end_dt.and_utc().timestamp();

    let mut merged: Vec<DecodedRow> = Vec::new();
    for shard_path in &shards {
        match query_one_shard(shard_path, start_ts, end_ts, filters, store_opts) {
            Ok(mut rows) => merged.append(&mut rows),
            Err(e) => {
                tracing::warn!(path = %shard_path.display(), error = %e, "skipping shard that failed to open or query");
            }
        }
    }

    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let truncated = merged.len() > result_limit;
    if truncated {
        merged.truncate(result_limit);
    }

    let total = merged.len();
    let start_idx = page.saturating_mul(page_size).min(total);
    let end_idx = start_idx.saturating_add(page_size).min(total);
    let window = merged[start_idx..end_idx].to_vec();

    Ok(SearchResult {
        rows: window,
        total,
        truncated,
    })
}

/// `available_dates` (§6): every shard date present under `cold_dir`.
pub fn available_dates(cold_dir: &Path) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let Ok(entries) = std::fs::read_dir(cold_dir) else {
        return dates;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|s| s.strip_suffix(".db")) else {
            continue;
        };
        if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
            dates.push(date);
        }
    }
    dates.sort();
    dates
}

/// `daily_summary` (§6): existence, row count, file size, and processor
/// stats for one day's shard.
pub struct DailySummary {
    pub exists: bool,
    pub total_logs: i64,
    pub shard_size_bytes: u64,
    pub processor_stats: std::collections::HashMap<String, String>,
}

pub fn daily_summary(cold_dir: &Path, date: NaiveDate, opts: &StoreOptions) -> DailySummary {
    let path = cold_dir.join(format!("{}.db", date.format("%Y-%m-%d")));
    if !path.is_file() {
        return DailySummary {
            exists: false,
            total_logs: 0,
            shard_size_bytes: 0,
            processor_stats: Default::default(),
        };
    }

    let shard_size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    match open_shard(&path, opts) {
        Ok(handle) => DailySummary {
            exists: true,
            total_logs: crate::shard::total_logs(&handle).unwrap_or(0),
            shard_size_bytes,
            processor_stats: crate::shard::get_stats(&handle).unwrap_or_default(),
        },
        Err(_) => DailySummary {
            exists: true,
            total_logs: 0,
            shard_size_bytes,
            processor_stats: Default::default(),
        },
    }
}

/// `chart_aggregates` (§6): per-day summaries used by dashboards (an
/// external collaborator concern; this computes the raw aggregates they
/// render).
pub struct ChartAggregates {
    pub protocols: Vec<(String, i64)>,
    pub interfaces: Vec<(String, i64)>,
    pub timeline_by_hour: Vec<(u8, i64)>,
    pub top_nat_ips: Vec<(String, i64)>,
    pub top_dst_ips: Vec<(String, i64)>,
}

pub fn chart_aggregates(
    cold_dir: &Path,
    date: NaiveDate,
    opts: &StoreOptions,
) -> Result<Option<ChartAggregates>, QueryError> {
    let path = cold_dir.join(format!("{}.db", date.format("%Y-%m-%d")));
    if !path.is_file() {
        return Ok(None);
    }
    let handle = open_shard(&path, opts).context(ShardUnavailableSnafu { path: path.clone() })?;
    let conn = connection(&handle);

    let protocols = top_n(conn, &path, "SELECT dp.name, COUNT(*) c FROM logs JOIN d_protocols dp ON dp.id = logs.protocol_id GROUP BY dp.name ORDER BY c DESC")?;
    let interfaces = top_n(conn, &path, "SELECT di.name, COUNT(*) c FROM logs JOIN d_interfaces di ON di.id = logs.interface_in_id GROUP BY di.name ORDER BY c DESC")?;
    let top_nat_ips = top_n(conn, &path, "SELECT nat_ip_pub, COUNT(*) c FROM logs WHERE nat_ip_pub IS NOT NULL GROUP BY nat_ip_pub ORDER BY c DESC LIMIT 10")?;
    let top_dst_ips = top_n(conn, &path, "SELECT dst_ip, COUNT(*) c FROM logs GROUP BY dst_ip ORDER BY c DESC LIMIT 10")?;

    let mut stmt = conn
        .prepare("SELECT CAST(strftime('%H', timestamp, 'unixepoch', 'localtime') AS INTEGER) h, COUNT(*) c FROM logs GROUP BY h ORDER BY h")
        .context(ExecutionSnafu { path: path.clone() })?;
    let timeline_by_hour = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)? as u8, row.get::<_, i64>(1)?)))
        .context(ExecutionSnafu { path: path.clone() })?
        .collect::<Result<Vec<_>, _>>()
        .context(ExecutionSnafu { path: path.clone() })?;

    Ok(Some(ChartAggregates {
        protocols,
        interfaces,
        timeline_by_hour,
        top_nat_ips: top_nat_ips
            .into_iter()
            .map(|(ip, c)| (render_optional_ip(ip.parse::<u32>().ok()), c))
            .collect(),
        top_dst_ips: top_dst_ips
            .into_iter()
            .map(|(ip, c)| (render_optional_ip(ip.parse::<u32>().ok()), c))
            .collect(),
    }))
}

fn top_n(conn: &rusqlite::Connection, path: &Path, sql: &str) -> Result<Vec<(String, i64)>, QueryError> {
    let mut stmt = conn.prepare(sql).context(ExecutionSnafu { path: path.to_path_buf() })?;
    let rows = stmt
        .query_map([], |row| {
            let name: rusqlite::types::Value = row.get(0)?;
            let label = match name {
                rusqlite::types::Value::Text(s) => s,
                rusqlite::types::Value::Integer(i) => i.to_string(),
                _ => String::new(),
            };
            Ok((label, row.get::<_, i64>(1)?))
        })
        .context(ExecutionSnafu { path: path.to_path_buf() })?;
    rows.collect::<Result<Vec<_>, _>>()
        .context(ExecutionSnafu { path: path.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_line;
    use crate::shard::{insert_batch, open_shard, prepare_row, StoreOptions};
    use chrono::Local;

    fn seed_shard(path: &Path, ts_rfc: &str, nat_ip: &str, nat_port: u16) {
        let mut handle = open_shard(path, &StoreOptions::default()).unwrap();
        let line = format!(
            "{} router firewall,info forward: in:ether1 out:ether2, proto tcp, 100.80.3.210:41760->8.8.8.8:443, NAT (100.80.3.210:41760->{}:{})->8.8.8.8:443",
            ts_rfc, nat_ip, nat_port
        );
        let rec = parse_line(&line, Local::now()).unwrap();
        let row = prepare_row(&mut handle, &rec).unwrap();
        insert_batch(&mut handle, &[row]).unwrap();
    }

    #[test]
    fn search_merges_matches_across_two_shards_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let today = chrono::Local::now().date_naive();
        let yesterday = today.pred_opt().unwrap();

        seed_shard(
            &dir.path().join(format!("{}.db", today.format("%Y-%m-%d"))),
            "Dec  2 14:23:45",
            "177.67.176.147",
            41760,
        );
        seed_shard(
            &dir.path().join(format!("{}.db", yesterday.format("%Y-%m-%d"))),
            "Dec  1 10:00:00",
            "177.67.176.147",
            41760,
        );
        // Non-matching noise row in the same shard as "today".
        seed_shard(
            &dir.path().join(format!("{}.db", today.format("%Y-%m-%d"))),
            "Dec  2 15:00:00",
            "9.9.9.9",
            1,
        );

        let filters = Filters {
            nat_ip_pub: Some(crate::ipv4::ip_to_int("177.67.176.147".parse().unwrap())),
            nat_port_pub: Some(41760),
            ..Default::default()
        };

        let start = yesterday.and_hms_opt(0, 0, 0).unwrap();
        let end = today.and_hms_opt(23, 59, 59).unwrap();

        let result = search(dir.path(), start, end, &filters, 0, 100, 10_000, &StoreOptions::default()).unwrap();
        assert_eq!(result.total, 2);
        assert!(result.rows[0].timestamp > result.rows[1].timestamp);
    }

    #[test]
    fn empty_date_range_returns_empty_result_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let end = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let result = search(dir.path(), start, end, &Filters::default(), 0, 10, 10_000, &StoreOptions::default()).unwrap();
        assert_eq!(result.total, 0);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn rejects_malformed_ip_filter_with_structured_error() {
        assert!(parse_ip_filter("not.an.ip").is_err());
        assert!(parse_port_filter("not-a-port").is_err());
    }

    #[test]
    fn merge_order_is_non_increasing_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let today = chrono::Local::now().date_naive();
        seed_shard(&dir.path().join(format!("{}.db", today.format("%Y-%m-%d"))), "Dec  2 08:00:00", "1.2.3.4", 1);
        seed_shard(&dir.path().join(format!("{}.db", today.format("%Y-%m-%d"))), "Dec  2 20:00:00", "1.2.3.5", 2);

        let start = today.and_hms_opt(0, 0, 0).unwrap();
        let end = today.and_hms_opt(23, 59, 59).unwrap();
        let result = search(dir.path(), start, end, &Filters::default(), 0, 100, 10_000, &StoreOptions::default()).unwrap();
        let timestamps: Vec<_> = result.rows.iter().map(|r| r.timestamp.clone()).collect();
        let mut sorted = timestamps.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(timestamps, sorted);
    }
}

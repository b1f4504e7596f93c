//! Line filtering and parsing (§4.2.2): noise-substring screening, the
//! with-NAT/no-NAT regex pair, and the syslog timestamp's year inference.

use crate::error::{BadAddressSnafu, BadPortSnafu, BadTimestampSnafu, NoMatchSnafu, ParseError};
use crate::ipv4::parse_ip;
use chrono::{Datelike, Local, NaiveDate, TimeZone};
use regex::Regex;
use snafu::OptionExt;
use std::sync::LazyLock;

/// A fully parsed, in-memory log record (§3 "Parsed record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub ts_unix: i64,
    pub iface_in: String,
    pub iface_out: String,
    pub state: Option<String>,
    pub proto: String,
    pub src_ip_priv: u32,
    pub src_port: u16,
    pub dst_ip: u32,
    pub dst_port: u16,
    pub nat_ip_pub: Option<u32>,
    pub nat_port_pub: Option<u16>,
}

// Group order: ts, iface_in, iface_out, state, proto, src_ip, src_port,
// dst_ip, dst_port, [nat_pub_ip, nat_pub_port].
static WITH_NAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(?P<ts>[A-Za-z]{3}\s+\d{1,2}\s\d{2}:\d{2}:\d{2})
        .*?in:(?P<iface_in>\S+)\s+out:(?P<iface_out>\S+),
        \s*(?:state:(?P<state>\S*),\s*)?
        .*?proto\s+(?P<proto>\S+),
        \s*(?P<src_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<src_port>\d+)
        ->(?P<dst_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<dst_port>\d+),
        .*?NAT\s*\(\s*\d{1,3}(?:\.\d{1,3}){3}:\d+
        ->(?P<nat_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<nat_port>\d+)\)->
        ",
    )
    .expect("WITH_NAT_RE is a fixed, valid pattern")
});

static NO_NAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^(?P<ts>[A-Za-z]{3}\s+\d{1,2}\s\d{2}:\d{2}:\d{2})
        .*?in:(?P<iface_in>\S+)\s+out:(?P<iface_out>\S+),
        \s*(?:state:(?P<state>\S*),\s*)?
        .*?proto\s+(?P<proto>\S+),
        \s*(?P<src_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<src_port>\d+)
        ->(?P<dst_ip>\d{1,3}(?:\.\d{1,3}){3}):(?P<dst_port>\d+)
        ",
    )
    .expect("NO_NAT_RE is a fixed, valid pattern")
});

/// Default noise substrings (§4.2.2), overridable via config's
/// `NOISE_FILTERS`.
pub fn is_noise(line: &str, noise_filters: &[String]) -> bool {
    noise_filters.iter().any(|needle| line.contains(needle.as_str()))
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    raw.parse::<u16>().ok().context(BadPortSnafu { raw })
}

/// Parses `Mon DD HH:MM:SS` against the current wall-clock year, correcting
/// the December/January boundary (§4.2.2).
fn parse_syslog_timestamp(raw: &str, now: chrono::DateTime<Local>) -> Result<i64, ParseError> {
    let with_year = format!("{} {}", now.year(), raw.trim());
    let naive = chrono::NaiveDateTime::parse_from_str(&with_year, "%Y %b %e %H:%M:%S")
        .ok()
        .context(BadTimestampSnafu { raw })?;

    let year = if naive.month() == 12 && now.month() == 1 {
        now.year() - 1
    } else {
        now.year()
    };

    let corrected = NaiveDate::from_ymd_opt(year, naive.month(), naive.day())
        .context(BadTimestampSnafu { raw })?
        .and_time(naive.time());

    Local
        .from_local_datetime(&corrected)
        .single()
        .map(|dt| dt.timestamp())
        .context(BadTimestampSnafu { raw })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Tries the with-NAT form, then falls back to the no-NAT form (§4.2.2).
pub fn parse_line(line: &str, now: chrono::DateTime<Local>) -> Result<ParsedRecord, ParseError> {
    if let Some(caps) = WITH_NAT_RE.captures(line) {
        return build_record(&caps, now, true);
    }
    if let Some(caps) = NO_NAT_RE.captures(line) {
        return build_record(&caps, now, false);
    }
    NoMatchSnafu.fail()
}

fn build_record(
    caps: &regex::Captures<'_>,
    now: chrono::DateTime<Local>,
    has_nat: bool,
) -> Result<ParsedRecord, ParseError> {
    let ts_unix = parse_syslog_timestamp(&caps["ts"], now)?;

    let src_ip_priv = parse_ip(&caps["src_ip"])?;
    let dst_ip = parse_ip(&caps["dst_ip"])?;
    let src_port = parse_port(&caps["src_port"])?;
    let dst_port = parse_port(&caps["dst_port"])?;

    let (nat_ip_pub, nat_port_pub) = if has_nat {
        (
            Some(parse_ip(&caps["nat_ip"])?),
            Some(parse_port(&caps["nat_port"])?),
        )
    } else {
        (None, None)
    };

    Ok(ParsedRecord {
        ts_unix,
        iface_in: caps["iface_in"].to_string(),
        iface_out: caps["iface_out"].to_string(),
        state: caps.name("state").and_then(|m| non_empty(m.as_str())),
        proto: caps["proto"].to_string(),
        src_ip_priv,
        src_port,
        dst_ip,
        dst_port,
        nat_ip_pub,
        nat_port_pub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now(y: i32, m: u32, d: u32) -> chrono::DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    const NAT_LINE: &str = "Dec  2 14:23:45 router firewall,info forward: in:ether1 out:ether2, proto tcp, 100.80.3.210:41760->8.8.8.8:443, NAT (100.80.3.210:41760->177.67.176.147:41760)->8.8.8.8:443";

    #[test]
    fn parses_with_nat_form() {
        let rec = parse_line(NAT_LINE, fixed_now(2026, 12, 2)).unwrap();
        assert_eq!(rec.iface_in, "ether1");
        assert_eq!(rec.iface_out, "ether2");
        assert_eq!(rec.proto, "tcp");
        assert_eq!(rec.src_port, 41760);
        assert_eq!(rec.dst_port, 443);
        assert_eq!(rec.nat_port_pub, Some(41760));
        assert_eq!(crate::ipv4::int_to_ip(rec.nat_ip_pub.unwrap()).to_string(), "177.67.176.147");
        assert!(rec.state.is_none());
    }

    #[test]
    fn parses_no_nat_form() {
        let line = "Dec  2 14:23:45 router firewall,info forward: in:ether1 out:ether2, proto udp, 10.0.0.5:5000->1.1.1.1:53";
        let rec = parse_line(line, fixed_now(2026, 12, 2)).unwrap();
        assert!(rec.nat_ip_pub.is_none());
        assert!(rec.nat_port_pub.is_none());
        assert_eq!(rec.proto, "udp");
    }

    #[test]
    fn rejects_lines_matching_neither_form() {
        assert_eq!(parse_line("garbage log line", fixed_now(2026, 6, 1)), Err(ParseError::NoMatch));
    }

    #[test]
    fn december_logs_seen_in_january_get_previous_year() {
        let rec = parse_line(NAT_LINE, fixed_now(2027, 1, 3)).unwrap();
        let dt = chrono::DateTime::from_timestamp(rec.ts_unix, 0).unwrap();
        assert_eq!(dt.year(), 2026);
    }

    #[test]
    fn same_month_logs_use_current_year() {
        let rec = parse_line(NAT_LINE, fixed_now(2026, 12, 15)).unwrap();
        let dt = chrono::DateTime::from_timestamp(rec.ts_unix, 0).unwrap();
        assert_eq!(dt.year(), 2026);
    }

    #[test]
    fn empty_state_token_is_none() {
        let line = "Dec  2 14:23:45 router firewall,info forward: in:ether1 out:ether2, state:, proto tcp, 10.0.0.5:5000->1.1.1.1:443";
        let rec = parse_line(line, fixed_now(2026, 12, 2)).unwrap();
        assert_eq!(rec.state, None);
    }

    #[test]
    fn noise_filter_matches_substring() {
        let filters = vec!["->8.8.8.8:53".to_string()];
        assert!(is_noise("... ->8.8.8.8:53 ...", &filters));
        assert!(!is_noise("... ->8.8.8.8:443 ...", &filters));
    }
}

//! IPv4 dotted-quad <-> u32 codec (§3 invariant: "IPv4 integer <-> dotted-quad
//! conversion is total and round-trip exact for valid addresses").

use crate::error::{BadAddressSnafu, ParseError};
use snafu::OptionExt;
use std::net::Ipv4Addr;

pub fn int_to_ip(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr)
}

pub fn ip_to_int(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Parses a dotted-quad string into its `u32` representation.
pub fn parse_ip(raw: &str) -> Result<u32, ParseError> {
    raw.parse::<Ipv4Addr>()
        .ok()
        .map(ip_to_int)
        .context(BadAddressSnafu { raw })
}

/// Renders `nat_ip_pub`/`nat_port_pub`-style optional fields, which the
/// query engine decodes as the sentinel `"N/A"` when absent (§4.3).
pub fn render_optional_ip(addr: Option<u32>) -> String {
    match addr {
        Some(a) => int_to_ip(a).to_string(),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_quad() {
        assert_eq!(parse_ip("100.80.3.210").unwrap(), u32::from(Ipv4Addr::new(100, 80, 3, 210)));
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(parse_ip("100.80.3").is_err());
        assert!(parse_ip("not.an.ip.addr").is_err());
    }

    #[test]
    fn renders_none_as_na_sentinel() {
        assert_eq!(render_optional_ip(None), "N/A");
    }

    proptest::proptest! {
        #[test]
        fn round_trips_every_u32(x: u32) {
            proptest::prop_assert_eq!(ip_to_int(int_to_ip(x)), x);
        }

        #[test]
        fn round_trips_through_string(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let s = format!("{a}.{b}.{c}.{d}");
            let parsed = parse_ip(&s).unwrap();
            proptest::prop_assert_eq!(int_to_ip(parsed).to_string(), s);
        }
    }
}

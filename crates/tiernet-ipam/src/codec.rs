//! Conversion between address text and fixed-width byte vectors.
//!
//! Pool state is persisted as byte vectors (4 bytes for IPv4, always 16 for
//! IPv6), and arithmetic on them is done on a `u128` view. Text is only used
//! at the API boundary.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{IpamError, IpamResult};

/// Address family of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Width of an address of this family in bytes.
    pub fn width(self) -> usize {
        match self {
            Family::V4 => 4,
            Family::V6 => 16,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// Render a 4- or 16-byte vector in dotted-quad or compressed IPv6 notation.
pub fn stringify(bytes: &[u8]) -> IpamResult<String> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(Ipv4Addr::from(octets).to_string());
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(Ipv6Addr::from(octets).to_string());
    }
    Err(IpamError::MalformedAddress(format!(
        "expected 4 or 16 bytes, got {}",
        bytes.len()
    )))
}

/// Parse text into the full-width byte vector of `family`.
///
/// IPv6 shorthand is expanded, so `fdff::1` and `fdff:0:0::1` yield the same
/// vector.
pub fn parse(text: &str, family: Family) -> IpamResult<Vec<u8>> {
    let trimmed = text.trim();
    match (family, trimmed.parse::<IpAddr>()) {
        (Family::V4, Ok(IpAddr::V4(addr))) => Ok(addr.octets().to_vec()),
        (Family::V6, Ok(IpAddr::V6(addr))) => Ok(addr.octets().to_vec()),
        (_, Ok(_)) => Err(IpamError::MalformedAddress(format!(
            "{trimmed} is not an {family} address"
        ))),
        (_, Err(e)) => Err(IpamError::MalformedAddress(format!("{trimmed}: {e}"))),
    }
}

/// Numeric view of a byte vector (big-endian).
pub fn to_value(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte))
}

/// Byte vector of `family` for a numeric value; high bits beyond the family
/// width are dropped.
pub fn from_value(value: u128, family: Family) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[bytes.len() - family.width()..].to_vec()
}

/// Render a numeric value as text in `family`.
pub fn render(value: u128, family: Family) -> String {
    match family {
        Family::V4 => Ipv4Addr::from(value as u32).to_string(),
        Family::V6 => Ipv6Addr::from(value).to_string(),
    }
}

/// Reduce an IPv4-mapped IPv6 address (`::ffff:10.0.0.1`) to plain IPv4.
/// Anything else is returned trimmed but otherwise unchanged.
pub fn sanitize(address: &str) -> String {
    let trimmed = address.trim();
    match trimmed.parse::<Ipv6Addr>() {
        Ok(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => trimmed.to_string(),
        },
        Err(_) => trimmed.to_string(),
    }
}

/// Host part for an outbound URL: sanitised, with IPv6 literals bracketed.
pub fn url_host(address: &str) -> String {
    let host = sanitize(address);
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host
    }
}

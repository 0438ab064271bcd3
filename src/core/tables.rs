//! Fixed kernel identifiers and the typed values used in DNAT rules
//!
//! Tables and built-in chains are kernel constructs that always exist. Callers
//! should use these constants rather than inline literals so that chain names
//! used in idempotency checks never drift from the names used at creation.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

/// NAT table (DNAT/SNAT, port forwarding)
pub const NAT_TABLE: &str = "nat";
/// Default table for accept/drop filtering
pub const FILTER_TABLE: &str = "filter";
/// Packet alteration table
pub const MANGLE_TABLE: &str = "mangle";
/// Connection-tracking exemption table
pub const RAW_TABLE: &str = "raw";
/// Mandatory access control table
pub const SECURITY_TABLE: &str = "security";

/// Built-in chain traversed before routing (where DNAT happens)
pub const PREROUTING_CHAIN: &str = "PREROUTING";
/// Built-in chain for locally-destined packets
pub const INPUT_CHAIN: &str = "INPUT";
/// Built-in chain for routed packets
pub const FORWARD_CHAIN: &str = "FORWARD";
/// Built-in chain for locally-generated packets
pub const OUTPUT_CHAIN: &str = "OUTPUT";
/// Built-in chain traversed after routing (where SNAT/masquerade happens)
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// All kernel tables this crate knows about
pub const KNOWN_TABLES: [&str; 5] = [
    NAT_TABLE,
    FILTER_TABLE,
    MANGLE_TABLE,
    RAW_TABLE,
    SECURITY_TABLE,
];

const BUILTIN_CHAINS: [&str; 5] = [
    PREROUTING_CHAIN,
    INPUT_CHAIN,
    FORWARD_CHAIN,
    OUTPUT_CHAIN,
    POSTROUTING_CHAIN,
];

/// Returns `true` for chains owned by the kernel, which can never be deleted.
pub fn is_builtin_chain(name: &str) -> bool {
    BUILTIN_CHAINS.contains(&name)
}

/// Layer-4 protocols that support `--dport` matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Dccp,
}

/// Destination port match: a single port or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(port) => write!(f, "{port}"),
            Self::Range(start, end) => write!(f, "{start}:{end}"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once(':') {
            let start = parse_port(start)?;
            let end = parse_port(end)?;
            let (start, end) = crate::validators::validate_port_range(start, end)?;
            if start == end {
                Ok(Self::Single(start))
            } else {
                Ok(Self::Range(start, end))
            }
        } else {
            Ok(Self::Single(parse_port(s)?))
        }
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port = s
        .parse::<u16>()
        .map_err(|_| format!("'{s}' is not a port number (1-65535)"))?;
    crate::validators::validate_port(port)
}

/// DNAT target address: IPv4 host with an optional port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Host(Ipv4Addr),
    HostPort(SocketAddrV4),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(ip) => write!(f, "{ip}"),
            Self::HostPort(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddrV4>() {
            crate::validators::validate_port(addr.port())?;
            return Ok(Self::HostPort(addr));
        }
        s.parse::<Ipv4Addr>()
            .map(Self::Host)
            .map_err(|_| format!("'{s}' is not an IPv4 address or address:port"))
    }
}

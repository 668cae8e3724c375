use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;

use bandmon_ebpf_common::{DIRECTION_RX, DIRECTION_TX, PROTO_TCP, PROTO_UDP};

/// Transport protocol of a flow bucket or persisted record.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Decode the on-the-wire map encoding (0 = TCP, 1 = UDP).
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            PROTO_TCP => Some(Self::Tcp),
            PROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Traffic direction relative to the local process.
#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            DIRECTION_TX => Some(Self::Tx),
            DIRECTION_RX => Some(Self::Rx),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
        }
    }
}

/// Render a remote address as read from the kernel (a big-endian IPv4 word)
/// in dotted form. Zero is the "address unavailable" sentinel, shown as
/// 0.0.0.0 like the probe writes it for non-IPv4 socket families.
pub fn format_remote_ip(raw: u32) -> String {
    Ipv4Addr::from(raw.to_le_bytes()).to_string()
}

/// Decode a process name captured by `bpf_get_current_comm`: NUL-terminated,
/// at most 16 bytes, possibly with invalid UTF-8 replaced.
pub fn comm_to_string(comm: &[u8; 16]) -> String {
    let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..len]).into_owned()
}

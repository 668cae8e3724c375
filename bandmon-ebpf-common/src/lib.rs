//! Shared data structures between the eBPF kernel program and userspace.
//!
//! These types must be `#[repr(C)]` so that both sides agree on the exact
//! byte layout of map keys and values.

#![no_std]

/// Key for the flow counter map: one accounting bucket per
/// (process, remote IPv4 address, protocol, direction) within a drain
/// interval. The table is cleared on every drain, so keys are only unique
/// inside one interval.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Process ID (kernel tgid).
    pub pid: u32,
    /// Remote IPv4 address in network byte order; 0 when the socket
    /// family is not AF_INET.
    pub remote_ip: u32,
    /// 0 = TCP, 1 = UDP.
    pub protocol: u16,
    /// 0 = TX (send path), 1 = RX (receive path).
    pub direction: u16,
}

/// Value for the flow counter map. Counters increase monotonically between
/// drains; the sampler removes the key after reading, so values are always
/// deltas relative to the previous drain, never lifetime totals.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FlowCounter {
    /// Bytes observed since the key was inserted.
    pub bytes: u64,
    /// Number of send/recv calls since the key was inserted.
    pub packets: u64,
    /// `bpf_ktime_get_ns()` of the most recent update.
    pub last_update_ns: u64,
    /// Process name (comm) captured at the first write for this key.
    pub comm: [u8; 16],
}

/// Maximum number of entries in the flow counter map.
///
/// ~2048 processes x 2 protocols x 2 directions x 2 remotes of headroom.
/// Each entry is 12 bytes (key) + 40 bytes (value); worst case ~832 KB.
pub const FLOW_MAP_MAX_ENTRIES: u32 = 16384;

/// Name of the flow counter map, as userspace looks it up.
pub const FLOW_MAP_NAME: &str = "FLOW_COUNTERS";

/// Protocol constants for FlowKey.protocol.
pub const PROTO_TCP: u16 = 0;
pub const PROTO_UDP: u16 = 1;

/// Direction constants for FlowKey.direction.
pub const DIRECTION_TX: u16 = 0;
pub const DIRECTION_RX: u16 = 1;

// Compile-time size assertions to catch layout mismatches early.
const _: () = assert!(core::mem::size_of::<FlowKey>() == 12);
const _: () = assert!(core::mem::size_of::<FlowCounter>() == 40);

#[cfg(feature = "user")]
unsafe impl aya::Pod for FlowKey {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FlowCounter {}

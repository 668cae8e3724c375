//! bandmon eBPF kernel program — kprobe-based per-flow traffic accounting.
//!
//! Attaches kprobes to tcp_sendmsg, tcp_recvmsg, udp_sendmsg, udp_recvmsg
//! and accumulates bytes/packets per (pid, remote IPv4, protocol, direction)
//! in a hash map that userspace drains once per sampling interval.
//!
//! This program is read-only: it does NOT modify any kernel state, packet
//! content, or socket behavior. It only reads process context, the socket's
//! remote address, and byte counts.
//!
//! Safety invariants:
//! - All map operations check return values
//! - No loops (eBPF verifier enforced)
//! - No pointer arithmetic outside of helper-provided reads
//! - Stack usage kept well under the 512-byte limit
//!
//! This crate is NOT compiled by the standard `cargo build`. It requires a
//! separate cross-compilation step:
//!   cargo +nightly build -Z build-std=core \
//!       --target bpfel-unknown-none --release

#![no_std]
#![no_main]

use aya_ebpf::helpers::{
    bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
};
use aya_ebpf::macros::{kprobe, map};
use aya_ebpf::maps::HashMap;
use aya_ebpf::programs::ProbeContext;

use bandmon_ebpf_common::{
    FlowCounter, FlowKey, DIRECTION_RX, DIRECTION_TX, FLOW_MAP_MAX_ENTRIES, PROTO_TCP, PROTO_UDP,
};

/// Per-(pid, remote, protocol, direction) counter table.
///
/// A plain (shared) hash map: concurrent increments to the same key from
/// different CPUs may rarely lose an update, which the accounting contract
/// accepts. Userspace enumerates and removes entries each drain cycle, so
/// values are deltas since the previous drain.
#[map]
static FLOW_COUNTERS: HashMap<FlowKey, FlowCounter> =
    HashMap::with_max_entries(FLOW_MAP_MAX_ENTRIES, 0);

// struct sock embeds struct sock_common at offset 0. Within sock_common,
// skc_daddr is the first field and skc_family sits after the addr/hash/port
// unions. Fixed offsets instead of CO-RE: these unions have had a stable
// layout since long before the 5.8 kernels bandmon requires.
const SKC_DADDR_OFFSET: u64 = 0;
const SKC_FAMILY_OFFSET: u64 = 16;
const AF_INET: u16 = 2;

// ---------------------------------------------------------------------------
// TCP kprobes
// ---------------------------------------------------------------------------

/// kprobe on tcp_sendmsg — outbound TCP bytes.
///
/// Signature: int tcp_sendmsg(struct sock *sk, struct msghdr *msg, size_t size)
#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_record(&ctx, PROTO_TCP, DIRECTION_TX) {
        Ok(()) => 0,
        Err(_) => 0, // Always return 0 — never disrupt the probed function
    }
}

/// kprobe on tcp_recvmsg — inbound TCP bytes.
///
/// Signature: int tcp_recvmsg(struct sock *sk, struct msghdr *msg, size_t len,
///                            int flags, int *addr_len)
/// The requested length (arg 2) is recorded, matching the send side.
#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_record(&ctx, PROTO_TCP, DIRECTION_RX) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// UDP kprobes
// ---------------------------------------------------------------------------

/// kprobe on udp_sendmsg — outbound UDP bytes.
#[kprobe]
pub fn udp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_record(&ctx, PROTO_UDP, DIRECTION_TX) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

/// kprobe on udp_recvmsg — inbound UDP bytes.
#[kprobe]
pub fn udp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_record(&ctx, PROTO_UDP, DIRECTION_RX) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Remote IPv4 address of the socket, or 0 for non-AF_INET families.
///
/// All four probed functions take `struct sock *sk` as their first argument.
fn remote_ipv4(ctx: &ProbeContext) -> u32 {
    let sk: u64 = match ctx.arg(0) {
        Some(p) if p != 0u64 => p,
        _ => return 0,
    };

    let family: u16 =
        match unsafe { bpf_probe_read_kernel((sk + SKC_FAMILY_OFFSET) as *const u16) } {
            Ok(f) => f,
            Err(_) => return 0,
        };
    if family != AF_INET {
        return 0;
    }

    unsafe { bpf_probe_read_kernel((sk + SKC_DADDR_OFFSET) as *const u32) }.unwrap_or(0)
}

/// Core accounting path shared by all four kprobes: derive the flow key for
/// the current process and the probed socket, then lookup-or-init the
/// counter and add the transfer size plus one packet.
#[inline(always)]
fn try_record(ctx: &ProbeContext, protocol: u16, direction: u16) -> Result<(), i64> {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;

    // Skip kernel threads.
    if pid == 0 {
        return Ok(());
    }

    // Transfer length: size_t argument at index 2 for all four functions.
    let bytes: u64 = ctx.arg(2).ok_or(1i64)?;

    let key = FlowKey {
        pid,
        remote_ip: remote_ipv4(ctx),
        protocol,
        direction,
    };

    let now = unsafe { bpf_ktime_get_ns() };

    // Lookup-or-init with in-place increment. A concurrent update to the
    // exact same key may lose one increment; accepted by contract.
    unsafe {
        if let Some(counter) = FLOW_COUNTERS.get_ptr_mut(&key) {
            (*counter).bytes += bytes;
            (*counter).packets += 1;
            (*counter).last_update_ns = now;
        } else {
            let counter = FlowCounter {
                bytes,
                packets: 1,
                last_update_ns: now,
                comm: bpf_get_current_comm().unwrap_or([0u8; 16]),
            };
            let _ = FLOW_COUNTERS.insert(&key, &counter, 0);
        }
    }

    Ok(())
}

// Required by aya-ebpf for panic handling in no_std.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

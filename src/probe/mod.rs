// Kernel probe support: availability detection plus the loader that attaches
// the kprobes and owns the counter map.
//
// Requires: Linux kernel 5.8+, BTF enabled, root.

use std::path::Path;

#[cfg(feature = "ebpf")]
mod loader;
#[cfg(feature = "ebpf")]
pub use loader::{load, CounterTable, ProbeSet};

/// Check whether the running kernel can host the probes.
///
/// Requirements:
/// 1. Kernel version >= 5.8 (CAP_BPF, mature BTF)
/// 2. BTF type information available (/sys/kernel/btf/vmlinux)
///
/// Both conditions are required to avoid subtle runtime failures on
/// partially-supported kernels.
pub fn probes_available() -> bool {
    if !kernel_version_sufficient() {
        log::debug!("probe: kernel version < 5.8, not available");
        return false;
    }

    if !btf_available() {
        log::debug!("probe: BTF not available (/sys/kernel/btf/vmlinux missing)");
        return false;
    }

    log::debug!("probe: kernel and BTF checks passed");
    true
}

/// Parse the kernel version from /proc/version and check >= 5.8.
fn kernel_version_sufficient() -> bool {
    let version = match std::fs::read_to_string("/proc/version") {
        Ok(v) => v,
        Err(_) => return false,
    };

    parse_kernel_version(&version)
        .map(|(major, minor)| major > 5 || (major == 5 && minor >= 8))
        .unwrap_or(false)
}

/// Extract (major, minor) from a `/proc/version` string.
///
/// Anchors on the "version" keyword rather than a fixed token position, so
/// strings like `"Linux (compiled by user.name) version 5.15.0"` parse too.
fn parse_kernel_version(version_str: &str) -> Option<(u32, u32)> {
    let mut tokens = version_str.split_whitespace();
    tokens.find(|t| t.eq_ignore_ascii_case("version"))?;

    let mut parts = tokens.next()?.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    // Minor might be "8" or "8-arch1"; parse only the numeric prefix.
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;

    Some((major, minor))
}

/// Check if BTF (BPF Type Format) info is available for the running kernel.
fn btf_available() -> bool {
    Path::new("/sys/kernel/btf/vmlinux").exists()
}

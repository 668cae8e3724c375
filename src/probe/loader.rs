// Loads the compiled probe object, attaches the four kprobes, and exposes
// the kernel counter map as a drainable table.

use std::path::Path;

use aya::maps::{HashMap as FlowMap, MapData};
use aya::programs::KProbe;
use aya::Ebpf;
use bandmon_ebpf_common::{FlowCounter, FlowKey, FLOW_MAP_NAME};

use crate::error::BandmonError;
use crate::sampler::DrainSource;

/// Kernel functions the probe object hooks. Program names in the object
/// match the target function names.
const KPROBE_TARGETS: [&str; 4] = ["tcp_sendmsg", "tcp_recvmsg", "udp_sendmsg", "udp_recvmsg"];

/// Owns the loaded object and its attached programs. Dropping this detaches
/// the kprobes.
pub struct ProbeSet {
    _ebpf: Ebpf,
}

/// Userspace handle to the kernel flow counter map.
pub struct CounterTable {
    map: FlowMap<MapData, FlowKey, FlowCounter>,
}

/// Load the probe object from `path` and attach all four kprobes. Any
/// attach failure is fatal: partial attachment would silently undercount
/// one direction or protocol.
pub fn load(path: &Path) -> Result<(ProbeSet, CounterTable), BandmonError> {
    bump_memlock_rlimit();

    let mut ebpf = Ebpf::load_file(path)
        .map_err(|e| BandmonError::Attach(format!("load {}: {e}", path.display())))?;

    for target in KPROBE_TARGETS {
        let program: &mut KProbe = ebpf
            .program_mut(target)
            .ok_or_else(|| BandmonError::Attach(format!("program {target} not found in object")))?
            .try_into()
            .map_err(|e| BandmonError::Attach(format!("{target}: {e}")))?;
        program
            .load()
            .map_err(|e| BandmonError::Attach(format!("load {target}: {e}")))?;
        program
            .attach(target, 0)
            .map_err(|e| BandmonError::Attach(format!("attach {target}: {e}")))?;
        log::debug!("attached kprobe {target}");
    }

    let map = ebpf
        .take_map(FLOW_MAP_NAME)
        .ok_or_else(|| BandmonError::CounterTable(format!("map {FLOW_MAP_NAME} not found")))?;
    let map: FlowMap<MapData, FlowKey, FlowCounter> = FlowMap::try_from(map)
        .map_err(|e| BandmonError::CounterTable(format!("map {FLOW_MAP_NAME}: {e}")))?;

    log::info!("attached {} kprobes", KPROBE_TARGETS.len());
    Ok((ProbeSet { _ebpf: ebpf }, CounterTable { map }))
}

impl DrainSource for CounterTable {
    /// Snapshot all entries, then delete their keys. A flow can land bytes
    /// between the snapshot and the delete; that sliver is lost, which the
    /// accounting accepts in exchange for never double-counting.
    fn drain(&mut self) -> Result<Vec<(FlowKey, FlowCounter)>, BandmonError> {
        let mut entries = Vec::new();
        for entry in self.map.iter() {
            let (key, value) =
                entry.map_err(|e| BandmonError::CounterTable(format!("map iterate: {e}")))?;
            entries.push((key, value));
        }

        for (key, _) in &entries {
            // The key may already be gone if the kernel side recycled it.
            if let Err(e) = self.map.remove(key) {
                log::debug!("map remove: {e}");
            }
        }

        Ok(entries)
    }
}

/// Lift RLIMIT_MEMLOCK so older kernels (< 5.11, pre memcg BPF accounting)
/// can charge the map allocations. Failure is non-fatal; load will surface
/// the real error if the limit actually blocks us.
fn bump_memlock_rlimit() {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        log::warn!("failed to raise RLIMIT_MEMLOCK, map creation may fail");
    }
}

// Sampling loop: drain the kernel counter table on a fixed tick, turn the
// drained per-flow deltas into per-process aggregates, persist one row per
// (pid, remote, protocol), and print a live console table.
//
// Draining clears the kernel map, so every drained counter is already the
// delta since the previous tick. Only intervals with observed traffic write
// rows; idle intervals write nothing.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bandmon_ebpf_common::{FlowCounter, FlowKey};
use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick};

use crate::error::BandmonError;
use crate::model::{comm_to_string, format_remote_ip, Direction, Protocol};
use crate::storage::{BandwidthStore, DeltaRecord};

/// Retention sweeps run at startup and then on this cadence.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Anything that can hand over the accumulated per-flow counters and reset
/// them. The eBPF counter table implements this; tests drive the loop with
/// scripted snapshots.
pub trait DrainSource {
    fn drain(&mut self) -> Result<Vec<(FlowKey, FlowCounter)>, BandmonError>;
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub top: usize,
    pub quiet: bool,
    pub retention_days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Interval aggregation
// ---------------------------------------------------------------------------

/// Per-remote byte counts inside one process's interval. Kept in first-seen
/// order so persisted rows follow drain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTotals {
    pub remote_ip: u32,
    pub protocol: Protocol,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTotals {
    pub name: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tcp_tx: u64,
    pub tcp_rx: u64,
    pub udp_tx: u64,
    pub udp_rx: u64,
    pub remotes: Vec<RemoteTotals>,
}

impl ProcessTotals {
    pub fn total_bytes(&self) -> u64 {
        self.tx_bytes + self.rx_bytes
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntervalAggregate {
    pub processes: HashMap<u32, ProcessTotals>,
    /// Pids in first-seen drain order; table ranking ties resolve to this.
    order: Vec<u32>,
}

impl IntervalAggregate {
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// (pid, totals) pairs in first-seen drain order.
    fn in_drain_order(&self) -> impl Iterator<Item = (u32, &ProcessTotals)> {
        self.order.iter().map(|pid| (*pid, &self.processes[pid]))
    }
}

/// Fold drained flow entries into per-process totals with per-remote
/// sub-totals. Entries carrying a protocol value the userspace side does not
/// know are dropped with a log line rather than poisoning the batch.
pub fn aggregate(entries: &[(FlowKey, FlowCounter)]) -> IntervalAggregate {
    let mut agg = IntervalAggregate::default();

    for (key, counter) in entries {
        let Some(protocol) = Protocol::from_raw(key.protocol) else {
            log::debug!("dropping flow entry with unknown protocol {}", key.protocol);
            continue;
        };
        let Some(direction) = Direction::from_raw(key.direction) else {
            log::debug!("dropping flow entry with unknown direction {}", key.direction);
            continue;
        };
        let is_tx = direction == Direction::Tx;

        let process = match agg.processes.entry(key.pid) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                agg.order.push(key.pid);
                e.insert(ProcessTotals::default())
            }
        };
        if process.name.is_empty() {
            process.name = comm_to_string(&counter.comm);
        }

        if is_tx {
            process.tx_bytes += counter.bytes;
            process.tx_packets += counter.packets;
        } else {
            process.rx_bytes += counter.bytes;
            process.rx_packets += counter.packets;
        }
        match (protocol, is_tx) {
            (Protocol::Tcp, true) => process.tcp_tx += counter.bytes,
            (Protocol::Tcp, false) => process.tcp_rx += counter.bytes,
            (Protocol::Udp, true) => process.udp_tx += counter.bytes,
            (Protocol::Udp, false) => process.udp_rx += counter.bytes,
        }

        match process
            .remotes
            .iter_mut()
            .find(|r| r.remote_ip == key.remote_ip && r.protocol == protocol)
        {
            Some(remote) => {
                if is_tx {
                    remote.tx_bytes += counter.bytes;
                } else {
                    remote.rx_bytes += counter.bytes;
                }
            }
            None => {
                let (tx, rx) = if is_tx {
                    (counter.bytes, 0)
                } else {
                    (0, counter.bytes)
                };
                process.remotes.push(RemoteTotals {
                    remote_ip: key.remote_ip,
                    protocol,
                    tx_bytes: tx,
                    rx_bytes: rx,
                });
            }
        }
    }

    agg
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Write one row per (pid, remote, protocol) for the interval, all tagged
/// with the timestamp captured at the top of the iteration. A failed insert
/// is logged and the rest of the batch still goes through.
fn persist_interval(
    store: &BandwidthStore,
    agg: &IntervalAggregate,
    timestamp: DateTime<Utc>,
) -> usize {
    let mut written = 0;

    for (pid, process) in agg.in_drain_order() {
        for remote in &process.remotes {
            // Absence means zero: a triple with no bytes in either direction
            // writes no row.
            if remote.tx_bytes == 0 && remote.rx_bytes == 0 {
                continue;
            }
            let ip = format_remote_ip(remote.remote_ip);
            let record = DeltaRecord {
                timestamp,
                pid,
                process_name: &process.name,
                tx_bytes: remote.tx_bytes,
                rx_bytes: remote.rx_bytes,
                protocol: remote.protocol,
                remote_ip: &ip,
            };
            match store.insert_record(&record) {
                Ok(()) => written += 1,
                Err(e) => log::warn!("failed to persist record for pid {pid}: {e}"),
            }
        }
    }

    written
}

// ---------------------------------------------------------------------------
// Console table
// ---------------------------------------------------------------------------

/// Write the per-process table for one interval in traffic-descending order.
pub fn write_interval_table(
    agg: &IntervalAggregate,
    interval_secs: f64,
    top: usize,
    w: &mut impl Write,
) -> Result<(), std::io::Error> {
    // Stable sort over first-seen order: equal totals keep drain order.
    let mut entries: Vec<_> = agg.in_drain_order().collect();
    entries.sort_by(|a, b| b.1.total_bytes().cmp(&a.1.total_bytes()));

    writeln!(
        w,
        "{}  Per-Process Bandwidth",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(w, "{}", "=".repeat(100))?;
    writeln!(
        w,
        "{:<8} {:<20} {:>11} {:>11} {:>10} {:>10} {:>10} {:>10} {:>6}",
        "PID", "PROCESS", "TX/s", "RX/s", "TCP TX", "TCP RX", "UDP TX", "UDP RX", "IPS"
    )?;
    writeln!(w, "{}", "-".repeat(100))?;

    for (pid, process) in entries.iter().take(top) {
        writeln!(
            w,
            "{:<8} {:<20} {:>11} {:>11} {:>10} {:>10} {:>10} {:>10} {:>6}",
            pid,
            truncate(&process.name, 20),
            format_rate(process.tx_bytes, interval_secs),
            format_rate(process.rx_bytes, interval_secs),
            format_bytes(process.tcp_tx),
            format_bytes(process.tcp_rx),
            format_bytes(process.udp_tx),
            format_bytes(process.udp_rx),
            process.remotes.len(),
        )?;
    }

    if entries.is_empty() {
        writeln!(w, "(no traffic this interval)")?;
    }

    Ok(())
}

fn format_rate(bytes: u64, interval_secs: f64) -> String {
    let per_sec = if interval_secs > 0.0 {
        bytes as f64 / interval_secs
    } else {
        0.0
    };
    format!("{}/s", format_bytes(per_sec as u64))
}

pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1 << 50 {
        format!("{:.1} PiB", bytes as f64 / (1u64 << 50) as f64)
    } else if bytes >= 1 << 40 {
        format!("{:.1} TiB", bytes as f64 / (1u64 << 40) as f64)
    } else if bytes >= 1 << 30 {
        format!("{:.1} GiB", bytes as f64 / (1u64 << 30) as f64)
    } else if bytes >= 1 << 20 {
        format!("{:.1} MiB", bytes as f64 / (1u64 << 20) as f64)
    } else if bytes >= 1 << 10 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

// Truncate by characters, not bytes: a comm is arbitrary kernel bytes, and
// lossy decoding turns each invalid byte into a 3-byte U+FFFD that a byte
// slice could split mid-character.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{head}...")
    }
}

// ---------------------------------------------------------------------------
// Sampling loop
// ---------------------------------------------------------------------------

/// Run the tick loop until `stop` is set. Each tick drains the source,
/// persists the interval, and prints the table. A drain failure skips the
/// iteration; a later shutdown still performs one final drain so counters
/// accumulated since the last tick are not lost.
pub fn run<S: DrainSource>(
    source: &mut S,
    store: &BandwidthStore,
    cfg: &SamplerConfig,
    stop: &AtomicBool,
) -> Result<(), BandmonError> {
    let interval_secs = cfg.interval.as_secs_f64();
    let ticker = tick(cfg.interval);
    let mut last_sweep = None;

    if cfg.retention_days.is_some() {
        run_retention_sweep(store, cfg, &mut last_sweep);
    }

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        // Wake on tick, or after 500ms to re-check the stop flag.
        select! {
            recv(ticker) -> _ => {},
            default(Duration::from_millis(500)) => continue,
        }

        sample_once(source, store, cfg, interval_secs);

        if let Some(last) = last_sweep {
            if Instant::now().duration_since(last) >= RETENTION_SWEEP_INTERVAL {
                run_retention_sweep(store, cfg, &mut last_sweep);
            }
        }
    }

    // Final drain on shutdown: persist whatever accumulated since the last
    // tick before the process exits.
    sample_once(source, store, cfg, interval_secs);
    Ok(())
}

fn sample_once<S: DrainSource>(
    source: &mut S,
    store: &BandwidthStore,
    cfg: &SamplerConfig,
    interval_secs: f64,
) {
    // Rows carry the wall-clock time at the top of the iteration, not the
    // time the store got around to them.
    let iteration_start = Utc::now();

    let entries = match source.drain() {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("counter table drain failed, skipping interval: {e}");
            return;
        }
    };

    let agg = aggregate(&entries);
    if agg.is_empty() {
        return;
    }

    let written = persist_interval(store, &agg, iteration_start);
    log::debug!(
        "interval: {} flows, {} processes, {} rows written",
        entries.len(),
        agg.processes.len(),
        written
    );

    if !cfg.quiet {
        let stdout = std::io::stdout();
        if let Err(e) = write_interval_table(&agg, interval_secs, cfg.top, &mut stdout.lock()) {
            log::warn!("failed to write console table: {e}");
        }
    }
}

/// Delete rows past the retention horizon. Failures are logged and the
/// sampler keeps running; retention is housekeeping, not a hard dependency.
fn run_retention_sweep(store: &BandwidthStore, cfg: &SamplerConfig, last_sweep: &mut Option<Instant>) {
    let Some(days) = cfg.retention_days else {
        return;
    };
    *last_sweep = Some(Instant::now());
    match store.cleanup(days) {
        Ok(deleted) => {
            if deleted > 0 {
                log::info!("retention sweep removed {deleted} rows older than {days} days");
            }
        }
        Err(e) => log::warn!("retention sweep failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use bandmon_ebpf_common::{DIRECTION_RX, DIRECTION_TX, PROTO_TCP, PROTO_UDP};

    fn comm(name: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let bytes = name.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    fn flow(
        pid: u32,
        ip: u32,
        protocol: u16,
        direction: u16,
        bytes: u64,
        packets: u64,
        name: &str,
    ) -> (FlowKey, FlowCounter) {
        (
            FlowKey {
                pid,
                remote_ip: ip,
                protocol,
                direction,
            },
            FlowCounter {
                bytes,
                packets,
                last_update_ns: 0,
                comm: comm(name),
            },
        )
    }

    #[test]
    fn aggregate_merges_flows_per_process() {
        let entries = vec![
            flow(100, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 1000, 4, "firefox"),
            flow(100, 0x0101_0101, PROTO_TCP, DIRECTION_RX, 5000, 9, "firefox"),
            flow(100, 0x0202_0202, PROTO_UDP, DIRECTION_TX, 300, 2, "firefox"),
            flow(200, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 50, 1, "curl"),
        ];

        let agg = aggregate(&entries);
        assert_eq!(agg.processes.len(), 2);

        let firefox = &agg.processes[&100];
        assert_eq!(firefox.name, "firefox");
        assert_eq!(firefox.tx_bytes, 1300);
        assert_eq!(firefox.rx_bytes, 5000);
        assert_eq!(firefox.tx_packets, 6);
        assert_eq!(firefox.rx_packets, 9);
        assert_eq!(firefox.tcp_tx, 1000);
        assert_eq!(firefox.tcp_rx, 5000);
        assert_eq!(firefox.udp_tx, 300);
        assert_eq!(firefox.udp_rx, 0);

        let curl = &agg.processes[&200];
        assert_eq!(curl.name, "curl");
        assert_eq!(curl.total_bytes(), 50);
    }

    #[test]
    fn aggregate_keeps_remotes_in_first_seen_order() {
        let entries = vec![
            flow(1, 0x0303_0303, PROTO_TCP, DIRECTION_TX, 10, 1, "ssh"),
            flow(1, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 20, 1, "ssh"),
            flow(1, 0x0303_0303, PROTO_TCP, DIRECTION_RX, 30, 1, "ssh"),
        ];

        let agg = aggregate(&entries);
        let remotes = &agg.processes[&1].remotes;
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[0].remote_ip, 0x0303_0303);
        assert_eq!(remotes[0].tx_bytes, 10);
        assert_eq!(remotes[0].rx_bytes, 30);
        assert_eq!(remotes[1].remote_ip, 0x0101_0101);
    }

    #[test]
    fn aggregate_separates_protocols_per_remote() {
        let entries = vec![
            flow(1, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 100, 1, "dig"),
            flow(1, 0x0101_0101, PROTO_UDP, DIRECTION_TX, 200, 1, "dig"),
        ];

        let agg = aggregate(&entries);
        let remotes = &agg.processes[&1].remotes;
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[0].protocol, Protocol::Tcp);
        assert_eq!(remotes[1].protocol, Protocol::Udp);
    }

    #[test]
    fn aggregate_drops_unknown_protocol_entries() {
        let entries = vec![
            flow(1, 0x0101_0101, 99, DIRECTION_TX, 100, 1, "weird"),
            flow(2, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 100, 1, "curl"),
        ];

        let agg = aggregate(&entries);
        assert_eq!(agg.processes.len(), 1);
        assert!(agg.processes.contains_key(&2));
    }

    #[test]
    fn table_sorted_by_total_and_capped() {
        let entries = vec![
            flow(1, 1, PROTO_TCP, DIRECTION_TX, 100, 1, "small"),
            flow(2, 1, PROTO_TCP, DIRECTION_TX, 9000, 1, "big"),
            flow(3, 1, PROTO_TCP, DIRECTION_TX, 500, 1, "mid"),
        ];
        let agg = aggregate(&entries);

        let mut buf = Vec::new();
        write_interval_table(&agg, 1.0, 2, &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();

        let pos_big = output.find("big").unwrap();
        let pos_mid = output.find("mid").unwrap();
        assert!(pos_big < pos_mid);
        // Capped at top 2: the smallest process is not shown.
        assert!(!output.contains("small"));
    }

    #[test]
    fn table_ties_keep_drain_order() {
        let entries = vec![
            flow(7, 1, PROTO_TCP, DIRECTION_TX, 500, 1, "first"),
            flow(3, 1, PROTO_TCP, DIRECTION_TX, 500, 1, "second"),
            flow(9, 1, PROTO_TCP, DIRECTION_TX, 500, 1, "third"),
        ];
        let agg = aggregate(&entries);

        let mut buf = Vec::new();
        write_interval_table(&agg, 1.0, 20, &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();

        let pos_first = output.find("first").unwrap();
        let pos_second = output.find("second").unwrap();
        let pos_third = output.find("third").unwrap();
        assert!(pos_first < pos_second && pos_second < pos_third);
    }

    #[test]
    fn zero_byte_triples_write_no_rows() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource {
            snapshots: VecDeque::from(vec![vec![
                flow(1, 1, PROTO_TCP, DIRECTION_TX, 0, 1, "idle"),
                flow(2, 1, PROTO_TCP, DIRECTION_TX, 100, 1, "busy"),
            ]]),
            stop: Arc::clone(&stop),
        };
        let store = BandwidthStore::open_in_memory().unwrap();
        let cfg = SamplerConfig {
            interval: Duration::from_millis(10),
            top: 20,
            quiet: true,
            retention_days: None,
        };

        run(&mut source, &store, &cfg, &stop).unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn table_empty_interval() {
        let agg = IntervalAggregate::default();
        let mut buf = Vec::new();
        write_interval_table(&agg, 1.0, 20, &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("(no traffic this interval)"));
    }

    // A comm is raw kernel bytes and need not be UTF-8; rendering must not
    // panic on the replacement characters the lossy decode produces.
    #[test]
    fn table_renders_non_utf8_comm() {
        let entries = vec![(
            FlowKey {
                pid: 1,
                remote_ip: 1,
                protocol: PROTO_TCP,
                direction: DIRECTION_TX,
            },
            FlowCounter {
                bytes: 100,
                packets: 1,
                last_update_ns: 0,
                comm: [0xFF; 16],
            },
        )];
        let agg = aggregate(&entries);

        let mut buf = Vec::new();
        write_interval_table(&agg, 1.0, 20, &mut buf).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains('\u{FFFD}'));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // 16 replacement chars = 48 bytes; within the char limit, unchanged.
        let wide = "\u{FFFD}".repeat(16);
        assert_eq!(truncate(&wide, 20), wide);

        let wider = "\u{FFFD}".repeat(25);
        let cut = truncate(&wider, 20);
        assert_eq!(cut.chars().count(), 20);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1 << 20), "1.0 MiB");
        assert_eq!(format_bytes(1 << 30), "1.0 GiB");
        assert_eq!(format_bytes(1 << 40), "1.0 TiB");
        assert_eq!(format_bytes(1 << 50), "1.0 PiB");
    }

    /// Serves scripted snapshots, then sets the stop flag so the loop winds
    /// down on its own.
    struct ScriptedSource {
        snapshots: VecDeque<Vec<(FlowKey, FlowCounter)>>,
        stop: Arc<AtomicBool>,
    }

    impl DrainSource for ScriptedSource {
        fn drain(&mut self) -> Result<Vec<(FlowKey, FlowCounter)>, BandmonError> {
            match self.snapshots.pop_front() {
                Some(batch) => Ok(batch),
                None => {
                    self.stop.store(true, Ordering::Relaxed);
                    Ok(Vec::new())
                }
            }
        }
    }

    #[test]
    fn run_persists_drained_intervals() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource {
            snapshots: VecDeque::from(vec![
                vec![
                    flow(1, 0x0101_0101, PROTO_TCP, DIRECTION_TX, 1000, 2, "firefox"),
                    flow(1, 0x0101_0101, PROTO_TCP, DIRECTION_RX, 2000, 3, "firefox"),
                ],
                vec![flow(2, 0x0808_0808, PROTO_UDP, DIRECTION_TX, 64, 1, "dig")],
            ]),
            stop: Arc::clone(&stop),
        };
        let store = BandwidthStore::open_in_memory().unwrap();
        let cfg = SamplerConfig {
            interval: Duration::from_millis(10),
            top: 20,
            quiet: true,
            retention_days: None,
        };

        run(&mut source, &store, &cfg, &stop).unwrap();

        // One row per (pid, remote, protocol): firefox tx+rx collapse into
        // a single remote row, dig adds one more.
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn run_skips_failed_drains() {
        struct FailOnce {
            calls: u32,
            stop: Arc<AtomicBool>,
        }
        impl DrainSource for FailOnce {
            fn drain(&mut self) -> Result<Vec<(FlowKey, FlowCounter)>, BandmonError> {
                self.calls += 1;
                match self.calls {
                    1 => Err(BandmonError::CounterTable("map read failed".to_string())),
                    2 => Ok(vec![flow(1, 1, PROTO_TCP, DIRECTION_TX, 100, 1, "curl")]),
                    _ => {
                        self.stop.store(true, Ordering::Relaxed);
                        Ok(Vec::new())
                    }
                }
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut source = FailOnce {
            calls: 0,
            stop: Arc::clone(&stop),
        };
        let store = BandwidthStore::open_in_memory().unwrap();
        let cfg = SamplerConfig {
            interval: Duration::from_millis(10),
            top: 20,
            quiet: true,
            retention_days: None,
        };

        run(&mut source, &store, &cfg, &stop).unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
    }

    // Rows are stamped with the time at the top of the iteration, before
    // the drain runs, not when the insert happens.
    #[test]
    fn rows_are_stamped_before_the_drain() {
        struct SlowSource {
            drained_at: Option<DateTime<Utc>>,
            stop: Arc<AtomicBool>,
        }
        impl DrainSource for SlowSource {
            fn drain(&mut self) -> Result<Vec<(FlowKey, FlowCounter)>, BandmonError> {
                if self.drained_at.is_none() {
                    std::thread::sleep(Duration::from_millis(50));
                    self.drained_at = Some(Utc::now());
                    Ok(vec![flow(1, 1, PROTO_TCP, DIRECTION_TX, 100, 1, "curl")])
                } else {
                    self.stop.store(true, Ordering::Relaxed);
                    Ok(Vec::new())
                }
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut source = SlowSource {
            drained_at: None,
            stop: Arc::clone(&stop),
        };
        let store = BandwidthStore::open_in_memory().unwrap();
        let cfg = SamplerConfig {
            interval: Duration::from_millis(10),
            top: 20,
            quiet: true,
            retention_days: None,
        };

        run(&mut source, &store, &cfg, &stop).unwrap();

        let stamped: DateTime<Utc> = store
            .conn
            .query_row("SELECT timestamp FROM bandwidth_records", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(stamped < source.drained_at.unwrap());
    }

    #[test]
    fn startup_retention_sweep_removes_expired_rows() {
        let store = BandwidthStore::open_in_memory().unwrap();
        let old = Utc::now() - chrono::Duration::days(30);
        store
            .insert_record(&DeltaRecord {
                timestamp: old,
                pid: 1,
                process_name: "stale",
                tx_bytes: 1,
                rx_bytes: 1,
                protocol: Protocol::Tcp,
                remote_ip: "1.1.1.1",
            })
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource {
            snapshots: VecDeque::new(),
            stop: Arc::clone(&stop),
        };
        let cfg = SamplerConfig {
            interval: Duration::from_millis(10),
            top: 20,
            quiet: true,
            retention_days: Some(7),
        };

        run(&mut source, &store, &cfg, &stop).unwrap();
        assert_eq!(store.record_count().unwrap(), 0);
    }
}

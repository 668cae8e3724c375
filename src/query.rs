// Rate-windowed query engine.
//
// The store holds sparse delta rows: only intervals with observed traffic
// produce rows, so a group's true observation span inside a lookback window
// may be much shorter than the window itself. Every grouped byte sum is
// therefore divided by an elapsed-time estimate
//
//     max(last_row_ts - first_row_ts, window_seconds)
//
// The nominal window acts as a floor (a tight cluster of rows near "now"
// must not read as an inflated rate) but not as a ceiling (a group whose
// rows genuinely span more than the window, e.g. under clock skew, divides
// by its true span).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::error::BandmonError;
use crate::model::Protocol;
use crate::storage::BandwidthStore;

/// A lookback window ending at "now".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    secs: u64,
}

impl Window {
    pub const fn hours(hours: u64) -> Self {
        Self { secs: hours * 3600 }
    }

    pub const fn minutes(minutes: u64) -> Self {
        Self { secs: minutes * 60 }
    }

    pub const fn seconds(secs: u64) -> Self {
        Self { secs }
    }

    pub const fn as_secs(&self) -> u64 {
        self.secs
    }

    /// Window length in seconds, rejecting degenerate zero-length windows.
    fn checked_secs(&self) -> Result<f64, BandmonError> {
        if self.secs == 0 {
            return Err(BandmonError::InvalidQuery(
                "window must be at least one second".to_string(),
            ));
        }
        Ok(self.secs as f64)
    }

    fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::seconds(self.secs as i64)
    }
}

/// Unfiltered IP breakdowns are capped at this many remotes.
const IP_BREAKDOWN_CAP: u32 = 20;

// ---------------------------------------------------------------------------
// Result types — one explicit shape per query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRates {
    pub process_name: String,
    pub tx_rate: f64,
    pub rx_rate: f64,
    pub total_rate: f64,
    pub record_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolRates {
    pub protocol: Protocol,
    pub tx_rate: f64,
    pub rx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpRates {
    pub remote_ip: String,
    pub process_name: Option<String>,
    pub tx_rate: f64,
    pub rx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub protocol: Protocol,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub tx_rate: f64,
    pub rx_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub process_count: u64,
    pub pid_count: u64,
    pub tx_rate: f64,
    pub rx_rate: f64,
    pub record_count: u64,
}

/// The rate-floor rule: bytes per second over the larger of the group's
/// actual row span and the nominal window length.
fn floored_rate(bytes: u64, span_secs: f64, window_secs: f64) -> f64 {
    bytes as f64 / span_secs.max(window_secs)
}

fn span_secs(first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    (last - first).num_milliseconds() as f64 / 1000.0
}

fn parse_protocol(idx: usize, text: String) -> rusqlite::Result<Protocol> {
    text.parse::<Protocol>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

impl BandwidthStore {
    /// Top processes by total (tx + rx) rate within the window.
    pub fn top_processes(
        &self,
        window: Window,
        limit: u32,
    ) -> Result<Vec<ProcessRates>, BandmonError> {
        let window_secs = window.checked_secs()?;
        if limit == 0 {
            return Err(BandmonError::InvalidQuery(
                "limit must be at least 1".to_string(),
            ));
        }
        let start = window.start(Utc::now());

        let mut stmt = self
            .conn
            .prepare(
                "SELECT process_name,
                        SUM(tx_bytes), SUM(rx_bytes),
                        COUNT(*),
                        MIN(timestamp), MAX(timestamp)
                 FROM bandwidth_records
                 WHERE timestamp >= ?1
                 GROUP BY process_name
                 ORDER BY SUM(tx_bytes + rx_bytes) DESC
                 LIMIT ?2",
            )
            .map_err(BandmonError::Query)?;

        let rows = stmt
            .query_map(params![start, limit], |row| {
                let name: String = row.get(0)?;
                let tx: i64 = row.get(1)?;
                let rx: i64 = row.get(2)?;
                let count: i64 = row.get(3)?;
                let first: DateTime<Utc> = row.get(4)?;
                let last: DateTime<Utc> = row.get(5)?;
                Ok((name, tx as u64, rx as u64, count as u64, first, last))
            })
            .map_err(BandmonError::Query)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(BandmonError::Query)?;

        Ok(rows
            .into_iter()
            .map(|(name, tx, rx, count, first, last)| {
                let span = span_secs(first, last);
                ProcessRates {
                    process_name: name,
                    tx_rate: floored_rate(tx, span, window_secs),
                    rx_rate: floored_rate(rx, span, window_secs),
                    total_rate: floored_rate(tx + rx, span, window_secs),
                    record_count: count,
                }
            })
            .collect())
    }

    /// Per-protocol tx/rx rates within the window. Protocols with no rows
    /// are omitted — absence means zero.
    pub fn protocol_breakdown(&self, window: Window) -> Result<Vec<ProtocolRates>, BandmonError> {
        let window_secs = window.checked_secs()?;
        let start = window.start(Utc::now());

        let mut stmt = self
            .conn
            .prepare(
                "SELECT protocol,
                        SUM(tx_bytes), SUM(rx_bytes),
                        MIN(timestamp), MAX(timestamp)
                 FROM bandwidth_records
                 WHERE timestamp >= ?1
                 GROUP BY protocol
                 ORDER BY protocol",
            )
            .map_err(BandmonError::Query)?;

        let rows = stmt
            .query_map(params![start], |row| {
                let protocol = parse_protocol(0, row.get(0)?)?;
                let tx: i64 = row.get(1)?;
                let rx: i64 = row.get(2)?;
                let first: DateTime<Utc> = row.get(3)?;
                let last: DateTime<Utc> = row.get(4)?;
                Ok((protocol, tx as u64, rx as u64, first, last))
            })
            .map_err(BandmonError::Query)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(BandmonError::Query)?;

        Ok(rows
            .into_iter()
            .map(|(protocol, tx, rx, first, last)| {
                let span = span_secs(first, last);
                ProtocolRates {
                    protocol,
                    tx_rate: floored_rate(tx, span, window_secs),
                    rx_rate: floored_rate(rx, span, window_secs),
                }
            })
            .collect())
    }

    /// Per-remote-IP rates within the window, ranked by total descending.
    /// Without a process filter the result is capped at 20 remotes.
    pub fn ip_breakdown(
        &self,
        process_name: Option<&str>,
        window: Window,
    ) -> Result<Vec<IpRates>, BandmonError> {
        let window_secs = window.checked_secs()?;
        let start = window.start(Utc::now());

        type IpRow = (String, Option<String>, u64, u64, DateTime<Utc>, DateTime<Utc>);
        let rows: Vec<IpRow> = match process_name {
            Some(name) => {
                let mut stmt = self
                    .conn
                    .prepare(
                        "SELECT remote_ip, process_name,
                                SUM(tx_bytes), SUM(rx_bytes),
                                MIN(timestamp), MAX(timestamp)
                         FROM bandwidth_records
                         WHERE timestamp >= ?1 AND process_name = ?2
                         GROUP BY remote_ip, process_name
                         ORDER BY SUM(tx_bytes + rx_bytes) DESC",
                    )
                    .map_err(BandmonError::Query)?;
                // Collect into a local so `stmt` outlives the row iterator.
                let collected = stmt
                    .query_map(params![start, name], |row| {
                        let ip: String = row.get(0)?;
                        let name: String = row.get(1)?;
                        let tx: i64 = row.get(2)?;
                        let rx: i64 = row.get(3)?;
                        Ok((ip, Some(name), tx as u64, rx as u64, row.get(4)?, row.get(5)?))
                    })
                    .map_err(BandmonError::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(BandmonError::Query)?;
                collected
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(
                        "SELECT remote_ip,
                                SUM(tx_bytes), SUM(rx_bytes),
                                MIN(timestamp), MAX(timestamp)
                         FROM bandwidth_records
                         WHERE timestamp >= ?1
                         GROUP BY remote_ip
                         ORDER BY SUM(tx_bytes + rx_bytes) DESC
                         LIMIT ?2",
                    )
                    .map_err(BandmonError::Query)?;
                let collected = stmt
                    .query_map(params![start, IP_BREAKDOWN_CAP], |row| {
                        let ip: String = row.get(0)?;
                        let tx: i64 = row.get(1)?;
                        let rx: i64 = row.get(2)?;
                        Ok((ip, None, tx as u64, rx as u64, row.get(3)?, row.get(4)?))
                    })
                    .map_err(BandmonError::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(BandmonError::Query)?;
                collected
            }
        };

        Ok(rows
            .into_iter()
            .map(|(remote_ip, name, tx, rx, first, last)| {
                let span = span_secs(first, last);
                IpRates {
                    remote_ip,
                    process_name: name,
                    tx_rate: floored_rate(tx, span, window_secs),
                    rx_rate: floored_rate(rx, span, window_secs),
                }
            })
            .collect())
    }

    /// Raw delta rows for one process within the window, newest first.
    pub fn process_history(
        &self,
        process_name: &str,
        window: Window,
    ) -> Result<Vec<HistoryRecord>, BandmonError> {
        window.checked_secs()?;
        let start = window.start(Utc::now());

        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, pid, protocol, tx_bytes, rx_bytes
                 FROM bandwidth_records
                 WHERE process_name = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC",
            )
            .map_err(BandmonError::Query)?;

        let records = stmt
            .query_map(params![process_name, start], |row| {
                Ok(HistoryRecord {
                    timestamp: row.get(0)?,
                    pid: row.get::<_, i64>(1)? as u32,
                    protocol: parse_protocol(2, row.get(2)?)?,
                    tx_bytes: row.get::<_, i64>(3)? as u64,
                    rx_bytes: row.get::<_, i64>(4)? as u64,
                })
            })
            .map_err(BandmonError::Query)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(BandmonError::Query)?;
        Ok(records)
    }

    /// Traffic rates over contiguous fixed-size buckets covering the window.
    ///
    /// The window is partitioned from its start into buckets of `bucket`
    /// length; each row lands in exactly one bucket and each non-empty
    /// bucket's rate is its byte sum divided by the bucket length. Empty
    /// buckets are omitted; no rows at all yields an empty series.
    pub fn time_series(
        &self,
        process_name: Option<&str>,
        window: Window,
        bucket: Duration,
    ) -> Result<Vec<TimeSeriesPoint>, BandmonError> {
        window.checked_secs()?;
        let bucket_secs = bucket.as_secs();
        if bucket_secs == 0 {
            return Err(BandmonError::InvalidQuery(
                "bucket size must be at least one second".to_string(),
            ));
        }
        let now = Utc::now();
        let start = window.start(now);

        type TsRow = (DateTime<Utc>, u64, u64);
        let rows: Vec<TsRow> = match process_name {
            Some(name) => {
                // Upper-bounded at now: a future-dated row (clock skew) must
                // not materialize a bucket outside the window partition.
                let mut stmt = self
                    .conn
                    .prepare(
                        "SELECT timestamp, tx_bytes, rx_bytes
                         FROM bandwidth_records
                         WHERE timestamp >= ?1 AND timestamp <= ?2 AND process_name = ?3
                         ORDER BY timestamp",
                    )
                    .map_err(BandmonError::Query)?;
                let collected = stmt
                    .query_map(params![start, now, name], |row| {
                        let ts: DateTime<Utc> = row.get(0)?;
                        let tx: i64 = row.get(1)?;
                        let rx: i64 = row.get(2)?;
                        Ok((ts, tx as u64, rx as u64))
                    })
                    .map_err(BandmonError::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(BandmonError::Query)?;
                collected
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(
                        "SELECT timestamp, tx_bytes, rx_bytes
                         FROM bandwidth_records
                         WHERE timestamp >= ?1 AND timestamp <= ?2
                         ORDER BY timestamp",
                    )
                    .map_err(BandmonError::Query)?;
                let collected = stmt
                    .query_map(params![start, now], |row| {
                        let ts: DateTime<Utc> = row.get(0)?;
                        let tx: i64 = row.get(1)?;
                        let rx: i64 = row.get(2)?;
                        Ok((ts, tx as u64, rx as u64))
                    })
                    .map_err(BandmonError::Query)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(BandmonError::Query)?;
                collected
            }
        };

        // Accumulate per bucket index; BTreeMap keeps buckets ordered.
        let mut buckets: std::collections::BTreeMap<i64, (u64, u64)> =
            std::collections::BTreeMap::new();
        for (ts, tx, rx) in rows {
            let offset = (ts - start).num_seconds();
            // WHERE clauses guarantee ts >= start; guard anyway against
            // sub-second rounding placing a row at a negative offset.
            let idx = (offset.max(0) as u64) / bucket_secs;
            let entry = buckets.entry(idx as i64).or_insert((0, 0));
            entry.0 += tx;
            entry.1 += rx;
        }

        Ok(buckets
            .into_iter()
            .map(|(idx, (tx, rx))| TimeSeriesPoint {
                bucket_start: start + chrono::Duration::seconds(idx * bucket_secs as i64),
                tx_rate: tx as f64 / bucket_secs as f64,
                rx_rate: rx as f64 / bucket_secs as f64,
            })
            .collect())
    }

    /// Window-wide summary: distinct processes and pids, overall tx/rx
    /// rates under the rate-floor rule, and the row count.
    pub fn summary(&self, window: Window) -> Result<Summary, BandmonError> {
        let window_secs = window.checked_secs()?;
        let start = window.start(Utc::now());

        let (processes, pids, tx, rx, count, first, last) = self
            .conn
            .query_row(
                "SELECT COUNT(DISTINCT process_name),
                        COUNT(DISTINCT pid),
                        COALESCE(SUM(tx_bytes), 0),
                        COALESCE(SUM(rx_bytes), 0),
                        COUNT(*),
                        MIN(timestamp), MAX(timestamp)
                 FROM bandwidth_records
                 WHERE timestamp >= ?1",
                params![start],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<DateTime<Utc>>>(5)?,
                        row.get::<_, Option<DateTime<Utc>>>(6)?,
                    ))
                },
            )
            .map_err(BandmonError::Query)?;

        let span = match (first, last) {
            (Some(f), Some(l)) => span_secs(f, l),
            _ => 0.0,
        };

        Ok(Summary {
            process_count: processes as u64,
            pid_count: pids as u64,
            tx_rate: floored_rate(tx as u64, span, window_secs),
            rx_rate: floored_rate(rx as u64, span, window_secs),
            record_count: count as u64,
        })
    }
}

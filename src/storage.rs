// Durable storage for bandwidth delta records.
//
// One SQLite table of immutable append-only rows; every row is the traffic
// observed for one (process, remote IP, protocol) triple during one drain
// interval. Rows are never updated or merged — the only mutation is bulk
// deletion by the retention sweeper.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::BandmonError;
use crate::model::Protocol;

/// Handle to the bandwidth record store.
///
/// The sampler owns one handle as the sole writer; query-engine callers
/// open their own handles on the same path and read concurrently (WAL
/// journal mode keeps readers and the writer out of each other's way).
pub struct BandwidthStore {
    pub(crate) conn: Connection,
}

/// One delta row as handed over by the sampler. Byte counts are the
/// deltas for this drain interval, never cumulative totals.
#[derive(Debug, Clone)]
pub struct DeltaRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub process_name: &'a str,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub protocol: Protocol,
    pub remote_ip: &'a str,
}

impl BandwidthStore {
    /// Open (creating if necessary) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BandmonError> {
        let conn = Connection::open(path).map_err(BandmonError::StorageOpen)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, BandmonError> {
        let conn = Connection::open_in_memory().map_err(BandmonError::StorageOpen)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, BandmonError> {
        // WAL lets query-engine readers run concurrently with the sampler's
        // appends; the busy timeout covers the brief write locks that remain.
        conn.pragma_update_and_check(None, "journal_mode", "wal", |_| Ok(()))
            .map_err(BandmonError::StorageOpen)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(BandmonError::StorageOpen)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bandwidth_records (
                 id           INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp    DATETIME NOT NULL,
                 pid          INTEGER NOT NULL,
                 process_name TEXT NOT NULL,
                 tx_bytes     INTEGER NOT NULL,
                 rx_bytes     INTEGER NOT NULL,
                 protocol     TEXT NOT NULL,
                 remote_ip    TEXT NOT NULL,
                 created_at   DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             CREATE INDEX IF NOT EXISTS idx_timestamp
                 ON bandwidth_records(timestamp);
             CREATE INDEX IF NOT EXISTS idx_process
                 ON bandwidth_records(process_name);
             CREATE INDEX IF NOT EXISTS idx_pid
                 ON bandwidth_records(pid);
             CREATE INDEX IF NOT EXISTS idx_remote_ip
                 ON bandwidth_records(remote_ip);",
        )
        .map_err(BandmonError::StorageOpen)?;
        Ok(Self { conn })
    }

    /// Append one immutable delta row. A pure insert, acknowledged by
    /// SQLite before this returns — the sampler deliberately blocks on it.
    pub fn insert_record(&self, record: &DeltaRecord<'_>) -> Result<(), BandmonError> {
        self.conn
            .execute(
                "INSERT INTO bandwidth_records
                     (timestamp, pid, process_name, tx_bytes, rx_bytes, protocol, remote_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.timestamp,
                    record.pid,
                    record.process_name,
                    record.tx_bytes as i64,
                    record.rx_bytes as i64,
                    record.protocol.to_string(),
                    record.remote_ip,
                ],
            )
            .map_err(BandmonError::Persistence)?;
        Ok(())
    }

    /// Delete every row older than `retention_days` days. Unconditional and
    /// irreversible; returns the number of rows removed.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, BandmonError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        self.conn
            .execute(
                "DELETE FROM bandwidth_records WHERE timestamp < ?1",
                params![cutoff],
            )
            .map_err(BandmonError::Retention)
    }

    /// Total number of stored rows. Mostly useful for tests and logging.
    pub fn record_count(&self) -> Result<u64, BandmonError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM bandwidth_records", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(BandmonError::Query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(ts: DateTime<Utc>, name: &'a str, tx: u64, rx: u64) -> DeltaRecord<'a> {
        DeltaRecord {
            timestamp: ts,
            pid: 1000,
            process_name: name,
            tx_bytes: tx,
            rx_bytes: rx,
            protocol: Protocol::Tcp,
            remote_ip: "93.184.216.34",
        }
    }

    #[test]
    fn insert_is_append_only() {
        let store = BandwidthStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.insert_record(&record(now, "firefox", 100, 200)).unwrap();
        store.insert_record(&record(now, "firefox", 100, 200)).unwrap();
        // Identical rows do not merge: every call is a pure insert.
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn cleanup_removes_only_expired_rows() {
        let store = BandwidthStore::open_in_memory().unwrap();
        let now = Utc::now();
        for age_days in [0, 3, 8, 20] {
            let ts = now - chrono::Duration::days(age_days);
            store
                .insert_record(&record(ts, &format!("proc{age_days}"), 10, 10))
                .unwrap();
        }

        let deleted = store.cleanup(7).unwrap();
        assert_eq!(deleted, 2); // exactly the 8- and 20-day-old rows
        assert_eq!(store.record_count().unwrap(), 2);

        // Survivors are byte-for-byte intact.
        let names: Vec<String> = {
            let mut stmt = store
                .conn
                .prepare("SELECT process_name FROM bandwidth_records ORDER BY process_name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(names, vec!["proc0".to_string(), "proc3".to_string()]);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let store = BandwidthStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_record(&record(now - chrono::Duration::days(10), "old", 1, 1))
            .unwrap();
        store.insert_record(&record(now, "new", 1, 1)).unwrap();

        assert_eq!(store.cleanup(7).unwrap(), 1);
        assert_eq!(store.cleanup(7).unwrap(), 0);
        assert_eq!(store.record_count().unwrap(), 1);
    }
}

//! SQLite database for persistent storage
//!
//! Holds two tables: a cache of model names keyed by the configuration code
//! (last four characters of a serial) and a history of identified devices.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ScanError;
use crate::identify::{DeviceRecord, DeviceSink};

/// A stored scan history row
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub record: DeviceRecord,
    pub scanned_at: DateTime<Utc>,
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self, ScanError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::Storage(format!("cannot create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        info!("Opened database at {:?}", path);
        Ok(db)
    }

    /// Open a private in-memory database
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, ScanError> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<(), ScanError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS model_cache (
                 code       TEXT PRIMARY KEY,
                 model_name TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS scan_history (
                 id         TEXT PRIMARY KEY,
                 serial     TEXT NOT NULL,
                 record     TEXT NOT NULL,
                 scanned_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_scan_history_time ON scan_history (scanned_at);",
        )?;
        Ok(())
    }

    /// Cached model name for a configuration code
    pub fn lookup_model(&self, code: &str) -> Result<Option<String>, ScanError> {
        let name = self
            .conn
            .lock()
            .query_row(
                "SELECT model_name FROM model_cache WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Remember the model name for a configuration code
    pub fn store_model(&self, code: &str, model_name: &str) -> Result<(), ScanError> {
        self.conn.lock().execute(
            "INSERT INTO model_cache (code, model_name) VALUES (?1, ?2)
             ON CONFLICT(code) DO UPDATE SET model_name = excluded.model_name",
            params![code, model_name],
        )?;
        debug!("Cached model {} for {}", model_name, code);
        Ok(())
    }

    /// Append an identified device to the history, returning the row id
    pub fn record_scan(&self, record: &DeviceRecord) -> Result<String, ScanError> {
        let id = Uuid::new_v4().to_string();
        let json = serde_json::to_string(record)
            .map_err(|e| ScanError::Storage(format!("cannot encode record: {}", e)))?;

        self.conn.lock().execute(
            "INSERT INTO scan_history (id, serial, record, scanned_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, record.serial, json, Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)],
        )?;
        Ok(id)
    }

    /// Most recent history rows, newest first
    pub fn recent_scans(&self, limit: usize) -> Result<Vec<ScanEntry>, ScanError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, record, scanned_at FROM scan_history
             ORDER BY scanned_at DESC, rowid DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, json, scanned_at) = row?;
            let record = serde_json::from_str(&json)
                .map_err(|e| ScanError::Storage(format!("corrupt record {}: {}", id, e)))?;
            let scanned_at = DateTime::parse_from_rfc3339(&scanned_at)
                .map_err(|e| ScanError::Storage(format!("bad timestamp on {}: {}", id, e)))?
                .with_timezone(&Utc);
            entries.push(ScanEntry { record, scanned_at });
        }
        Ok(entries)
    }

    /// Number of history rows
    pub fn scan_count(&self) -> Result<usize, ScanError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM scan_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl DeviceSink for Database {
    fn name(&self) -> &str {
        "scan history"
    }

    fn publish(&self, record: &DeviceRecord) -> Result<(), ScanError> {
        let id = self.record_scan(record)?;
        debug!("Recorded scan {} for {}", id, record.serial);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(serial: &str) -> DeviceRecord {
        DeviceRecord {
            model_name: Some("MacBook Pro (15-inch, 2018)".to_string()),
            cpu: Some("2.6 GHz 6-Core Intel Core i7".to_string()),
            ..DeviceRecord::new(serial)
        }
    }

    #[test]
    fn test_model_cache_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.lookup_model("JGH5").unwrap(), None);

        db.store_model("JGH5", "MacBook Pro (15-inch, 2018)").unwrap();
        assert_eq!(
            db.lookup_model("JGH5").unwrap().as_deref(),
            Some("MacBook Pro (15-inch, 2018)")
        );

        db.store_model("JGH5", "MacBook Pro (15-inch, 2019)").unwrap();
        assert_eq!(
            db.lookup_model("JGH5").unwrap().as_deref(),
            Some("MacBook Pro (15-inch, 2019)")
        );
    }

    #[test]
    fn test_scan_history() {
        let db = Database::open_in_memory().unwrap();
        db.record_scan(&sample_record("C02XG2JHJGH5")).unwrap();
        db.record_scan(&sample_record("C02YT1ABMD6R")).unwrap();

        assert_eq!(db.scan_count().unwrap(), 2);

        let recent = db.recent_scans(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record.serial, "C02YT1ABMD6R");
        assert_eq!(recent[0].record.cpu.as_deref(), Some("2.6 GHz 6-Core Intel Core i7"));
    }

    #[test]
    fn test_sink_publishes_to_history() {
        let db = Database::open_in_memory().unwrap();
        let sink: &dyn DeviceSink = &db;
        sink.publish(&sample_record("C02XG2JHJGH5")).unwrap();
        assert_eq!(db.scan_count().unwrap(), 1);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("scanner.db");

        {
            let db = Database::open(&path).unwrap();
            db.store_model("MD6R", "MacBook Air (13-inch, 2017)").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.lookup_model("MD6R").unwrap().as_deref(),
            Some("MacBook Air (13-inch, 2017)")
        );
    }
}

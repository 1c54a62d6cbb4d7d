//! Append-only block/peak persistence over sqlite.
//!
//! One store per session path. The connection trades crash durability for
//! write throughput (`synchronous=OFF`, in-memory journal and temp store);
//! a session database is a cache of the capture, not a system of record.
//!
//! Thread affinity: the store is owned by the analyzer thread. `initialize`
//! and `shutdown` must run there; nothing here is `Sync` and no other
//! thread may touch an open connection.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, WavescopeError};

/// One persisted block row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlock {
    pub block_index: u64,
    pub sample_offset: u64,
    /// Raw little-endian f32 mono samples.
    #[serde(skip)]
    pub audio_data: Vec<u8>,
    pub data_size: u64,
    pub timestamp_ns: u64,
}

/// One persisted peak row.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPeak {
    pub block_index: u64,
    pub sample_offset: u64,
    pub min_value: f32,
    pub max_value: f32,
    pub timestamp_ns: u64,
}

/// Append-only audio store at a session path.
pub struct BlockStore {
    db_path: PathBuf,
    conn: Option<Connection>,
    /// Session-rotated stores own their file and delete it on shutdown.
    owns_file: bool,
}

impl BlockStore {
    /// Create a handle. No I/O happens until [`BlockStore::initialize`].
    pub fn new(db_path: impl Into<PathBuf>, owns_file: bool) -> Self {
        Self {
            db_path: db_path.into(),
            conn: None,
            owns_file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Open the database, apply the throughput pragmas and create the
    /// schema. Must run on the owning thread.
    pub fn initialize(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = OFF;
            PRAGMA journal_mode = MEMORY;
            PRAGMA temp_store = MEMORY;
            PRAGMA cache_size = 10000;

            CREATE TABLE IF NOT EXISTS audio_blocks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              block_index INTEGER NOT NULL UNIQUE,
              sample_offset INTEGER NOT NULL,
              audio_data BLOB NOT NULL,
              data_size INTEGER NOT NULL,
              timestamp_ns INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audio_peaks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              block_index INTEGER NOT NULL UNIQUE,
              sample_offset INTEGER NOT NULL,
              min_value REAL NOT NULL,
              max_value REAL NOT NULL,
              timestamp_ns INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_index ON audio_blocks(block_index);
            CREATE INDEX IF NOT EXISTS idx_peaks_index ON audio_peaks(block_index);
            "#,
        )?;
        info!(path = %self.db_path.display(), owns_file = self.owns_file, "audio store opened");
        self.conn = Some(conn);
        Ok(())
    }

    /// Close the connection. Session-owned files are removed from disk.
    /// Never fails; cleanup problems are logged.
    pub fn shutdown(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            debug!(path = %self.db_path.display(), "audio store closed");
        }
        if self.owns_file && self.db_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.db_path) {
                warn!(path = %self.db_path.display(), error = %e, "failed to remove session database");
            }
        }
    }

    /// Delete all rows from both tables.
    pub fn clear_database(&mut self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM audio_blocks", [])?;
        conn.execute("DELETE FROM audio_peaks", [])?;
        Ok(())
    }

    /// Append one raw block.
    ///
    /// # Errors
    /// `WavescopeError::DuplicateBlock` when `block_index` already exists.
    pub fn insert_block(
        &mut self,
        block_index: u64,
        sample_offset: u64,
        audio_data: &[u8],
        timestamp_ns: u64,
    ) -> Result<()> {
        let conn = self.connection()?;
        let result = conn.execute(
            "INSERT INTO audio_blocks (block_index, sample_offset, audio_data, data_size, timestamp_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block_index as i64,
                sample_offset as i64,
                audio_data,
                audio_data.len() as i64,
                timestamp_ns as i64
            ],
        );
        map_insert_error(result, block_index)
    }

    /// Append one peak record.
    pub fn insert_peak(
        &mut self,
        block_index: u64,
        sample_offset: u64,
        min_value: f32,
        max_value: f32,
        timestamp_ns: u64,
    ) -> Result<()> {
        let conn = self.connection()?;
        let result = conn.execute(
            "INSERT INTO audio_peaks (block_index, sample_offset, min_value, max_value, timestamp_ns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                block_index as i64,
                sample_offset as i64,
                min_value as f64,
                max_value as f64,
                timestamp_ns as i64
            ],
        );
        map_insert_error(result, block_index)
    }

    /// All blocks ordered by `block_index`.
    pub fn get_all_blocks(&self) -> Result<Vec<StoredBlock>> {
        let conn = self.connection_ref()?;
        let mut stmt = conn.prepare(
            "SELECT block_index, sample_offset, audio_data, data_size, timestamp_ns
             FROM audio_blocks ORDER BY block_index ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(StoredBlock {
                block_index: row.get::<_, i64>(0)? as u64,
                sample_offset: row.get::<_, i64>(1)? as u64,
                audio_data: row.get(2)?,
                data_size: row.get::<_, i64>(3)? as u64,
                timestamp_ns: row.get::<_, i64>(4)? as u64,
            });
        }
        Ok(out)
    }

    /// Raw bytes of one block, or `None` if the index is absent.
    pub fn get_block(&self, block_index: u64) -> Result<Option<Vec<u8>>> {
        let conn = self.connection_ref()?;
        let mut stmt =
            conn.prepare("SELECT audio_data FROM audio_blocks WHERE block_index = ?1")?;
        let mut rows = stmt.query(params![block_index as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// All peak records ordered by `block_index`.
    pub fn get_all_peaks(&self) -> Result<Vec<StoredPeak>> {
        let conn = self.connection_ref()?;
        let mut stmt = conn.prepare(
            "SELECT block_index, sample_offset, min_value, max_value, timestamp_ns
             FROM audio_peaks ORDER BY block_index ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_peak(row)?);
        }
        Ok(out)
    }

    /// Peaks with `timestamp_ns` in `[t_start, t_end]`, time-ordered.
    pub fn get_peaks_by_time(&self, t_start: u64, t_end: u64) -> Result<Vec<StoredPeak>> {
        let conn = self.connection_ref()?;
        let mut stmt = conn.prepare(
            "SELECT block_index, sample_offset, min_value, max_value, timestamp_ns
             FROM audio_peaks WHERE timestamp_ns >= ?1 AND timestamp_ns <= ?2
             ORDER BY timestamp_ns ASC",
        )?;
        let mut rows = stmt.query(params![t_start as i64, t_end as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_peak(row)?);
        }
        Ok(out)
    }

    /// Number of stored blocks.
    pub fn get_total_blocks(&self) -> Result<u64> {
        let conn = self.connection_ref()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audio_blocks", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Total bytes of stored audio payload.
    pub fn get_total_audio_size(&self) -> Result<u64> {
        let conn = self.connection_ref()?;
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(data_size), 0) FROM audio_blocks",
            [],
            |r| r.get(0),
        )?;
        Ok(size as u64)
    }

    /// `max(block_index) + 1`, or 0 for an empty store. Used to continue
    /// the session counter over a persistent database.
    pub fn next_block_index(&self) -> Result<u64> {
        let conn = self.connection_ref()?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(block_index) FROM audio_blocks", [], |r| r.get(0))?;
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| WavescopeError::State("store is not initialized".into()))
    }

    fn connection_ref(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| WavescopeError::State("store is not initialized".into()))
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if self.conn.is_some() || (self.owns_file && self.db_path.exists()) {
            self.shutdown();
        }
    }
}

fn read_peak(row: &rusqlite::Row<'_>) -> Result<StoredPeak> {
    Ok(StoredPeak {
        block_index: row.get::<_, i64>(0)? as u64,
        sample_offset: row.get::<_, i64>(1)? as u64,
        min_value: row.get::<_, f64>(2)? as f32,
        max_value: row.get::<_, f64>(3)? as f32,
        timestamp_ns: row.get::<_, i64>(4)? as u64,
    })
}

fn map_insert_error(result: rusqlite::Result<usize>, block_index: u64) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(WavescopeError::DuplicateBlock(block_index)),
        Err(e) => Err(e.into()),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> BlockStore {
        let path = std::env::temp_dir().join(format!(
            "wavescope-store-test-{:08x}{:08x}.db",
            rand::random::<u32>(),
            rand::random::<u32>()
        ));
        let mut store = BlockStore::new(path, true);
        store.initialize().expect("open temp store");
        store
    }

    #[test]
    fn block_round_trip_preserves_bytes() {
        let mut store = temp_store();
        let samples: Vec<f32> = (0..1024).map(|i| (i as f32) / 1024.0).collect();
        let mut bytes = Vec::with_capacity(4096);
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        store.insert_block(0, 0, &bytes, 1_000).unwrap();
        let read = store.get_block(0).unwrap().expect("block 0 present");
        assert_eq!(read.len(), 1024 * 4);
        assert_eq!(read, bytes);

        let decoded: Vec<f32> = read
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn missing_block_is_none() {
        let store = temp_store();
        assert!(store.get_block(99).unwrap().is_none());
    }

    #[test]
    fn duplicate_index_is_reported_as_such() {
        let mut store = temp_store();
        store.insert_block(7, 0, &[0u8; 8], 10).unwrap();
        let err = store.insert_block(7, 8, &[0u8; 8], 20).unwrap_err();
        assert!(matches!(err, WavescopeError::DuplicateBlock(7)));

        store.insert_peak(7, 0, -0.5, 0.5, 10).unwrap();
        let err = store.insert_peak(7, 0, -0.5, 0.5, 10).unwrap_err();
        assert!(matches!(err, WavescopeError::DuplicateBlock(7)));
    }

    #[test]
    fn blocks_and_peaks_come_back_ordered() {
        let mut store = temp_store();
        for idx in [3u64, 1, 2, 0] {
            store
                .insert_block(idx, idx * 4, &[idx as u8; 4], idx * 100)
                .unwrap();
            store
                .insert_peak(idx, idx * 4, -(idx as f32), idx as f32, idx * 100)
                .unwrap();
        }
        let blocks = store.get_all_blocks().unwrap();
        assert_eq!(
            blocks.iter().map(|b| b.block_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        let peaks = store.get_all_peaks().unwrap();
        assert_eq!(
            peaks.iter().map(|p| p.block_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn peaks_by_time_is_an_inclusive_range() {
        let mut store = temp_store();
        for idx in 0u64..5 {
            store
                .insert_peak(idx, idx * 4, -1.0, 1.0, idx * 1_000)
                .unwrap();
        }
        let peaks = store.get_peaks_by_time(1_000, 3_000).unwrap();
        assert_eq!(
            peaks.iter().map(|p| p.timestamp_ns).collect::<Vec<_>>(),
            vec![1_000, 2_000, 3_000]
        );
    }

    #[test]
    fn totals_and_next_index() {
        let mut store = temp_store();
        assert_eq!(store.get_total_blocks().unwrap(), 0);
        assert_eq!(store.next_block_index().unwrap(), 0);

        store.insert_block(0, 0, &[0u8; 16], 0).unwrap();
        store.insert_block(5, 16, &[0u8; 16], 1).unwrap();
        assert_eq!(store.get_total_blocks().unwrap(), 2);
        assert_eq!(store.get_total_audio_size().unwrap(), 32);
        assert_eq!(store.next_block_index().unwrap(), 6);
    }

    #[test]
    fn clear_database_empties_both_tables() {
        let mut store = temp_store();
        store.insert_block(0, 0, &[1u8; 4], 0).unwrap();
        store.insert_peak(0, 0, -1.0, 1.0, 0).unwrap();
        store.clear_database().unwrap();
        assert_eq!(store.get_total_blocks().unwrap(), 0);
        assert!(store.get_all_peaks().unwrap().is_empty());
    }

    #[test]
    fn owned_file_is_removed_on_shutdown() {
        let mut store = temp_store();
        let path = store.path().to_path_buf();
        store.insert_block(0, 0, &[0u8; 4], 0).unwrap();
        assert!(path.exists());
        store.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn uninitialized_store_reports_state_error() {
        let mut store = BlockStore::new(std::env::temp_dir().join("never-opened.db"), false);
        assert!(matches!(
            store.insert_block(0, 0, &[], 0),
            Err(WavescopeError::State(_))
        ));
        // owns_file=false → drop must not try to delete anything
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut store = temp_store();
        store.insert_block(0, 0, &[0u8; 4], 0).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.get_total_blocks().unwrap(), 1);
    }
}

pub mod models;
pub mod queries;

use crate::config::{EngineParams, HASH_LAYOUT_VERSION};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("store was built with {key}={found}, this build expects {expected}")]
    SchemaMismatch {
        key: &'static str,
        expected: String,
        found: String,
    },
    #[error("unknown track id {0}")]
    UnknownTrack(i64),
    #[error("track {track_id} is {state}, expected {expected}")]
    IngestState {
        track_id: i64,
        state: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The inverted fingerprint index plus track metadata, on SQLite.
///
/// `hashes` holds committed postings only; in-flight ingests stage into
/// `pending_hashes` and are promoted in a single transaction by
/// `commit_ingest`, so `lookup` can never observe a partial track. The
/// connection is a single writer; drivers serialize their write phase and
/// may read concurrently from other connections.
pub struct Database {
    pub conn: Connection,
    params: EngineParams,
}

impl Database {
    pub fn open(path: &Path, params: &EngineParams) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn,
            params: params.clone(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory(params: &EngineParams) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            params: params.clone(),
        };
        db.init()?;
        Ok(db)
    }

    /// Parameters this store was opened (and verified) against.
    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Flush committed state and release the connection.
    pub fn close(self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .ok();
        self.conn
            .close()
            .map_err(|(_, e)| StoreError::Sqlite(e))
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        self.check_header()?;
        self.sweep_stale_ingests()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }

        self.conn.pragma_update(None, "user_version", 1)?;
        Ok(())
    }

    /// V1: meta header + tracks + committed and staged posting tables.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            -- AUTOINCREMENT so aborted ids are burned, never handed out again
            CREATE TABLE IF NOT EXISTS tracks (
                track_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                title        TEXT NOT NULL,
                artist       TEXT,
                source_ref   TEXT NOT NULL UNIQUE,
                frame_count  INTEGER,
                state        TEXT NOT NULL DEFAULT 'pending',
                ingested_at  TEXT
            );

            CREATE TABLE IF NOT EXISTS hashes (
                hash         INTEGER NOT NULL,
                track_id     INTEGER NOT NULL REFERENCES tracks(track_id) ON DELETE CASCADE,
                anchor_time  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_hashes_hash ON hashes(hash);
            CREATE INDEX IF NOT EXISTS idx_hashes_track ON hashes(track_id);

            CREATE TABLE IF NOT EXISTS pending_hashes (
                hash         INTEGER NOT NULL,
                track_id     INTEGER NOT NULL,
                anchor_time  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_track ON pending_hashes(track_id);
            ",
        )?;
        Ok(())
    }

    /// Write the parameter header on a fresh store, or verify it matches
    /// this build on an existing one. Hashes are only comparable between
    /// identical pipelines, so any drift refuses to open.
    fn check_header(&self) -> Result<()> {
        let expected = self.header_entries();

        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM meta", [], |row| row.get(0))?;

        if count == 0 {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
                for (key, value) in &expected {
                    stmt.execute(rusqlite::params![key, value])?;
                }
            }
            tx.commit()?;
            return Ok(());
        }

        for (key, value) in &expected {
            let found: Option<String> = self
                .conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match found {
                Some(ref v) if v == value => {}
                Some(v) => {
                    return Err(StoreError::SchemaMismatch {
                        key,
                        expected: value.clone(),
                        found: v,
                    });
                }
                None => {
                    return Err(StoreError::SchemaMismatch {
                        key,
                        expected: value.clone(),
                        found: "<missing>".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn header_entries(&self) -> Vec<(&'static str, String)> {
        let p = &self.params;
        vec![
            ("layout_version", HASH_LAYOUT_VERSION.to_string()),
            ("sample_rate", p.sample_rate.to_string()),
            ("window_size", p.window_size.to_string()),
            ("hop_size", p.hop_size.to_string()),
            ("window_type", "hann".to_string()),
            ("peak_time_radius", p.peak_time_radius.to_string()),
            ("peak_freq_radius", p.peak_freq_radius.to_string()),
            ("fan_out", p.fan_out.to_string()),
            ("dt_min", p.pair_dt_min.to_string()),
            ("dt_max", p.pair_dt_max.to_string()),
        ]
    }

    /// Drop staging left behind by a crashed ingest. At open there are no
    /// in-flight ingests, so every pending row is stale.
    fn sweep_stale_ingests(&self) -> Result<()> {
        let staged: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_hashes", [], |row| row.get(0))?;
        if staged > 0 {
            log::warn!("sweeping {staged} staged fingerprints from an interrupted ingest");
        }
        self.conn.execute("DELETE FROM pending_hashes", [])?;
        self.conn
            .execute("DELETE FROM tracks WHERE state = 'pending'", [])?;
        Ok(())
    }
}

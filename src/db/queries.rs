use super::models::{IngestTicket, NewTrack, StoreStats, TrackId, TrackInfo};
use super::{Database, Result, StoreError};
use crate::pairs::Fingerprint;
use rusqlite::params;

impl Database {
    /// Reserve a track id for ingest, staging nothing yet.
    ///
    /// Idempotent on `source_ref`: a committed track with the same ref is
    /// returned as `Existing` without touching its rows. A pending row
    /// with the same ref belongs to a crashed or superseded ingest — its
    /// staging is reset and the id handed back as `New`.
    pub fn begin_ingest(&self, meta: &NewTrack) -> Result<IngestTicket> {
        let existing: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT track_id, state FROM tracks WHERE source_ref = ?1",
                params![meta.source_ref],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(no_rows_to_none)?;

        if let Some((id, state)) = existing {
            if state == "ready" {
                return Ok(IngestTicket::Existing(id as TrackId));
            }
            self.conn.execute(
                "DELETE FROM pending_hashes WHERE track_id = ?1",
                params![id],
            )?;
            return Ok(IngestTicket::New(id as TrackId));
        }

        self.conn.execute(
            "INSERT INTO tracks (title, artist, source_ref, state) VALUES (?1, ?2, ?3, 'pending')",
            params![meta.title, meta.artist, meta.source_ref],
        )?;
        Ok(IngestTicket::New(self.conn.last_insert_rowid() as TrackId))
    }

    /// Stage a batch of fingerprints for an in-flight ingest. Safe to call
    /// repeatedly; nothing becomes visible to `lookup` until commit.
    pub fn append_fingerprints(&self, track_id: TrackId, batch: &[Fingerprint]) -> Result<()> {
        self.expect_state(track_id, "pending")?;

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO pending_hashes (hash, track_id, anchor_time) VALUES (?1, ?2, ?3)",
            )?;
            for fp in batch {
                stmt.execute(params![fp.hash as i64, track_id as i64, fp.anchor_time as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Promote a staged ingest: all of the track's fingerprints become
    /// visible in one transaction, or none do.
    pub fn commit_ingest(&self, track_id: TrackId, frame_count: u32) -> Result<()> {
        self.expect_state(track_id, "pending")?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO hashes (hash, track_id, anchor_time)
             SELECT hash, track_id, anchor_time FROM pending_hashes WHERE track_id = ?1",
            params![track_id as i64],
        )?;
        tx.execute(
            "DELETE FROM pending_hashes WHERE track_id = ?1",
            params![track_id as i64],
        )?;
        tx.execute(
            "UPDATE tracks SET state = 'ready', frame_count = ?2, ingested_at = ?3
             WHERE track_id = ?1",
            params![
                track_id as i64,
                frame_count as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Discard a staged ingest. The track row is dropped too; the id is
    /// burned by AUTOINCREMENT and will not be reissued.
    pub fn abort_ingest(&self, track_id: TrackId) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM pending_hashes WHERE track_id = ?1",
            params![track_id as i64],
        )?;
        tx.execute(
            "DELETE FROM tracks WHERE track_id = ?1 AND state = 'pending'",
            params![track_id as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All committed postings under one hash. Hot path: a single indexed
    /// lookup, one small tuple per posting.
    pub fn lookup(&self, hash: u64) -> Result<Vec<(TrackId, u32)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT track_id, anchor_time FROM hashes WHERE hash = ?1")?;
        let postings = stmt
            .query_map(params![hash as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)? as TrackId,
                    row.get::<_, i64>(1)? as u32,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(postings)
    }

    /// Metadata for one committed track.
    pub fn track(&self, track_id: TrackId) -> Result<TrackInfo> {
        self.conn
            .query_row(
                "SELECT track_id, title, artist, source_ref, frame_count, ingested_at
                 FROM tracks WHERE track_id = ?1 AND state = 'ready'",
                params![track_id as i64],
                Self::track_row,
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Err(StoreError::UnknownTrack(track_id as i64))
                }
                other => Err(other.into()),
            })
    }

    /// All committed tracks, in id order.
    pub fn tracks(&self) -> Result<Vec<TrackInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT track_id, title, artist, source_ref, frame_count, ingested_at
             FROM tracks WHERE state = 'ready' ORDER BY track_id",
        )?;
        let tracks = stmt
            .query_map([], Self::track_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    fn track_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackInfo> {
        Ok(TrackInfo {
            track_id: row.get::<_, i64>(0)? as TrackId,
            title: row.get(1)?,
            artist: row.get(2)?,
            source_ref: row.get(3)?,
            frame_count: row.get::<_, i64>(4)? as u32,
            ingested_at: row.get(5)?,
        })
    }

    /// Library statistics over committed state.
    pub fn stats(&self) -> Result<StoreStats> {
        let tracks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE state = 'ready'",
            [],
            |row| row.get(0),
        )?;
        let postings: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM hashes", [], |row| row.get(0))?;
        let distinct_hashes: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT hash) FROM hashes",
            [],
            |row| row.get(0),
        )?;
        let total_frames: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(frame_count), 0) FROM tracks WHERE state = 'ready'",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            tracks,
            postings,
            distinct_hashes,
            indexed_hours: total_frames as f64 * self.params().frame_secs() / 3600.0,
        })
    }

    fn expect_state(&self, track_id: TrackId, expected: &'static str) -> Result<()> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM tracks WHERE track_id = ?1",
                params![track_id as i64],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(no_rows_to_none)?;

        match state {
            None => Err(StoreError::UnknownTrack(track_id as i64)),
            Some(s) if s != expected => Err(StoreError::IngestState {
                track_id: track_id as i64,
                state: s,
                expected,
            }),
            Some(_) => Ok(()),
        }
    }
}

fn no_rows_to_none<T>(e: rusqlite::Error) -> std::result::Result<Option<T>, rusqlite::Error> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineParams;

    fn fp(hash: u64, anchor_time: u32) -> Fingerprint {
        Fingerprint { hash, anchor_time }
    }

    fn meta(source_ref: &str) -> NewTrack {
        NewTrack {
            title: format!("Track {source_ref}"),
            artist: Some("Test Artist".to_string()),
            source_ref: source_ref.to_string(),
        }
    }

    fn open() -> Database {
        Database::open_in_memory(&EngineParams::default()).unwrap()
    }

    #[test]
    fn staged_rows_are_invisible_until_commit() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        db.append_fingerprints(id, &[fp(42, 0), fp(42, 7), fp(99, 3)])
            .unwrap();

        assert!(db.lookup(42).unwrap().is_empty());

        db.commit_ingest(id, 100).unwrap();
        let postings = db.lookup(42).unwrap();
        assert_eq!(postings, vec![(id, 0), (id, 7)]);
        assert_eq!(db.lookup(99).unwrap(), vec![(id, 3)]);
    }

    #[test]
    fn abort_discards_staging_and_burns_the_id() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        db.append_fingerprints(id, &[fp(42, 0)]).unwrap();
        db.abort_ingest(id).unwrap();

        assert!(db.lookup(42).unwrap().is_empty());
        assert!(matches!(db.track(id), Err(StoreError::UnknownTrack(_))));

        // A later ingest never reuses the aborted id
        let next = db.begin_ingest(&meta("b")).unwrap().track_id();
        assert!(next > id);
    }

    #[test]
    fn begin_is_idempotent_on_source_ref() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        db.append_fingerprints(id, &[fp(1, 0)]).unwrap();
        db.commit_ingest(id, 50).unwrap();

        match db.begin_ingest(&meta("a")).unwrap() {
            IngestTicket::Existing(existing) => assert_eq!(existing, id),
            other => panic!("expected Existing, got {other:?}"),
        }
        // No duplicate rows appeared
        assert_eq!(db.lookup(1).unwrap().len(), 1);
    }

    #[test]
    fn begin_resets_a_stale_pending_ingest() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        db.append_fingerprints(id, &[fp(1, 0), fp(2, 1)]).unwrap();

        // Same source begins again before commit: staging is cleared
        let again = db.begin_ingest(&meta("a")).unwrap();
        assert_eq!(again, IngestTicket::New(id));

        db.commit_ingest(id, 10).unwrap();
        assert!(db.lookup(1).unwrap().is_empty());
        assert!(db.lookup(2).unwrap().is_empty());
    }

    #[test]
    fn append_after_commit_is_an_error() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        db.commit_ingest(id, 10).unwrap();

        match db.append_fingerprints(id, &[fp(1, 0)]) {
            Err(StoreError::IngestState { state, .. }) => assert_eq!(state, "ready"),
            other => panic!("expected IngestState, got {:?}", other.err()),
        }
    }

    #[test]
    fn append_to_unknown_track_is_an_error() {
        let db = open();
        assert!(matches!(
            db.append_fingerprints(7, &[fp(1, 0)]),
            Err(StoreError::UnknownTrack(7))
        ));
    }

    #[test]
    fn track_metadata_round_trips() {
        let db = open();
        let id = db.begin_ingest(&meta("tape-77")).unwrap().track_id();
        db.commit_ingest(id, 12345).unwrap();

        let info = db.track(id).unwrap();
        assert_eq!(info.title, "Track tape-77");
        assert_eq!(info.artist.as_deref(), Some("Test Artist"));
        assert_eq!(info.source_ref, "tape-77");
        assert_eq!(info.frame_count, 12345);
        assert!(!info.ingested_at.is_empty());

        assert_eq!(db.tracks().unwrap().len(), 1);
    }

    #[test]
    fn pending_tracks_are_hidden_from_listings() {
        let db = open();
        let _ = db.begin_ingest(&meta("a")).unwrap();
        assert!(db.tracks().unwrap().is_empty());
        assert_eq!(db.stats().unwrap().tracks, 0);
    }

    #[test]
    fn stats_reflect_committed_state() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        // 43.066 frames/sec -> one hour is ~155040 frames
        db.append_fingerprints(id, &[fp(1, 0), fp(1, 5), fp(2, 9)])
            .unwrap();
        db.commit_ingest(id, 155_040).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.tracks, 1);
        assert_eq!(stats.postings, 3);
        assert_eq!(stats.distinct_hashes, 2);
        assert!((stats.indexed_hours - 1.0).abs() < 0.01);
    }

    #[test]
    fn hash_values_survive_the_i64_boundary() {
        let db = open();
        let id = db.begin_ingest(&meta("a")).unwrap().track_id();
        let big = u64::MAX - 17;
        db.append_fingerprints(id, &[fp(big, 4)]).unwrap();
        db.commit_ingest(id, 10).unwrap();

        assert_eq!(db.lookup(big).unwrap(), vec![(id, 4)]);
    }
}

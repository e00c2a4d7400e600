use serde::Serialize;

/// Identifier of a reference track. Dense, assigned monotonically at
/// ingest; aborted ids are burned, never reused.
pub type TrackId = u32;

/// Metadata for a track about to be ingested.
pub struct NewTrack {
    pub title: String,
    pub artist: Option<String>,
    /// Provenance key; re-ingesting the same source returns the prior id.
    pub source_ref: String,
}

/// A committed track row.
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub track_id: TrackId,
    pub title: String,
    pub artist: Option<String>,
    pub source_ref: String,
    /// STFT frames in the reference; every stored anchor_time is below this.
    pub frame_count: u32,
    pub ingested_at: String,
}

/// Outcome of `begin_ingest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestTicket {
    /// A fresh id was reserved; the caller owns the staged ingest.
    New(TrackId),
    /// The source_ref is already committed; nothing to do.
    Existing(TrackId),
}

impl IngestTicket {
    pub fn track_id(&self) -> TrackId {
        match self {
            Self::New(id) | Self::Existing(id) => *id,
        }
    }
}

/// Library statistics.
#[derive(Debug)]
pub struct StoreStats {
    pub tracks: i64,
    pub postings: i64,
    pub distinct_hashes: i64,
    pub indexed_hours: f64,
}

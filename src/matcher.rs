use crate::cancel::CancelToken;
use crate::db::models::TrackId;
use crate::db::{Database, StoreError};
use crate::pairs::{self, Fingerprint};
use crate::source::SampleSource;
use crate::spectrum::ExtractError;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("recognition cancelled")]
    Cancelled,
}

/// Outcome class of a recognition. No-match is a successful `Empty`, not
/// an error; `Partial` means the deadline expired and scoring stopped
/// early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Empty,
    Partial,
}

/// One ranked candidate.
#[derive(Debug, Clone, Serialize)]
pub struct TrackMatch {
    pub track_id: TrackId,
    pub title: String,
    pub artist: Option<String>,
    /// Mode count of the offset histogram — matched landmark pairs at the
    /// best alignment.
    pub score: u32,
    /// Where the query starts within the reference, in seconds.
    pub offset_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub status: Status,
    pub results: Vec<TrackMatch>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Ranked candidates to return (boundary ties may add more).
    pub topk: usize,
    /// Minimum histogram mode count for a candidate to qualify.
    pub min_support: u32,
    /// Wall-clock budget; scoring past this returns best-so-far.
    pub deadline: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            topk: 3,
            min_support: 5,
            deadline: None,
        }
    }
}

/// Sparse offset histogram for one candidate track.
#[derive(Default)]
struct TrackHist {
    counts: HashMap<i64, u32>,
    best: u32,
}

impl TrackHist {
    fn vote(&mut self, delta: i64) {
        let c = self.counts.entry(delta).or_insert(0);
        *c += 1;
        if *c > self.best {
            self.best = *c;
        }
    }

    /// Mode of the histogram; ties resolve to the smallest offset so
    /// repeated queries report the same alignment.
    fn mode(&self) -> (i64, u32) {
        let mut best_delta = 0i64;
        let mut best_count = 0u32;
        for (&delta, &count) in &self.counts {
            if count > best_count || (count == best_count && delta < best_delta) {
                best_delta = delta;
                best_count = count;
            }
        }
        (best_delta, best_count)
    }
}

/// How often the deadline, cancellation flag and prune pass run, in query
/// fingerprints.
const CHECK_INTERVAL: usize = 64;

/// Identify a snippet against the store.
///
/// Extracts query fingerprints, votes each matching posting into a
/// per-track histogram of `t_reference - t_query`, and ranks tracks by
/// the histogram mode: a real match piles votes onto one offset while
/// chance collisions scatter. Candidates that can no longer reach
/// `min_support` with the votes remaining are dropped as scoring
/// proceeds.
pub fn recognize<S: SampleSource>(
    db: &Database,
    source: &mut S,
    opts: &QueryOptions,
    cancel: &CancelToken,
) -> Result<Recognition, RecognizeError> {
    let extraction = pairs::extract(source, db.params())?;
    recognize_fingerprints(db, &extraction.fingerprints, opts, cancel)
}

/// Scoring core, separated so embedders with pre-extracted fingerprints
/// can query directly.
pub fn recognize_fingerprints(
    db: &Database,
    fingerprints: &[Fingerprint],
    opts: &QueryOptions,
    cancel: &CancelToken,
) -> Result<Recognition, RecognizeError> {
    if fingerprints.is_empty() {
        return Ok(Recognition {
            status: Status::Empty,
            results: Vec::new(),
        });
    }

    let started = Instant::now();
    let mut hists: HashMap<TrackId, TrackHist> = HashMap::new();
    let mut partial = false;

    for (i, fp) in fingerprints.iter().enumerate() {
        if i % CHECK_INTERVAL == 0 {
            if cancel.is_cancelled() {
                return Err(RecognizeError::Cancelled);
            }
            if i > 0 {
                if let Some(budget) = opts.deadline {
                    if started.elapsed() > budget {
                        log::debug!(
                            "deadline after {i}/{} query fingerprints",
                            fingerprints.len()
                        );
                        partial = true;
                        break;
                    }
                }
                // A track whose best bucket cannot reach min_support with
                // the votes left will never qualify
                let remaining = (fingerprints.len() - i) as u32;
                hists.retain(|_, h| h.best.saturating_add(remaining) >= opts.min_support);
            }
        }

        for (track_id, t_ref) in db.lookup(fp.hash)? {
            let delta = t_ref as i64 - fp.anchor_time as i64;
            hists.entry(track_id).or_default().vote(delta);
        }
    }

    let mut candidates: Vec<(TrackId, u32, i64)> = hists
        .iter()
        .filter_map(|(&track_id, hist)| {
            let (delta, count) = hist.mode();
            (count >= opts.min_support).then_some((track_id, count, delta))
        })
        .collect();

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    // Keep topk, plus anything tied with the last kept score
    if candidates.len() > opts.topk && opts.topk > 0 {
        let boundary = candidates[opts.topk - 1].1;
        candidates.retain({
            let mut kept = 0usize;
            move |c| {
                kept += 1;
                kept <= opts.topk || c.1 == boundary
            }
        });
    } else if opts.topk == 0 {
        candidates.clear();
    }

    let frame_secs = db.params().frame_secs();
    let mut results = Vec::with_capacity(candidates.len());
    for (track_id, score, delta) in candidates {
        let info = db.track(track_id)?;
        results.push(TrackMatch {
            track_id,
            title: info.title,
            artist: info.artist,
            score,
            offset_seconds: delta as f64 * frame_secs,
        });
    }

    let status = if results.is_empty() {
        Status::Empty
    } else if partial {
        Status::Partial
    } else {
        Status::Ok
    };

    Ok(Recognition { status, results })
}

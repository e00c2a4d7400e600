use crate::cancel::CancelToken;
use crate::db::models::{IngestTicket, NewTrack, TrackId};
use crate::db::{Database, StoreError};
use crate::pairs::{self, Extraction};
use crate::source::SampleSource;
use crate::spectrum::ExtractError;
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("ingest cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub enum IngestOutcome {
    Ingested { track_id: TrackId, fingerprints: u64 },
    /// The source_ref was already committed; nothing was written.
    Skipped { track_id: TrackId },
}

/// One reference track queued for batch ingest.
pub struct IngestJob {
    pub meta: NewTrack,
    pub source: Box<dyn SampleSource + Send>,
}

pub struct IngestReport {
    pub ingested: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// Fingerprints staged per `append_fingerprints` call.
const APPEND_BATCH: usize = 10_000;

/// Ingest a single track end to end.
///
/// The pipeline runs source → frames → peaks → pairs, stages the result
/// and commits. Any failure or cancellation aborts the staged rows, so
/// the store ends in its pre-ingest state for this track.
pub fn ingest_one<S: SampleSource + ?Sized>(
    db: &Database,
    meta: &NewTrack,
    source: &mut S,
    cancel: &CancelToken,
) -> Result<IngestOutcome, IngestError> {
    let track_id = match db.begin_ingest(meta)? {
        IngestTicket::Existing(id) => {
            log::debug!("'{}' already ingested as track {id}", meta.source_ref);
            return Ok(IngestOutcome::Skipped { track_id: id });
        }
        IngestTicket::New(id) => id,
    };

    let staged = (|| {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let extraction = pairs::extract(source, db.params())?;
        stage_extraction(db, track_id, &extraction, cancel)
    })();

    match staged {
        Ok(fingerprints) => Ok(IngestOutcome::Ingested {
            track_id,
            fingerprints,
        }),
        Err(e) => {
            if let Err(abort_err) = db.abort_ingest(track_id) {
                log::error!("abort of track {track_id} failed: {abort_err}");
            }
            Err(e)
        }
    }
}

/// Stage an extraction's fingerprints in batches and commit.
fn stage_extraction(
    db: &Database,
    track_id: TrackId,
    extraction: &Extraction,
    cancel: &CancelToken,
) -> Result<u64, IngestError> {
    for batch in extraction.fingerprints.chunks(APPEND_BATCH) {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        db.append_fingerprints(track_id, batch)?;
    }
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    db.commit_ingest(track_id, extraction.frame_count)?;
    log::info!(
        "ingested track {track_id} ({} fingerprints over {} frames)",
        extraction.fingerprints.len(),
        extraction.frame_count
    );
    Ok(extraction.fingerprints.len() as u64)
}

/// Ingest a batch of tracks with a worker pool.
///
/// Fingerprint extraction is CPU-bound and fans out across rayon workers;
/// the SQLite phase stays on the calling thread (single writer). Per-track
/// failures are tallied and logged, not fatal. On cancellation every
/// track that has not committed is aborted.
pub fn ingest_tracks(
    db: &Database,
    jobs: Vec<IngestJob>,
    workers: usize,
    cancel: &CancelToken,
) -> IngestReport {
    let mut report = IngestReport {
        ingested: 0,
        skipped: 0,
        failed: 0,
        cancelled: false,
    };

    // Reserve ids first so the expensive extraction phase can skip
    // sources that are already in the library
    let mut pending: Vec<(TrackId, IngestJob)> = Vec::new();
    for job in jobs {
        match db.begin_ingest(&job.meta) {
            Ok(IngestTicket::New(id)) => pending.push((id, job)),
            Ok(IngestTicket::Existing(id)) => {
                log::debug!("'{}' already ingested as track {id}", job.meta.source_ref);
                report.skipped += 1;
            }
            Err(e) => {
                log::error!("begin_ingest for '{}' failed: {e}", job.meta.source_ref);
                report.failed += 1;
            }
        }
    }

    if pending.is_empty() {
        return report;
    }

    log::info!(
        "Fingerprinting {} tracks with {} workers",
        pending.len(),
        workers
    );

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .unwrap();

    let params = db.params().clone();

    // Parallel extraction; results come back in job order
    let extracted: Vec<(TrackId, Result<Extraction, IngestError>)> = pool.install(|| {
        use rayon::prelude::*;
        pending
            .par_iter_mut()
            .map(|(id, job)| {
                let result = if cancel.is_cancelled() {
                    Err(IngestError::Cancelled)
                } else {
                    pairs::extract(job.source.as_mut(), &params).map_err(IngestError::from)
                };
                pb.inc(1);
                (*id, result)
            })
            .collect()
    });

    // Sequential store phase (SQLite single-writer)
    for (track_id, result) in extracted {
        let staged = result.and_then(|extraction| {
            if cancel.is_cancelled() {
                Err(IngestError::Cancelled)
            } else {
                stage_extraction(db, track_id, &extraction, cancel)
            }
        });

        match staged {
            Ok(_) => report.ingested += 1,
            Err(IngestError::Cancelled) => {
                if let Err(e) = db.abort_ingest(track_id) {
                    log::error!("abort of track {track_id} failed: {e}");
                }
                report.cancelled = true;
            }
            Err(e) => {
                log::warn!("ingest of track {track_id} failed: {e}");
                if let Err(e) = db.abort_ingest(track_id) {
                    log::error!("abort of track {track_id} failed: {e}");
                }
                report.failed += 1;
            }
        }
    }

    pb.finish_with_message(format!(
        "Done: {} ingested, {} skipped, {} failed",
        report.ingested, report.skipped, report.failed
    ));

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineParams;
    use crate::source::BufferSource;

    fn meta(source_ref: &str) -> NewTrack {
        NewTrack {
            title: source_ref.to_string(),
            artist: None,
            source_ref: source_ref.to_string(),
        }
    }

    /// A couple of steady tones so the pipeline finds real peaks.
    fn tones(secs: f32, sr: u32) -> Vec<f32> {
        (0..(secs * sr as f32) as usize)
            .map(|i| {
                let t = i as f32 / sr as f32;
                let tau = 2.0 * std::f32::consts::PI;
                0.4 * (tau * 440.0 * t).sin() + 0.3 * (tau * 1320.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn ingest_commits_postings() {
        let db = Database::open_in_memory(&EngineParams::default()).unwrap();
        let sr = db.params().sample_rate;
        let mut src = BufferSource::new(tones(10.0, sr), sr);

        let outcome = ingest_one(&db, &meta("a"), &mut src, &CancelToken::new()).unwrap();
        let (track_id, count) = match outcome {
            IngestOutcome::Ingested {
                track_id,
                fingerprints,
            } => (track_id, fingerprints),
            other => panic!("expected Ingested, got {other:?}"),
        };
        assert!(count > 0);

        let info = db.track(track_id).unwrap();
        assert!(info.frame_count > 0);
        assert_eq!(db.stats().unwrap().postings as u64, count);
    }

    #[test]
    fn reingesting_the_same_source_is_skipped() {
        let db = Database::open_in_memory(&EngineParams::default()).unwrap();
        let sr = db.params().sample_rate;
        let samples = tones(5.0, sr);

        let mut src = BufferSource::new(samples.clone(), sr);
        let first = ingest_one(&db, &meta("a"), &mut src, &CancelToken::new()).unwrap();

        let mut src = BufferSource::new(samples, sr);
        let second = ingest_one(&db, &meta("a"), &mut src, &CancelToken::new()).unwrap();

        match (first, second) {
            (
                IngestOutcome::Ingested { track_id: a, .. },
                IngestOutcome::Skipped { track_id: b },
            ) => assert_eq!(a, b),
            other => panic!("expected Ingested then Skipped, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_ingest_leaves_no_trace() {
        let db = Database::open_in_memory(&EngineParams::default()).unwrap();
        let sr = db.params().sample_rate;
        let mut src = BufferSource::new(tones(5.0, sr), sr);

        let cancel = CancelToken::new();
        cancel.cancel();
        match ingest_one(&db, &meta("a"), &mut src, &cancel) {
            Err(IngestError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }

        assert!(db.tracks().unwrap().is_empty());
        assert_eq!(db.stats().unwrap().postings, 0);
        let staged: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM pending_hashes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(staged, 0);
    }

    #[test]
    fn corrupt_source_aborts_the_ingest() {
        let db = Database::open_in_memory(&EngineParams::default()).unwrap();
        let sr = db.params().sample_rate;
        let samples = vec![f32::NAN; 3 * sr as usize];
        let mut src = BufferSource::new(samples, sr);

        match ingest_one(&db, &meta("bad"), &mut src, &CancelToken::new()) {
            Err(IngestError::Extract(ExtractError::CorruptInput { .. })) => {}
            other => panic!("expected CorruptInput, got {other:?}"),
        }
        assert!(db.tracks().unwrap().is_empty());
    }

    #[test]
    fn batch_driver_tallies_outcomes() {
        let db = Database::open_in_memory(&EngineParams::default()).unwrap();
        let sr = db.params().sample_rate;

        let jobs = vec![
            IngestJob {
                meta: meta("a"),
                source: Box::new(BufferSource::new(tones(5.0, sr), sr)),
            },
            IngestJob {
                meta: meta("b"),
                source: Box::new(BufferSource::new(vec![f32::NAN; 2 * sr as usize], sr)),
            },
        ];
        let report = ingest_tracks(&db, jobs, 2, &CancelToken::new());

        assert_eq!(report.ingested, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
        assert!(!report.cancelled);
        assert_eq!(db.tracks().unwrap().len(), 1);
    }
}

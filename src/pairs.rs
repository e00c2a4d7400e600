use crate::config::EngineParams;
use crate::peaks::{self, Peak};
use crate::source::{SampleSource, SourceError};
use crate::spectrum::{ExtractError, Stft};

/// Bit widths of the packed hash: `(f_anchor, f_target, dt)`.
/// Changing these requires bumping `config::HASH_LAYOUT_VERSION`.
pub const FREQ_BITS: u32 = 9;
pub const DT_BITS: u32 = 14;

const FREQ_MAX: u64 = (1 << FREQ_BITS) - 1;
const DT_MAX: u64 = (1 << DT_BITS) - 1;

/// A hashed peak pair with the anchor's frame time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: u64,
    pub anchor_time: u32,
}

/// Everything extracted from one audio stream.
pub struct Extraction {
    pub fingerprints: Vec<Fingerprint>,
    pub frame_count: u32,
}

/// Pack an anchor bin, target bin and frame delta into one hash.
/// Out-of-range fields saturate rather than wrap, so distant-but-distinct
/// peaks can collide at the boundary but never alias onto small values.
pub fn pack_hash(f_anchor: u16, f_target: u16, dt: u32) -> u64 {
    let fa = (f_anchor as u64).min(FREQ_MAX);
    let ft = (f_target as u64).min(FREQ_MAX);
    let dt = (dt as u64).min(DT_MAX);
    (fa << (FREQ_BITS + DT_BITS)) | (ft << DT_BITS) | dt
}

/// Inverse of `pack_hash`, for diagnostics and tests.
pub fn unpack_hash(hash: u64) -> (u16, u16, u32) {
    let dt = (hash & DT_MAX) as u32;
    let ft = ((hash >> DT_BITS) & FREQ_MAX) as u16;
    let fa = ((hash >> (FREQ_BITS + DT_BITS)) & FREQ_MAX) as u16;
    (fa, ft, dt)
}

/// Combine peaks into anchor/target pairs within the configured target
/// zone.
///
/// `peaks` must be sorted by `(t_frame, f_bin)` — the picker's output
/// order. Each anchor pairs with at most `fan_out` later peaks whose frame
/// distance lies in `[pair_dt_min, pair_dt_max]`, taken in ascending
/// `(t_frame, f_bin)` order. Output follows anchor order.
pub fn pair_peaks(peaks: &[Peak], params: &EngineParams) -> Vec<Fingerprint> {
    let mut out = Vec::new();

    for (i, anchor) in peaks.iter().enumerate() {
        let mut fanned = 0usize;
        for target in &peaks[i + 1..] {
            let dt = target.t_frame - anchor.t_frame;
            if dt < params.pair_dt_min {
                continue;
            }
            if dt > params.pair_dt_max {
                // Sorted input: every later target is at least this far away
                break;
            }
            out.push(Fingerprint {
                hash: pack_hash(anchor.f_bin, target.f_bin, dt),
                anchor_time: anchor.t_frame,
            });
            fanned += 1;
            if fanned == params.fan_out {
                break;
            }
        }
    }
    out
}

/// Run the whole extraction pipeline over a sample source: STFT frames,
/// peak picking, pairing. Used by both the ingest and query paths so the
/// two can never disagree on how a hash is produced.
pub fn extract<S: SampleSource + ?Sized>(
    source: &mut S,
    params: &EngineParams,
) -> Result<Extraction, ExtractError> {
    if source.sample_rate() != params.sample_rate {
        return Err(ExtractError::Source(SourceError::SampleRate {
            expected: params.sample_rate,
            found: source.sample_rate(),
        }));
    }

    let mut stft = Stft::new(params);
    let mut frames = Vec::new();
    while let Some(chunk) = source.next_chunk()? {
        stft.push(chunk, &mut frames);
    }
    stft.finish()?;

    let peaks = peaks::find_peaks(&frames, params);
    let fingerprints = pair_peaks(&peaks, params);

    Ok(Extraction {
        fingerprints,
        frame_count: frames.len() as u32,
    })
}

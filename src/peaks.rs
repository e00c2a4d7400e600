use crate::config::EngineParams;

/// A local maximum of the log-magnitude spectrogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub t_frame: u32,
    pub f_bin: u16,
    pub magnitude: f32,
}

/// Pick landmark peaks from a log-magnitude spectrogram.
///
/// A bin qualifies when it is strictly greater than every neighbor within
/// `±peak_time_radius` frames and `±peak_freq_radius` bins, and strictly
/// greater than the configured percentile of all magnitudes in its
/// one-second block. Survivors are then rate-limited to
/// `peak_density_per_sec` per second, keeping the loudest (ties go to the
/// lower bin, then the earlier frame). The result is sorted by
/// `(t_frame, f_bin)`.
pub fn find_peaks(frames: &[Vec<f32>], params: &EngineParams) -> Vec<Peak> {
    if frames.is_empty() || frames[0].is_empty() {
        return Vec::new();
    }

    let num_frames = frames.len();
    let num_bins = frames[0].len();
    let block_frames = (params.frames_per_sec().ceil() as usize).max(1);

    let mut candidates: Vec<Peak> = Vec::new();

    for block_start in (0..num_frames).step_by(block_frames) {
        let block_end = (block_start + block_frames).min(num_frames);
        let floor = block_percentile(&frames[block_start..block_end], params.peak_percentile);

        for t in block_start..block_end {
            for f in 0..num_bins {
                let mag = frames[t][f];
                if mag <= floor {
                    continue;
                }
                if is_local_max(frames, t, f, mag, params) {
                    candidates.push(Peak {
                        t_frame: t as u32,
                        f_bin: f.min(u16::MAX as usize) as u16,
                        magnitude: mag,
                    });
                }
            }
        }
    }

    let mut peaks = enforce_density(candidates, block_frames, params.peak_density_per_sec);
    peaks.sort_by_key(|p| (p.t_frame, p.f_bin));
    peaks
}

/// Strictly-greater test against the full neighborhood. Neighborhoods span
/// block boundaries; only the percentile floor is block-local.
fn is_local_max(frames: &[Vec<f32>], t: usize, f: usize, mag: f32, params: &EngineParams) -> bool {
    let t_start = t.saturating_sub(params.peak_time_radius);
    let t_end = (t + params.peak_time_radius + 1).min(frames.len());
    let f_start = f.saturating_sub(params.peak_freq_radius);
    let f_end = (f + params.peak_freq_radius + 1).min(frames[0].len());

    for nt in t_start..t_end {
        for nf in f_start..f_end {
            if nt == t && nf == f {
                continue;
            }
            if frames[nt][nf] >= mag {
                return false;
            }
        }
    }
    true
}

/// Percentile of all magnitudes in a block of frames, via partial sort.
fn block_percentile(block: &[Vec<f32>], percentile: f32) -> f32 {
    let mut pool: Vec<f32> = block.iter().flatten().copied().collect();
    if pool.is_empty() {
        return 0.0;
    }
    let idx = ((percentile / 100.0) * (pool.len() - 1) as f32).round() as usize;
    let idx = idx.min(pool.len() - 1);
    pool.select_nth_unstable_by(idx, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    pool[idx]
}

/// Cap peaks per one-second bucket, keeping the loudest.
fn enforce_density(candidates: Vec<Peak>, block_frames: usize, cap: usize) -> Vec<Peak> {
    if cap == 0 {
        return Vec::new();
    }

    let mut buckets: Vec<Vec<Peak>> = Vec::new();
    for p in candidates {
        let bucket = p.t_frame as usize / block_frames;
        if bucket >= buckets.len() {
            buckets.resize_with(bucket + 1, Vec::new);
        }
        buckets[bucket].push(p);
    }

    let mut kept = Vec::new();
    for mut bucket in buckets {
        if bucket.len() > cap {
            bucket.sort_by(|a, b| {
                b.magnitude
                    .partial_cmp(&a.magnitude)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.f_bin.cmp(&b.f_bin))
                    .then(a.t_frame.cmp(&b.t_frame))
            });
            bucket.truncate(cap);
        }
        kept.extend(bucket);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_frames(num_frames: usize, num_bins: usize) -> Vec<Vec<f32>> {
        vec![vec![0.0; num_bins]; num_frames]
    }

    #[test]
    fn empty_spectrogram() {
        let params = EngineParams::default();
        assert!(find_peaks(&[], &params).is_empty());
    }

    #[test]
    fn isolated_spike_is_found() {
        let params = EngineParams::default();
        let mut frames = quiet_frames(50, 200);
        frames[10][50] = 5.0;

        let peaks = find_peaks(&frames, &params);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].t_frame, 10);
        assert_eq!(peaks[0].f_bin, 50);
    }

    #[test]
    fn plateau_is_not_a_peak() {
        let params = EngineParams::default();
        let mut frames = quiet_frames(50, 200);
        frames[10][50] = 5.0;
        frames[10][51] = 5.0;

        assert!(find_peaks(&frames, &params).is_empty());
    }

    #[test]
    fn neighborhood_suppresses_weaker_bin() {
        let params = EngineParams::default();
        let mut frames = quiet_frames(50, 200);
        frames[10][50] = 5.0;
        // Within ±20 bins of the first spike
        frames[10][60] = 4.0;
        // Far enough in frequency to stand alone
        frames[10][100] = 3.0;

        let peaks = find_peaks(&frames, &params);
        let bins: Vec<u16> = peaks.iter().map(|p| p.f_bin).collect();
        assert_eq!(bins, vec![50, 100]);
    }

    #[test]
    fn uniform_signal_has_no_peaks() {
        let params = EngineParams::default();
        let frames = vec![vec![1.0; 200]; 50];
        assert!(find_peaks(&frames, &params).is_empty());
    }

    #[test]
    fn density_cap_keeps_the_loudest() {
        let params = EngineParams::default();
        let block = params.frames_per_sec().ceil() as usize;
        let mut frames = quiet_frames(block, 1025);

        // Spread spikes across frames and bins so none share a neighborhood:
        // frames 0,4,8,... and bins 30,72,114,... (42 bins apart).
        let mut placed = 0u32;
        for (i, t) in (0..block).step_by(4).enumerate() {
            for (j, f) in (30..1020).step_by(42).enumerate() {
                frames[t][f] = 10.0 + (i * 24 + j) as f32 * 0.01;
                placed += 1;
            }
        }
        assert!(placed as usize > params.peak_density_per_sec);

        let peaks = find_peaks(&frames, &params);
        assert_eq!(peaks.len(), params.peak_density_per_sec);

        // The globally loudest spike must survive the cap
        let loudest = peaks
            .iter()
            .map(|p| p.magnitude)
            .fold(f32::MIN, f32::max);
        let expected_max = 10.0 + ((block.div_ceil(4) - 1) * 24 + 23) as f32 * 0.01;
        assert!((loudest - expected_max).abs() < 1e-4);
    }

    #[test]
    fn output_is_sorted_by_time_then_bin() {
        let params = EngineParams::default();
        let mut frames = quiet_frames(60, 400);
        frames[40][300] = 5.0;
        frames[40][100] = 5.5;
        frames[5][200] = 6.0;

        let peaks = find_peaks(&frames, &params);
        let coords: Vec<(u32, u16)> = peaks.iter().map(|p| (p.t_frame, p.f_bin)).collect();
        assert_eq!(coords, vec![(5, 200), (40, 100), (40, 300)]);
    }
}

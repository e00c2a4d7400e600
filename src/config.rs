use directories::ProjectDirs;
use std::path::PathBuf;

/// Version of the hash bit layout. Bumped whenever the packing in
/// `pairs::pack_hash` changes; stores written under a different version
/// refuse to open.
pub const HASH_LAYOUT_VERSION: u32 = 1;

/// Parameters of the fingerprinting pipeline.
///
/// Every field here is baked into the hashes a store contains, so the full
/// set is recorded in the store's `meta` table at creation and verified on
/// every open. Two builds with different parameters cannot share a store.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    /// Input sample rate in Hz. The decoder boundary resamples to this.
    pub sample_rate: u32,
    /// STFT window length in samples.
    pub window_size: usize,
    /// STFT hop in samples.
    pub hop_size: usize,
    /// Peak neighborhood radius in frames.
    pub peak_time_radius: usize,
    /// Peak neighborhood radius in frequency bins.
    pub peak_freq_radius: usize,
    /// Percentile (0-100) of block magnitudes a peak must clear.
    pub peak_percentile: f32,
    /// Maximum retained peaks per second of audio.
    pub peak_density_per_sec: usize,
    /// Minimum anchor-to-target distance in frames.
    pub pair_dt_min: u32,
    /// Maximum anchor-to-target distance in frames.
    pub pair_dt_max: u32,
    /// Maximum targets paired with each anchor.
    pub fan_out: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            window_size: 2048,
            hop_size: 512,
            peak_time_radius: 3,
            peak_freq_radius: 20,
            peak_percentile: 85.0,
            peak_density_per_sec: 30,
            pair_dt_min: 1,
            pair_dt_max: 100,
            fan_out: 5,
        }
    }
}

impl EngineParams {
    /// Number of STFT frames per second of audio.
    pub fn frames_per_sec(&self) -> f64 {
        self.sample_rate as f64 / self.hop_size as f64
    }

    /// Duration of one STFT frame in seconds.
    pub fn frame_secs(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }

    /// Number of magnitude bins per frame (real FFT keeps W/2 + 1).
    pub fn bins_per_frame(&self) -> usize {
        self.window_size / 2 + 1
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("tapeid.db")
    } else {
        // Fallback: current directory
        PathBuf::from("tapeid.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_timing() {
        let p = EngineParams::default();
        assert!((p.frames_per_sec() - 43.066).abs() < 0.01);
        assert!((p.frame_secs() - 0.02322).abs() < 0.0001);
        assert_eq!(p.bins_per_frame(), 1025);
    }
}

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample rate mismatch: source is {found} Hz, engine expects {expected} Hz")]
    SampleRate { expected: u32, found: u32 },
}

/// Boundary to the upstream decoder.
///
/// A decoder hands the engine mono PCM at the engine's sample rate; any
/// demuxing, codec work or resampling happens on the other side of this
/// trait. The engine pulls chunks until `next_chunk` returns `None`.
pub trait SampleSource {
    /// Sample rate of the stream in Hz.
    fn sample_rate(&self) -> u32;

    /// Next chunk of mono samples, or `None` at end of stream. Chunk sizes
    /// are the source's choice; the engine buffers across boundaries.
    fn next_chunk(&mut self) -> Result<Option<&[f32]>, SourceError>;
}

/// An in-memory source, for embedders that already hold the samples.
pub struct BufferSource {
    samples: Vec<f32>,
    sample_rate: u32,
    pos: usize,
    chunk_len: usize,
}

impl BufferSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            pos: 0,
            chunk_len: 8192,
        }
    }
}

impl SampleSource for BufferSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_chunk(&mut self) -> Result<Option<&[f32]>, SourceError> {
        if self.pos >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.pos + self.chunk_len).min(self.samples.len());
        let chunk = &self.samples[self.pos..end];
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// Headerless little-endian `f32` mono PCM read from disk.
///
/// This is the one on-disk format the CLI accepts directly; everything
/// else is expected to be converted upstream (e.g. `ffmpeg -f f32le`).
pub struct RawPcmFile {
    reader: BufReader<File>,
    sample_rate: u32,
    bytes: Vec<u8>,
    /// Trailing bytes of the previous read that did not complete a sample.
    remainder: Vec<u8>,
    samples: Vec<f32>,
}

const READ_LEN: usize = 64 * 1024;

impl RawPcmFile {
    pub fn open(path: &Path, sample_rate: u32) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            sample_rate,
            bytes: vec![0u8; READ_LEN],
            remainder: Vec::with_capacity(4),
            samples: Vec::with_capacity(READ_LEN / 4 + 1),
        })
    }
}

impl SampleSource for RawPcmFile {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_chunk(&mut self) -> Result<Option<&[f32]>, SourceError> {
        let n = self.reader.read(&mut self.bytes)?;
        if n == 0 {
            // A torn trailing sample is dropped
            return Ok(None);
        }

        self.samples.clear();
        let mut pending = std::mem::take(&mut self.remainder);
        pending.extend_from_slice(&self.bytes[..n]);

        let whole = pending.len() / 4 * 4;
        for quad in pending[..whole].chunks_exact(4) {
            self.samples
                .push(f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
        }
        self.remainder = pending[whole..].to_vec();

        Ok(Some(&self.samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_source_walks_the_whole_buffer() {
        let samples: Vec<f32> = (0..20000).map(|i| i as f32).collect();
        let mut src = BufferSource::new(samples.clone(), 22050);

        let mut seen = Vec::new();
        while let Some(chunk) = src.next_chunk().unwrap() {
            seen.extend_from_slice(chunk);
        }
        assert_eq!(seen, samples);
    }

    #[test]
    fn empty_buffer_ends_immediately() {
        let mut src = BufferSource::new(Vec::new(), 22050);
        assert!(src.next_chunk().unwrap().is_none());
    }

    #[test]
    fn raw_pcm_file_round_trip() {
        let samples: Vec<f32> = (0..5000).map(|i| (i as f32 * 0.001).sin()).collect();
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let path = std::env::temp_dir().join("tapeid_test_roundtrip.f32");
        std::fs::write(&path, &bytes).unwrap();

        let mut src = RawPcmFile::open(&path, 22050).unwrap();
        let mut seen = Vec::new();
        while let Some(chunk) = src.next_chunk().unwrap() {
            seen.extend_from_slice(chunk);
        }
        std::fs::remove_file(&path).ok();

        assert_eq!(seen, samples);
    }
}

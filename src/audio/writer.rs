//! WAV writer for one segment
//!
//! The RIFF header is written when the file is opened and its length fields
//! are patched on `close()`, so a segment with zero frames is still a valid
//! container.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};

use super::capture::{AudioError, CaptureFormat};

pub struct SegmentWriter {
    path: PathBuf,
    format: CaptureFormat,
    writer: Option<WavWriter<BufWriter<File>>>,
    /// Samples of an incomplete frame carried to the next write
    carry: Vec<i16>,
    frames_written: u64,
}

impl SegmentWriter {
    /// Create a new file at `path`; fails if something already exists there.
    pub fn create(path: &Path, format: CaptureFormat) -> Result<Self, AudioError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| AudioError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_file(file, path.to_path_buf(), format)
    }

    /// Wrap a file that was already claimed for this segment.
    pub fn from_file(file: File, path: PathBuf, format: CaptureFormat) -> Result<Self, AudioError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = WavWriter::new(BufWriter::new(file), spec)
            .map_err(|e| AudioError::Io(format!("{}: {}", path.display(), e)))?;

        log::debug!("Segment file opened: {:?} ({})", path, format);

        Ok(Self {
            path,
            format,
            writer: Some(writer),
            carry: Vec::new(),
            frames_written: 0,
        })
    }

    /// Append interleaved samples. Only whole frames reach the file.
    pub fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| AudioError::Io("segment file already closed".to_string()))?;

        let channels = self.format.channels.max(1) as usize;
        self.carry.extend_from_slice(samples);
        let whole = self.carry.len() - self.carry.len() % channels;

        for &sample in &self.carry[..whole] {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::Io(e.to_string()))?;
        }

        self.frames_written += (whole / channels) as u64;
        self.carry.drain(..whole);
        Ok(())
    }

    /// Finalize the header. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), AudioError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        if !self.carry.is_empty() {
            log::debug!(
                "Dropping {} samples of an incomplete frame in {:?}",
                self.carry.len(),
                self.path
            );
            self.carry.clear();
        }

        writer
            .finalize()
            .map_err(|e| AudioError::Io(e.to_string()))?;

        log::info!(
            "Segment file finalized: {:?} ({} frames)",
            self.path,
            self.frames_written
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Size of the PCM payload written so far.
    pub fn data_bytes(&self) -> u64 {
        self.frames_written * self.format.bytes_per_frame()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to finalize {:?} on drop: {}", self.path, e);
        }
    }
}

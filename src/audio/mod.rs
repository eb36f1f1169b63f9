//! Audio side of the recorder
//!
//! Loopback capture via CPAL, one WAV file per segment via hound, and a peak
//! meter fed from the same chunk stream.

pub mod capture;
pub mod meter;
pub mod paths;
pub mod session;
pub mod writer;

pub use capture::{
    chunk_channel, AudioError, CaptureFormat, CaptureMessage, CaptureSource, CaptureSourceFactory,
    ChunkReceiver, ChunkSender, LoopbackSource, CHUNK_CHANNEL_CAPACITY,
};
pub use meter::{amplitude_to_db, LevelMeter, LiveLevel, MAX_DB, MIN_DB};
pub use paths::{
    allocate_segment_path, default_output_dir, encoded_path_for, sanitize_file_stem,
    AllocatedPath, ENCODED_EXTENSION, RAW_EXTENSION,
};
pub use session::{CaptureSession, FaultNotifier, FinishedSegment, SessionFault};
pub use writer::SegmentWriter;

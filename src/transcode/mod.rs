//! Background conversion of finished segments
//!
//! A `TranscodeJob` is built for every segment worth keeping. The queue runs
//! each job through an external encoder with tags derived from the label,
//! bounds it with a timeout and removes the raw file once the encoded file is
//! in place.

mod encoder;
mod queue;

pub use encoder::{Encoder, LameEncoder};
pub use queue::{
    JobStatus, QueueConfig, TranscodeQueue, TranscodeReport, TranscodeSuccess,
};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::audio::{encoded_path_for, FinishedSegment};

/// Errors that end a transcode job.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeError {
    /// Encoder ran past the deadline and was killed
    Timeout(Duration),
    /// Encoder exited with a failure status
    EncoderFailed(String),
    /// Encoder exited cleanly but produced nothing
    OutputMissing(PathBuf),
    SpawnFailed(String),
    /// Another job for the same output is still in flight
    DuplicateTarget(PathBuf),
}

impl fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscodeError::Timeout(d) => {
                write!(f, "Encoder did not finish within {}s", d.as_secs_f64())
            }
            TranscodeError::EncoderFailed(e) => write!(f, "Encoder failed: {}", e),
            TranscodeError::OutputMissing(p) => {
                write!(f, "Encoder produced no output at {:?}", p)
            }
            TranscodeError::SpawnFailed(e) => write!(f, "Failed to start encoder: {}", e),
            TranscodeError::DuplicateTarget(p) => {
                write!(f, "A job for {:?} is already running", p)
            }
        }
    }
}

impl std::error::Error for TranscodeError {}

/// Artist/title pair written into the encoded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mp3Tag {
    pub artist: String,
    pub title: String,
}

impl Mp3Tag {
    /// Best-effort split of an "Artist - Title" label.
    ///
    /// Splits once at the first `" - "`, falling back to the first `-`. When
    /// either half would be empty the whole label becomes the title.
    pub fn from_label(label: &str) -> Self {
        let split = label
            .split_once(" - ")
            .or_else(|| label.split_once('-'))
            .map(|(artist, title)| (artist.trim(), title.trim()));

        match split {
            Some((artist, title)) if !artist.is_empty() && !title.is_empty() => Self {
                artist: artist.to_string(),
                title: title.to_string(),
            },
            _ => Self {
                artist: String::new(),
                title: label.trim().to_string(),
            },
        }
    }
}

/// One raw file to convert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub label: String,
    pub raw_path: PathBuf,
    pub target_path: PathBuf,
    pub bitrate_kbps: u32,
    pub tag: Mp3Tag,
}

impl TranscodeJob {
    pub fn new(id: Uuid, label: &str, raw_path: PathBuf, bitrate_kbps: u32) -> Self {
        Self {
            id,
            label: label.to_string(),
            target_path: encoded_path_for(&raw_path),
            raw_path,
            bitrate_kbps,
            tag: Mp3Tag::from_label(label),
        }
    }

    pub fn for_segment(segment: &FinishedSegment, bitrate_kbps: u32) -> Self {
        Self::new(segment.id, &segment.label, segment.path.clone(), bitrate_kbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_splits_artist_and_title() {
        assert_eq!(
            Mp3Tag::from_label("Daft Punk - One More Time"),
            Mp3Tag {
                artist: "Daft Punk".into(),
                title: "One More Time".into()
            }
        );
    }

    #[test]
    fn tag_without_separator_is_all_title() {
        assert_eq!(
            Mp3Tag::from_label("Untitled"),
            Mp3Tag {
                artist: String::new(),
                title: "Untitled".into()
            }
        );
    }

    #[test]
    fn tag_splits_only_once() {
        let tag = Mp3Tag::from_label("A - B - C");
        assert_eq!(tag.artist, "A");
        assert_eq!(tag.title, "B - C");
    }

    #[test]
    fn tag_falls_back_to_bare_hyphen() {
        let tag = Mp3Tag::from_label("Artist-Title");
        assert_eq!(tag.artist, "Artist");
        assert_eq!(tag.title, "Title");
    }

    #[test]
    fn tag_with_empty_half_keeps_label() {
        let tag = Mp3Tag::from_label("-Intro");
        assert_eq!(tag.artist, "");
        assert_eq!(tag.title, "-Intro");
    }

    #[test]
    fn job_targets_sibling_mp3() {
        let job = TranscodeJob::new(
            Uuid::new_v4(),
            "Daft Punk - One More Time",
            PathBuf::from("/music/Daft Punk - One More Time.wav"),
            192,
        );
        assert_eq!(
            job.target_path,
            PathBuf::from("/music/Daft Punk - One More Time.mp3")
        );
        assert_eq!(job.tag.artist, "Daft Punk");
        assert_eq!(job.bitrate_kbps, 192);
    }
}

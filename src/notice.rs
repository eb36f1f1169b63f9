//! User-visible notices
//!
//! Failures the recorder recovers from (and a couple of informational events)
//! are pushed to whoever displays them. Nothing here blocks: the channel is
//! unbounded and a missing listener is fine.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::audio::{AudioError, SessionFault};
use crate::transcode::TranscodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeKind {
    DeviceUnavailable,
    DeviceLost,
    IoFault,
    EncodeTimeout,
    EncodeFailure,
    FileConflict,
    /// Segment shorter than the skip threshold was dropped
    SegmentSkipped,
    /// An encoded track was added to the library
    RecordingSaved,
}

impl NoticeKind {
    pub fn is_error(self) -> bool {
        !matches!(self, NoticeKind::SegmentSkipped | NoticeKind::RecordingSaved)
    }
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NoticeKind::DeviceUnavailable => "device unavailable",
            NoticeKind::DeviceLost => "device lost",
            NoticeKind::IoFault => "write failed",
            NoticeKind::EncodeTimeout => "encoder timed out",
            NoticeKind::EncodeFailure => "encoder failed",
            NoticeKind::FileConflict => "file conflict",
            NoticeKind::SegmentSkipped => "segment skipped",
            NoticeKind::RecordingSaved => "recording saved",
        };
        f.write_str(name)
    }
}

impl From<&AudioError> for NoticeKind {
    fn from(e: &AudioError) -> Self {
        match e {
            AudioError::DeviceUnavailable(_)
            | AudioError::StreamFailed(_)
            | AudioError::UnsupportedFormat(_) => NoticeKind::DeviceUnavailable,
            AudioError::DeviceLost(_) => NoticeKind::DeviceLost,
            AudioError::FileConflict(_) => NoticeKind::FileConflict,
            AudioError::Io(_) => NoticeKind::IoFault,
        }
    }
}

impl From<&SessionFault> for NoticeKind {
    fn from(f: &SessionFault) -> Self {
        match f {
            SessionFault::Io(_) => NoticeKind::IoFault,
            SessionFault::DeviceLost(_) => NoticeKind::DeviceLost,
        }
    }
}

impl From<&TranscodeError> for NoticeKind {
    fn from(e: &TranscodeError) -> Self {
        match e {
            TranscodeError::Timeout(_) => NoticeKind::EncodeTimeout,
            TranscodeError::DuplicateTarget(_) => NoticeKind::FileConflict,
            TranscodeError::EncoderFailed(_)
            | TranscodeError::OutputMissing(_)
            | TranscodeError::SpawnFailed(_) => NoticeKind::EncodeFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub at: DateTime<Local>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Local::now(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

/// Log a notice and hand it to the listener, if any.
pub fn notify(tx: &NoticeSender, kind: NoticeKind, message: impl Into<String>) {
    let notice = Notice::new(kind, message);
    if kind.is_error() {
        log::warn!("Notice: {}", notice);
    } else {
        log::info!("Notice: {}", notice);
    }
    let _ = tx.send(notice);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_kinds_follow_their_source() {
        assert_eq!(
            NoticeKind::from(&AudioError::DeviceUnavailable("x".into())),
            NoticeKind::DeviceUnavailable
        );
        assert_eq!(
            NoticeKind::from(&SessionFault::Io("disk full".into())),
            NoticeKind::IoFault
        );
        assert_eq!(
            NoticeKind::from(&TranscodeError::Timeout(Duration::from_secs(20))),
            NoticeKind::EncodeTimeout
        );
        assert_eq!(
            NoticeKind::from(&TranscodeError::OutputMissing("a.mp3".into())),
            NoticeKind::EncodeFailure
        );
    }

    #[test]
    fn notify_delivers_and_tolerates_no_listener() {
        let (tx, mut rx) = notice_channel();
        notify(&tx, NoticeKind::SegmentSkipped, "too short");
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.kind, NoticeKind::SegmentSkipped);
        assert_eq!(notice.to_string(), "[segment skipped] too short");
        assert!(!notice.kind.is_error());

        drop(rx);
        notify(&tx, NoticeKind::DeviceLost, "gone");
    }
}

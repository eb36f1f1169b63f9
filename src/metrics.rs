//! Metrics collection for songcap
//!
//! Tracks per-segment timing, sizes, outcomes and error history, plus a short
//! timeline of writer open/close events that shows sessions never overlap.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::audio::FinishedSegment;

/// Maximum number of finished segments to retain in history
const MAX_SEGMENT_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Maximum number of writer open/close events to retain
const MAX_TIMELINE: usize = 200;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentOutcome {
    /// Handed to the transcode queue, result pending
    Queued,
    Transcoded,
    /// Under the skip threshold, raw file removed
    Skipped,
    Failed,
}

/// Metrics for one recorded segment
#[derive(Debug, Clone, Serialize)]
pub struct SegmentMetrics {
    pub segment_id: String,
    pub label: String,
    /// Unix timestamp when the segment started (seconds)
    pub started_at: u64,
    /// Measured segment duration in milliseconds
    pub duration_ms: u64,
    /// PCM bytes written
    pub audio_bytes: u64,
    pub frames: u64,
    pub outcome: SegmentOutcome,
    /// Encoder wall time in milliseconds, once the job finished
    pub transcode_duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded segments
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub segments_recorded: u64,
    pub segments_transcoded: u64,
    pub segments_skipped: u64,
    pub segments_failed: u64,
    /// Average duration (ms) of segments that were kept
    pub avg_segment_duration_ms: u64,
    /// Average encoder time (ms) across successful transcodes
    pub avg_transcode_duration_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "capture", "transcode", "library")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Associated segment ID, if applicable
    pub segment_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimelineEvent {
    WriterOpened,
    WriterClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    /// Monotonic sequence number; orders entries across threads
    pub seq: u64,
    pub segment_id: Uuid,
    pub event: TimelineEvent,
}

/// Collects and stores metrics for recorded segments
pub struct MetricsCollector {
    /// Finished segments (newest first)
    history: VecDeque<SegmentMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    /// Writer open/close events (oldest first)
    timeline: VecDeque<TimelineEntry>,
    next_seq: u64,
    segments_recorded: u64,
    segments_transcoded: u64,
    segments_skipped: u64,
    segments_failed: u64,
    transcode_time_total: Duration,
}

impl MetricsCollector {
    /// Create a new empty metrics collector
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SEGMENT_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            timeline: VecDeque::with_capacity(MAX_TIMELINE),
            next_seq: 0,
            segments_recorded: 0,
            segments_transcoded: 0,
            segments_skipped: 0,
            segments_failed: 0,
            transcode_time_total: Duration::ZERO,
        }
    }

    pub fn writer_opened(&mut self, segment_id: Uuid) {
        self.push_timeline(segment_id, TimelineEvent::WriterOpened);
    }

    pub fn writer_closed(&mut self, segment_id: Uuid) {
        self.push_timeline(segment_id, TimelineEvent::WriterClosed);
    }

    /// Record a stopped segment and what the controller decided to do with it
    pub fn segment_finished(&mut self, segment: &FinishedSegment, outcome: SegmentOutcome) {
        self.segments_recorded += 1;
        match outcome {
            SegmentOutcome::Skipped => self.segments_skipped += 1,
            SegmentOutcome::Failed => self.segments_failed += 1,
            SegmentOutcome::Queued | SegmentOutcome::Transcoded => {}
        }

        let metrics = SegmentMetrics {
            segment_id: segment.id.to_string(),
            label: segment.label.clone(),
            started_at: segment.started_at.timestamp().max(0) as u64,
            duration_ms: segment.duration.as_millis() as u64,
            audio_bytes: segment.bytes,
            frames: segment.frames,
            outcome,
            transcode_duration_ms: None,
            error_message: segment.fault.as_ref().map(|f| f.to_string()),
        };

        log::info!(
            "Metrics: segment {} {:?} - {}ms, {} bytes",
            metrics.segment_id,
            outcome,
            metrics.duration_ms,
            metrics.audio_bytes
        );

        self.history.push_front(metrics);
        while self.history.len() > MAX_SEGMENT_HISTORY {
            self.history.pop_back();
        }
    }

    /// Record the end of a transcode job for a segment
    pub fn transcode_finished(
        &mut self,
        segment_id: Uuid,
        elapsed: Duration,
        result: Result<(), String>,
    ) {
        let id = segment_id.to_string();
        let entry = self.history.iter_mut().find(|m| m.segment_id == id);

        match &result {
            Ok(()) => {
                self.segments_transcoded += 1;
                self.transcode_time_total += elapsed;
            }
            Err(_) => self.segments_failed += 1,
        }

        if let Some(entry) = entry {
            entry.transcode_duration_ms = Some(elapsed.as_millis() as u64);
            match result {
                Ok(()) => entry.outcome = SegmentOutcome::Transcoded,
                Err(e) => {
                    entry.outcome = SegmentOutcome::Failed;
                    entry.error_message = Some(e);
                }
            }
        } else {
            log::debug!("Metrics: transcode for unknown segment {}", segment_id);
        }
    }

    /// Record an error (not necessarily tied to a segment)
    pub fn record_error(&mut self, error_type: &str, message: String, segment_id: Option<Uuid>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type: error_type.to_string(),
            message,
            segment_id: segment_id.map(|id| id.to_string()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let kept: Vec<_> = self
            .history
            .iter()
            .filter(|m| m.outcome != SegmentOutcome::Skipped)
            .collect();
        let avg_segment = if kept.is_empty() {
            0
        } else {
            kept.iter().map(|m| m.duration_ms).sum::<u64>() / kept.len() as u64
        };

        let avg_transcode = if self.segments_transcoded > 0 {
            self.transcode_time_total.as_millis() as u64 / self.segments_transcoded
        } else {
            0
        };

        MetricsSummary {
            segments_recorded: self.segments_recorded,
            segments_transcoded: self.segments_transcoded,
            segments_skipped: self.segments_skipped,
            segments_failed: self.segments_failed,
            avg_segment_duration_ms: avg_segment,
            avg_transcode_duration_ms: avg_transcode,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished segments (newest first)
    pub fn history(&self) -> Vec<SegmentMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors (newest first)
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    /// Writer events (oldest first)
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.timeline.iter().cloned().collect()
    }

    /// Highest number of writers open at once according to the timeline
    pub fn max_concurrent_writers(&self) -> usize {
        let mut open = 0usize;
        let mut max = 0usize;
        for entry in &self.timeline {
            match entry.event {
                TimelineEvent::WriterOpened => {
                    open += 1;
                    max = max.max(open);
                }
                TimelineEvent::WriterClosed => open = open.saturating_sub(1),
            }
        }
        max
    }

    fn push_timeline(&mut self, segment_id: Uuid, event: TimelineEvent) {
        let entry = TimelineEntry {
            seq: self.next_seq,
            segment_id,
            event,
        };
        self.next_seq += 1;
        log::debug!("Metrics: {:?} for segment {}", event, segment_id);

        self.timeline.push_back(entry);
        while self.timeline.len() > MAX_TIMELINE {
            self.timeline.pop_front();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

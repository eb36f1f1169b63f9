//! Segmentation state machine
//!
//! All transitions go through `reduce()`, which returns the next state and the
//! effects to execute. The reducer never touches audio or files; the effect
//! runner does, and reports back with events. Segment ids guard against
//! events from sessions that are no longer current.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::{AudioError, FinishedSegment, SessionFault};
use crate::notice::NoticeKind;

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Recording {
        segment_id: Uuid,
        label: String,
        started_at: Instant,
        /// Threshold in force when the session started
        skip_threshold: Option<Duration>,
    },
}

/// Authoritative controller state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub phase: Phase,
    /// Last label reported by the monitor
    pub label: String,
    /// When false, label changes are tracked but nothing is recorded
    pub armed: bool,
    /// Applied to sessions started from now on
    pub skip_threshold: Option<Duration>,
}

impl State {
    pub fn new(armed: bool, skip_threshold: Option<Duration>) -> Self {
        Self {
            phase: Phase::Idle,
            label: String::new(),
            armed,
            skip_threshold,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.phase, Phase::Recording { .. })
    }

    pub fn active_segment(&self) -> Option<Uuid> {
        match &self.phase {
            Phase::Recording { segment_id, .. } => Some(*segment_id),
            Phase::Idle => None,
        }
    }

    /// Short name for logs.
    pub fn describe(&self) -> String {
        match &self.phase {
            Phase::Idle if self.armed => "Idle(armed)".to_string(),
            Phase::Idle => "Idle".to_string(),
            Phase::Recording { label, .. } => format!("Recording({:?})", label),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(false, None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// First label seen by the monitor; displayed, never a boundary
    LabelBaseline {
        label: String,
    },
    /// Label differs from the previously polled one
    LabelChanged {
        label: String,
    },
    StartRequested,
    StopRequested,
    SkipThresholdChanged {
        threshold: Option<Duration>,
    },

    // Session events
    SessionStartFailed {
        id: Uuid,
        err: AudioError,
    },
    /// Raised from the segment worker while the session is still open
    SessionFault {
        id: Uuid,
        fault: SessionFault,
    },
    /// The writer is closed and the duration final
    SessionStopped {
        segment: FinishedSegment,
        skip_threshold: Option<Duration>,
    },

    /// Application exit requested
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartSession {
        id: Uuid,
        label: String,
    },
    /// Must complete (file closed) before any later effect runs
    StopSession {
        id: Uuid,
        skip_threshold: Option<Duration>,
    },
    EnqueueTranscode {
        segment: FinishedSegment,
    },
    /// Remove a segment that fell under the skip threshold
    DiscardSegment {
        segment: FinishedSegment,
        threshold: Duration,
    },
    /// Keep a faulted segment's raw file and report it
    RetainFailedSegment {
        segment: FinishedSegment,
        fault: SessionFault,
    },
    Notify {
        kind: NoticeKind,
        message: String,
    },
    EmitUi,
}

fn begin_segment(state: &State, label: &str) -> (Phase, Effect) {
    let id = Uuid::new_v4();
    (
        Phase::Recording {
            segment_id: id,
            label: label.to_string(),
            started_at: Instant::now(),
            skip_threshold: state.skip_threshold,
        },
        Effect::StartSession {
            id,
            label: label.to_string(),
        },
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - At most one session is open; a stop is always issued before the next start
/// - Events carrying a segment id that is not the active one are ignored
/// - EmitUi follows every change visible to the UI
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let mut next = state.clone();

    match (&state.phase, event) {
        // -----------------
        // Labels
        // -----------------
        (_, LabelBaseline { label }) => {
            next.label = label;
            (next, vec![EmitUi])
        }

        (Phase::Idle, LabelChanged { label }) => {
            next.label = label;
            let mut effects = Vec::new();
            if next.armed && !next.label.is_empty() {
                let (phase, start) = begin_segment(&next, &next.label);
                next.phase = phase;
                effects.push(start);
            }
            effects.push(EmitUi);
            (next, effects)
        }

        (
            Phase::Recording {
                segment_id,
                label: current,
                skip_threshold,
                ..
            },
            LabelChanged { label },
        ) => {
            if *current == label {
                next.label = label;
                return (next, vec![]);
            }

            let mut effects = vec![StopSession {
                id: *segment_id,
                skip_threshold: *skip_threshold,
            }];
            next.label = label;
            next.phase = Phase::Idle;
            if next.armed && !next.label.is_empty() {
                let (phase, start) = begin_segment(&next, &next.label);
                next.phase = phase;
                effects.push(start);
            }
            effects.push(EmitUi);
            (next, effects)
        }

        // -----------------
        // User requests
        // -----------------
        (Phase::Idle, StartRequested) => {
            next.armed = true;
            let mut effects = Vec::new();
            if !next.label.is_empty() {
                let (phase, start) = begin_segment(&next, &next.label);
                next.phase = phase;
                effects.push(start);
            }
            effects.push(EmitUi);
            (next, effects)
        }
        (Phase::Recording { .. }, StartRequested) => {
            next.armed = true;
            (next, vec![])
        }

        (
            Phase::Recording {
                segment_id,
                skip_threshold,
                ..
            },
            StopRequested,
        ) => {
            next.armed = false;
            next.phase = Phase::Idle;
            (
                next,
                vec![
                    StopSession {
                        id: *segment_id,
                        skip_threshold: *skip_threshold,
                    },
                    EmitUi,
                ],
            )
        }
        (Phase::Idle, StopRequested) => {
            if !state.armed {
                return (next, vec![]);
            }
            next.armed = false;
            (next, vec![EmitUi])
        }

        (_, SkipThresholdChanged { threshold }) => {
            next.skip_threshold = threshold;
            (next, vec![])
        }

        // -----------------
        // Session lifecycle
        // -----------------
        (Phase::Recording { segment_id, label, .. }, SessionStartFailed { id, err })
            if *segment_id == id =>
        {
            next.phase = Phase::Idle;
            (
                next,
                vec![
                    Notify {
                        kind: NoticeKind::from(&err),
                        message: format!("Could not start recording {:?}: {}", label, err),
                    },
                    EmitUi,
                ],
            )
        }

        (
            Phase::Recording {
                segment_id,
                skip_threshold,
                ..
            },
            Event::SessionFault { id, .. },
        ) if *segment_id == id => {
            next.phase = Phase::Idle;
            (
                next,
                vec![
                    StopSession {
                        id,
                        skip_threshold: *skip_threshold,
                    },
                    EmitUi,
                ],
            )
        }

        // A stopped segment is judged on its own, whatever is active now.
        (
            _,
            SessionStopped {
                segment,
                skip_threshold,
            },
        ) => {
            if let Some(fault) = segment.fault.clone() {
                let message = format!("Recording of {:?} failed: {}", segment.label, fault);
                return (
                    next,
                    vec![
                        RetainFailedSegment { segment, fault: fault.clone() },
                        Notify {
                            kind: NoticeKind::from(&fault),
                            message,
                        },
                    ],
                );
            }

            match skip_threshold {
                Some(threshold) if segment.duration < threshold => {
                    let message = format!(
                        "Skipped {:?} ({:.1}s is under {}s)",
                        segment.label,
                        segment.duration.as_secs_f64(),
                        threshold.as_secs()
                    );
                    (
                        next,
                        vec![
                            DiscardSegment { segment, threshold },
                            Notify {
                                kind: NoticeKind::SegmentSkipped,
                                message,
                            },
                        ],
                    )
                }
                _ => (next, vec![EnqueueTranscode { segment }]),
            }
        }

        // -----------------
        // Exit
        // -----------------
        (
            Phase::Recording {
                segment_id,
                skip_threshold,
                ..
            },
            Exit,
        ) => {
            next.armed = false;
            next.phase = Phase::Idle;
            (
                next,
                vec![
                    StopSession {
                        id: *segment_id,
                        skip_threshold: *skip_threshold,
                    },
                    EmitUi,
                ],
            )
        }
        (Phase::Idle, Exit) => {
            next.armed = false;
            (next, vec![])
        }

        // -----------------
        // Stale session events (drop silently)
        // -----------------
        (_, SessionStartFailed { .. }) | (_, Event::SessionFault { .. }) => (next, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureFormat;
    use chrono::Local;
    use std::path::PathBuf;

    fn changed(label: &str) -> Event {
        Event::LabelChanged {
            label: label.to_string(),
        }
    }

    fn armed() -> State {
        State::new(true, None)
    }

    fn finished(label: &str, duration: Duration, fault: Option<SessionFault>) -> FinishedSegment {
        FinishedSegment {
            id: Uuid::new_v4(),
            label: label.to_string(),
            path: PathBuf::from(format!("/tmp/{}.wav", label)),
            format: CaptureFormat::pcm16(44_100, 2),
            started_at: Local::now(),
            duration,
            frames: 0,
            bytes: 0,
            fault,
        }
    }

    fn stops(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::StopSession { .. }))
            .count()
    }

    fn starts(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::StartSession { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    fn recording_label(state: &State) -> Option<&str> {
        match &state.phase {
            Phase::Recording { label, .. } => Some(label),
            Phase::Idle => None,
        }
    }

    #[test]
    fn scenario_a_poll_sequence() {
        let state = armed();

        // 1st poll is the baseline
        let (state, effects) = reduce(
            &state,
            Event::LabelBaseline {
                label: String::new(),
            },
        );
        assert_eq!(state.phase, Phase::Idle);
        assert!(starts(&effects).is_empty());

        // 2nd poll: Idle -> Recording(A)
        let (state, effects) = reduce(&state, changed("Artist - Title A"));
        assert_eq!(recording_label(&state), Some("Artist - Title A"));
        assert_eq!(starts(&effects), vec!["Artist - Title A"]);
        let a_id = state.active_segment().unwrap();

        // 3rd poll is equal: the monitor emits nothing, and an equal label is a no-op anyway
        let (same, effects) = reduce(&state, changed("Artist - Title A"));
        assert_eq!(same, state);
        assert!(effects.is_empty());

        // 4th poll: stop A, then start B, in that order
        let (state, effects) = reduce(&state, changed("Artist - Title B"));
        assert_eq!(recording_label(&state), Some("Artist - Title B"));
        assert!(matches!(
            &effects[0],
            Effect::StopSession { id, .. } if *id == a_id
        ));
        assert!(matches!(&effects[1], Effect::StartSession { label, .. } if label == "Artist - Title B"));

        // 5th poll: Recording(B) -> Idle
        let (state, effects) = reduce(&state, changed(""));
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(stops(&effects), 1);
        assert!(starts(&effects).is_empty());
    }

    #[test]
    fn n_labels_make_n_minus_one_boundaries() {
        let labels = ["L1", "L2", "L3", "L4", "L5", "L6"];
        let mut state = armed();
        let mut total_stops = 0;

        for (i, label) in labels.iter().enumerate() {
            let (next, effects) = reduce(&state, changed(label));
            total_stops += stops(&effects);
            if i > 0 {
                assert_eq!(stops(&effects), 1);
            }
            state = next;
        }

        assert_eq!(total_stops, labels.len() - 1);
        assert_eq!(recording_label(&state), Some("L6"));

        let mut state = armed();
        for label in ["L1", "L2", ""] {
            state = reduce(&state, changed(label)).0;
        }
        assert_eq!(state.phase, Phase::Idle);
    }

    #[test]
    fn empty_label_while_idle_is_a_noop() {
        let (state, effects) = reduce(&armed(), changed(""));
        assert_eq!(state.phase, Phase::Idle);
        assert!(starts(&effects).is_empty());
    }

    #[test]
    fn disarmed_controller_only_tracks_labels() {
        let state = State::new(false, None);
        let (state, effects) = reduce(&state, changed("Artist - Song"));
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.label, "Artist - Song");
        assert!(starts(&effects).is_empty());
    }

    #[test]
    fn stop_twice_stops_once() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let (state, first) = reduce(&state, Event::StopRequested);
        let (state, second) = reduce(&state, Event::StopRequested);

        assert_eq!(stops(&first), 1);
        assert_eq!(stops(&second), 0);
        assert!(second.is_empty());
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.armed);
    }

    #[test]
    fn stop_disarms_until_start() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let (state, _) = reduce(&state, Event::StopRequested);

        let (state, effects) = reduce(&state, changed("Next Song"));
        assert_eq!(state.phase, Phase::Idle);
        assert!(starts(&effects).is_empty());

        // Start re-arms for the label already displayed
        let (state, effects) = reduce(&state, Event::StartRequested);
        assert!(state.armed);
        assert_eq!(starts(&effects), vec!["Next Song"]);
        assert_eq!(recording_label(&state), Some("Next Song"));
    }

    #[test]
    fn start_with_nothing_playing_only_arms() {
        let (state, effects) = reduce(&State::default(), Event::StartRequested);
        assert!(state.armed);
        assert_eq!(state.phase, Phase::Idle);
        assert!(starts(&effects).is_empty());
    }

    #[test]
    fn start_while_recording_is_a_noop() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let (next, effects) = reduce(&state, Event::StartRequested);
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn threshold_is_captured_at_session_start() {
        let state = State::new(true, Some(Duration::from_secs(5)));
        let (state, _) = reduce(&state, changed("Song"));
        let (state, _) = reduce(
            &state,
            Event::SkipThresholdChanged {
                threshold: Some(Duration::from_secs(60)),
            },
        );

        let (state, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(
            effects[0],
            Effect::StopSession {
                skip_threshold: Some(t),
                ..
            } if t == Duration::from_secs(5)
        ));
        assert_eq!(state.skip_threshold, Some(Duration::from_secs(60)));
    }

    #[test]
    fn scenario_d_short_segment_is_discarded() {
        let segment = finished("Ad", Duration::from_millis(2_300), None);
        let (_, effects) = reduce(
            &armed(),
            Event::SessionStopped {
                segment: segment.clone(),
                skip_threshold: Some(Duration::from_secs(5)),
            },
        );

        assert!(effects.contains(&Effect::DiscardSegment {
            segment,
            threshold: Duration::from_secs(5),
        }));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::EnqueueTranscode { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify {
                kind: NoticeKind::SegmentSkipped,
                ..
            }
        )));
    }

    #[test]
    fn threshold_law_boundary() {
        let threshold = Some(Duration::from_secs(5));
        for (duration, kept) in [
            (Duration::from_millis(4_999), false),
            (Duration::from_secs(5), true),
            (Duration::from_secs(240), true),
        ] {
            let segment = finished("Song", duration, None);
            let (_, effects) = reduce(
                &armed(),
                Event::SessionStopped {
                    segment: segment.clone(),
                    skip_threshold: threshold,
                },
            );
            let enqueued = effects
                .iter()
                .filter(|e| matches!(e, Effect::EnqueueTranscode { .. }))
                .count();
            assert_eq!(enqueued, kept as usize, "duration {:?}", duration);
        }
    }

    #[test]
    fn disabled_threshold_keeps_everything() {
        let segment = finished("Blip", Duration::from_millis(10), None);
        let (_, effects) = reduce(
            &armed(),
            Event::SessionStopped {
                segment: segment.clone(),
                skip_threshold: None,
            },
        );
        assert_eq!(effects, vec![Effect::EnqueueTranscode { segment }]);
    }

    #[test]
    fn faulted_segment_is_retained_not_enqueued() {
        let fault = SessionFault::Io("disk full".to_string());
        let segment = finished("Song", Duration::from_secs(90), Some(fault.clone()));
        let (_, effects) = reduce(
            &armed(),
            Event::SessionStopped {
                segment: segment.clone(),
                skip_threshold: None,
            },
        );

        assert_eq!(effects[0], Effect::RetainFailedSegment { segment, fault });
        assert!(matches!(
            effects[1],
            Effect::Notify {
                kind: NoticeKind::IoFault,
                ..
            }
        ));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::EnqueueTranscode { .. })));
    }

    #[test]
    fn session_fault_forces_stop() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let id = state.active_segment().unwrap();

        let (next, effects) = reduce(
            &state,
            Event::SessionFault {
                id,
                fault: SessionFault::DeviceLost("unplugged".to_string()),
            },
        );
        assert_eq!(next.phase, Phase::Idle);
        assert!(next.armed);
        assert_eq!(stops(&effects), 1);
    }

    #[test]
    fn stale_session_events_are_ignored() {
        let (state, _) = reduce(&armed(), changed("Song"));

        let (next, effects) = reduce(
            &state,
            Event::SessionFault {
                id: Uuid::new_v4(),
                fault: SessionFault::DeviceLost("old".to_string()),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &state,
            Event::SessionStartFailed {
                id: Uuid::new_v4(),
                err: AudioError::DeviceUnavailable("old".to_string()),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn start_failure_returns_to_idle_with_notice() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let id = state.active_segment().unwrap();

        let (next, effects) = reduce(
            &state,
            Event::SessionStartFailed {
                id,
                err: AudioError::DeviceUnavailable("no endpoint".to_string()),
            },
        );
        assert_eq!(next.phase, Phase::Idle);
        assert!(next.armed);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify {
                kind: NoticeKind::DeviceUnavailable,
                ..
            }
        )));

        // The next boundary tries again
        let (next, effects) = reduce(&next, changed("Other"));
        assert_eq!(starts(&effects), vec!["Other"]);
        assert!(next.is_recording());
    }

    #[test]
    fn exit_forces_stop_of_active_segment() {
        let (state, _) = reduce(&armed(), changed("Song"));
        let (state, effects) = reduce(&state, Event::Exit);
        assert_eq!(stops(&effects), 1);
        assert_eq!(state.phase, Phase::Idle);

        let (_, effects) = reduce(&state, Event::Exit);
        assert!(effects.is_empty());
    }

    #[test]
    fn baseline_never_starts_a_session() {
        let (state, effects) = reduce(
            &armed(),
            Event::LabelBaseline {
                label: "Artist - Song".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.label, "Artist - Song");
        assert_eq!(effects, vec![Effect::EmitUi]);
    }
}

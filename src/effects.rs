//! Effect runner for songcap
//!
//! Executes the effects produced by the state machine. Every effect runs to
//! completion before the state loop moves on, which is what makes a session
//! stop synchronous: the next `StartSession` never runs before the previous
//! writer is closed. Runners are called from the blocking pool.

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::audio::{
    allocate_segment_path, AudioError, CaptureSession, CaptureSourceFactory, FaultNotifier,
    FinishedSegment, LiveLevel, SessionFault,
};
use crate::metrics::{MetricsCollector, SegmentOutcome};
use crate::notice::{notify, NoticeKind, NoticeSender};
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event};
use crate::transcode::{TranscodeJob, TranscodeQueue};

/// Runs one effect and returns the events it produced.
pub trait EffectRunner: Send + Sync + 'static {
    fn run(&self, effect: Effect) -> Vec<Event>;
}

/// Real effect runner: capture sessions, transcode queue, metrics and notices.
pub struct SessionEffectRunner {
    factory: Arc<dyn CaptureSourceFactory>,
    active: std::sync::Mutex<Option<CaptureSession>>,
    settings: Arc<Mutex<AppSettings>>,
    queue: Arc<TranscodeQueue>,
    metrics: Arc<Mutex<MetricsCollector>>,
    live: LiveLevel,
    notices: NoticeSender,
    /// Worker-thread faults; unbounded so a fault is never dropped
    faults: mpsc::UnboundedSender<Event>,
}

impl SessionEffectRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: Arc<dyn CaptureSourceFactory>,
        settings: Arc<Mutex<AppSettings>>,
        queue: Arc<TranscodeQueue>,
        metrics: Arc<Mutex<MetricsCollector>>,
        live: LiveLevel,
        notices: NoticeSender,
        faults: mpsc::UnboundedSender<Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            active: std::sync::Mutex::new(None),
            settings,
            queue,
            metrics,
            live,
            notices,
            faults,
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<CaptureSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fault_notifier(&self) -> FaultNotifier {
        let faults = self.faults.clone();
        Arc::new(move |id: Uuid, fault: SessionFault| {
            // Unbounded send never blocks the worker the state loop may be joining.
            if faults.send(Event::SessionFault { id, fault }).is_err() {
                log::debug!("State loop gone, dropping fault for {}", id);
            }
        })
    }

    fn start_session(&self, id: Uuid, label: &str) -> Vec<Event> {
        let mut events = Vec::new();

        // Should never happen: the reducer always stops before starting.
        if let Some(stale) = self.active().take() {
            log::error!(
                "Session {} still open when starting {}, stopping it first",
                stale.id(),
                id
            );
            events.extend(self.finish(stale, None));
        }

        let output_dir = self.settings.blocking_lock().output_dir.clone();
        let target = match allocate_segment_path(&output_dir, label) {
            Ok(target) => target,
            Err(e) => {
                let err = if e.kind() == ErrorKind::AlreadyExists {
                    AudioError::FileConflict(e.to_string())
                } else {
                    AudioError::Io(e.to_string())
                };
                events.push(Event::SessionStartFailed { id, err });
                return events;
            }
        };

        let source = self.factory.create();
        match CaptureSession::start(
            id,
            label,
            source,
            target,
            self.live.clone(),
            self.fault_notifier(),
        ) {
            Ok(session) => {
                self.metrics.blocking_lock().writer_opened(id);
                *self.active() = Some(session);
            }
            Err(err) => {
                log::error!("Failed to start session {} for {:?}: {}", id, label, err);
                events.push(Event::SessionStartFailed { id, err });
            }
        }
        events
    }

    fn stop_session(&self, id: Uuid, skip_threshold: Option<std::time::Duration>) -> Vec<Event> {
        let session = {
            let mut active = self.active();
            match active.as_ref() {
                Some(session) if session.id() == id => active.take(),
                _ => None,
            }
        };

        match session {
            Some(session) => self.finish(session, skip_threshold),
            None => {
                log::debug!("StopSession {}: no such active session", id);
                Vec::new()
            }
        }
    }

    fn finish(
        &self,
        session: CaptureSession,
        skip_threshold: Option<std::time::Duration>,
    ) -> Vec<Event> {
        let id = session.id();
        let segment = session.stop();
        self.metrics.blocking_lock().writer_closed(id);
        vec![Event::SessionStopped {
            segment,
            skip_threshold,
        }]
    }

    fn enqueue(&self, segment: FinishedSegment) {
        let bitrate = self.settings.blocking_lock().bitrate_kbps;
        let job = TranscodeJob::for_segment(&segment, bitrate);

        match self.queue.enqueue(job) {
            Ok(()) => {
                self.metrics
                    .blocking_lock()
                    .segment_finished(&segment, SegmentOutcome::Queued);
            }
            Err(e) => {
                let mut metrics = self.metrics.blocking_lock();
                metrics.segment_finished(&segment, SegmentOutcome::Failed);
                metrics.record_error("transcode", e.to_string(), Some(segment.id));
                drop(metrics);
                notify(
                    &self.notices,
                    NoticeKind::from(&e),
                    format!("Could not queue {:?}: {}", segment.label, e),
                );
            }
        }
    }

    fn discard(&self, segment: FinishedSegment) {
        log::info!(
            "Discarding {:?} ({:.1}s): {:?}",
            segment.label,
            segment.duration.as_secs_f64(),
            segment.path
        );
        let mut metrics = self.metrics.blocking_lock();
        if let Err(e) = std::fs::remove_file(&segment.path) {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to remove skipped segment {:?}: {}", segment.path, e);
                metrics.record_error(
                    "capture",
                    format!("remove {:?}: {}", segment.path, e),
                    Some(segment.id),
                );
            }
        }
        metrics.segment_finished(&segment, SegmentOutcome::Skipped);
    }

    fn retain_failed(&self, segment: FinishedSegment, fault: SessionFault) {
        log::warn!(
            "Keeping raw file of failed segment {:?} at {:?}",
            segment.label,
            segment.path
        );
        let mut metrics = self.metrics.blocking_lock();
        metrics.segment_finished(&segment, SegmentOutcome::Failed);
        metrics.record_error("capture", fault.to_string(), Some(segment.id));
    }
}

impl EffectRunner for SessionEffectRunner {
    fn run(&self, effect: Effect) -> Vec<Event> {
        match effect {
            Effect::StartSession { id, label } => self.start_session(id, &label),
            Effect::StopSession { id, skip_threshold } => self.stop_session(id, skip_threshold),
            Effect::EnqueueTranscode { segment } => {
                self.enqueue(segment);
                Vec::new()
            }
            Effect::DiscardSegment { segment, .. } => {
                self.discard(segment);
                Vec::new()
            }
            Effect::RetainFailedSegment { segment, fault } => {
                self.retain_failed(segment, fault);
                Vec::new()
            }
            Effect::Notify { kind, message } => {
                notify(&self.notices, kind, message);
                Vec::new()
            }
            Effect::EmitUi => {
                log::debug!("EmitUi is handled by the state loop");
                Vec::new()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audio::{CaptureFormat, CaptureMessage, CaptureSource, ChunkSender};
    use crate::notice::notice_channel;
    use crate::transcode::{Encoder, QueueConfig};
    use std::time::Duration;
    use tokio::process::Command;

    struct ToneSource {
        sink: Option<ChunkSender>,
    }

    impl CaptureSource for ToneSource {
        fn open(&mut self) -> Result<CaptureFormat, AudioError> {
            Ok(CaptureFormat::pcm16(8_000, 1))
        }
        fn start(&mut self, sink: ChunkSender) -> Result<(), AudioError> {
            sink.send(CaptureMessage::Chunk(vec![1_000; 8_000])).unwrap();
            self.sink = Some(sink);
            Ok(())
        }
        fn stop(&mut self) {
            self.sink = None;
        }
    }

    /// Delivers one chunk, then reports the endpoint gone.
    struct VanishingSource {
        sink: Option<ChunkSender>,
    }

    impl CaptureSource for VanishingSource {
        fn open(&mut self) -> Result<CaptureFormat, AudioError> {
            Ok(CaptureFormat::pcm16(8_000, 1))
        }
        fn start(&mut self, sink: ChunkSender) -> Result<(), AudioError> {
            sink.send(CaptureMessage::Chunk(vec![1_000; 800])).unwrap();
            sink.send(CaptureMessage::DeviceLost("unplugged".into()))
                .unwrap();
            self.sink = Some(sink);
            Ok(())
        }
        fn stop(&mut self) {
            self.sink = None;
        }
    }

    struct CopyEncoder;

    impl Encoder for CopyEncoder {
        fn name(&self) -> &str {
            "cp"
        }
        fn command(&self, job: &TranscodeJob) -> Command {
            let mut command = Command::new("cp");
            command.arg(&job.raw_path).arg(&job.target_path);
            command
        }
    }

    struct Fixture {
        runner: Arc<SessionEffectRunner>,
        metrics: Arc<Mutex<MetricsCollector>>,
        queue: Arc<TranscodeQueue>,
        faults: mpsc::UnboundedReceiver<Event>,
        _dir: tempfile::TempDir,
        dir: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(|| -> Box<dyn CaptureSource> {
            Box::new(ToneSource { sink: None })
        }))
    }

    fn fixture_with(factory: Arc<dyn CaptureSourceFactory>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            output_dir: dir.path().to_path_buf(),
            ..AppSettings::default()
        };
        let (report_tx, _report_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(TranscodeQueue::new(
            Arc::new(CopyEncoder),
            QueueConfig::default(),
            report_tx,
        ));
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let (notice_tx, _notice_rx) = notice_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let runner = SessionEffectRunner::new(
            factory,
            Arc::new(Mutex::new(settings)),
            queue.clone(),
            metrics.clone(),
            LiveLevel::new(),
            notice_tx,
            fault_tx,
        );
        Fixture {
            runner,
            metrics,
            queue,
            faults: fault_rx,
            dir: dir.path().to_path_buf(),
            _dir: dir,
        }
    }

    async fn run(runner: &Arc<SessionEffectRunner>, effect: Effect) -> Vec<Event> {
        let runner = runner.clone();
        tokio::task::spawn_blocking(move || runner.run(effect))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_then_stop_reports_the_segment() {
        let f = fixture();
        let id = Uuid::new_v4();

        let events = run(
            &f.runner,
            Effect::StartSession {
                id,
                label: "Artist - Song".into(),
            },
        )
        .await;
        assert!(events.is_empty());

        let events = run(
            &f.runner,
            Effect::StopSession {
                id,
                skip_threshold: Some(Duration::from_secs(5)),
            },
        )
        .await;
        match &events[..] {
            [Event::SessionStopped {
                segment,
                skip_threshold,
            }] => {
                assert_eq!(segment.id, id);
                assert_eq!(segment.frames, 8_000);
                assert_eq!(segment.path, f.dir.join("Artist - Song.wav"));
                assert_eq!(*skip_threshold, Some(Duration::from_secs(5)));
            }
            other => panic!("unexpected events: {:?}", other),
        }

        // Second stop for the same id is a no-op
        let again = run(
            &f.runner,
            Effect::StopSession {
                id,
                skip_threshold: None,
            },
        )
        .await;
        assert!(again.is_empty());
        assert_eq!(f.metrics.lock().await.max_concurrent_writers(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn discard_removes_raw_file() {
        let f = fixture();
        let id = Uuid::new_v4();
        run(
            &f.runner,
            Effect::StartSession {
                id,
                label: "Ad".into(),
            },
        )
        .await;
        let events = run(
            &f.runner,
            Effect::StopSession {
                id,
                skip_threshold: None,
            },
        )
        .await;
        let Some(Event::SessionStopped { segment, .. }) = events.into_iter().next() else {
            panic!("no segment");
        };
        assert!(segment.path.exists());

        let path = segment.path.clone();
        run(
            &f.runner,
            Effect::DiscardSegment {
                segment,
                threshold: Duration::from_secs(30),
            },
        )
        .await;
        assert!(!path.exists());
        assert_eq!(f.metrics.lock().await.summary().segments_skipped, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unwritable_output_dir_fails_the_start() {
        let f = fixture();
        let blocker = f.dir.join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        f.runner.settings.lock().await.output_dir = blocker;

        let id = Uuid::new_v4();
        let events = run(
            &f.runner,
            Effect::StartSession {
                id,
                label: "Song".into(),
            },
        )
        .await;
        assert!(matches!(
            &events[..],
            [Event::SessionStartFailed { id: failed, .. }] if *failed == id
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn faults_are_never_dropped() {
        let mut f = fixture();
        let report = f.runner.fault_notifier();
        let id = Uuid::new_v4();

        // Far more than the label channel holds
        for _ in 0..500 {
            report(id, SessionFault::Io("disk full".into()));
        }

        let mut received = 0;
        while let Ok(event) = f.faults.try_recv() {
            assert!(matches!(event, Event::SessionFault { id: got, .. } if got == id));
            received += 1;
        }
        assert_eq!(received, 500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn faulted_segment_is_kept_and_never_queued() {
        use crate::state_machine::{reduce, State};

        let mut f = fixture_with(Arc::new(|| -> Box<dyn CaptureSource> {
            Box::new(VanishingSource { sink: None })
        }));
        let label = "Artist - Unplugged";

        let mut state = State::new(true, None);
        let (next, effects) = reduce(
            &state,
            Event::LabelChanged {
                label: label.into(),
            },
        );
        state = next;
        let started = effects.into_iter().find_map(|e| match e {
            Effect::StartSession { id, .. } => Some(id),
            _ => None,
        });
        let started = started.unwrap();
        assert!(run(
            &f.runner,
            Effect::StartSession {
                id: started,
                label: label.into()
            }
        )
        .await
        .is_empty());

        let fault = tokio::time::timeout(Duration::from_secs(5), f.faults.recv())
            .await
            .expect("fault reported")
            .unwrap();
        assert!(matches!(
            &fault,
            Event::SessionFault { id: got, fault: SessionFault::DeviceLost(_) } if *got == started
        ));

        // Drive the reducer with the fault, then run what it asks for.
        let mut pending = vec![fault];
        let mut ran = Vec::new();
        while let Some(event) = pending.pop() {
            let (next, effects) = reduce(&state, event);
            state = next;
            for effect in effects {
                ran.push(effect.clone());
                pending.extend(run(&f.runner, effect).await);
            }
        }

        assert!(!state.is_recording());
        assert!(ran
            .iter()
            .any(|e| matches!(e, Effect::RetainFailedSegment { .. })));
        assert!(!ran
            .iter()
            .any(|e| matches!(e, Effect::EnqueueTranscode { .. })));
        assert_eq!(f.queue.pending(), 0);
        assert!(f.queue.statuses().is_empty());
        assert!(f.dir.join("Artist - Unplugged.wav").exists());

        let summary = f.metrics.lock().await.summary();
        assert_eq!(summary.segments_failed, 1);
        assert_eq!(summary.segments_recorded, 1);
    }
}

//! songcap: records system audio and splits it into tagged tracks
//!
//! A now-playing monitor polls the player's window title. Every label change
//! closes the current WAV segment and opens the next one; finished segments
//! are handed to a transcode queue that produces tagged MP3s. The controller
//! is a reducer driven by a single event loop.

pub mod audio;
pub mod effects;
pub mod library;
pub mod metrics;
pub mod notice;
pub mod nowplaying;
pub mod settings;
pub mod state_machine;
pub mod transcode;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use audio::{AudioError, CaptureSourceFactory, LiveLevel};
use effects::{EffectRunner, SessionEffectRunner};
use library::{Recording, RecordingsLibrary};
use metrics::{ErrorRecord, MetricsCollector, MetricsSummary, SegmentMetrics, TimelineEntry};
use notice::{notice_channel, notify, Notice, NoticeKind, NoticeReceiver, NoticeSender};
use nowplaying::{run_monitor, LabelNormalizer, NowPlayingMonitor, NowPlayingSource, WindowTitleNormalizer};
use settings::AppSettings;
use state_machine::{reduce, Effect, Event, Phase, State};
use transcode::{Encoder, LameEncoder, QueueConfig, TranscodeQueue, TranscodeReport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Serializable view of the controller for display.
/// Tagged like `{ "status": "recording", "label": "...", "elapsedSecs": 12 }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiState {
    Idle {
        label: String,
        armed: bool,
    },
    Recording {
        #[serde(rename = "segmentId")]
        segment_id: Uuid,
        label: String,
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
}

fn state_to_ui(state: &State) -> UiState {
    match &state.phase {
        Phase::Idle => UiState::Idle {
            label: state.label.clone(),
            armed: state.armed,
        },
        Phase::Recording {
            segment_id,
            label,
            started_at,
            ..
        } => UiState::Recording {
            segment_id: *segment_id,
            label: label.clone(),
            elapsed_secs: started_at.elapsed().as_secs(),
        },
    }
}

fn emit_ui_state(state: &State) {
    let ui_state = state_to_ui(state);
    match serde_json::to_string(&ui_state) {
        Ok(json) => log::debug!("UI state: {}", json),
        Err(e) => log::warn!("Failed to serialize UI state: {}", e),
    }
}

/// Unit of work for the state loop: an event to reduce or an effect to run.
enum Step {
    Reduce(Event),
    Run(Effect),
}

/// Run the controller loop until `Exit` or until every sender is gone.
///
/// Work is processed depth first. Events an effect returns are reduced, and
/// their effects run, before the next effect of the same transition. At a
/// track change the old segment is therefore stopped, judged and queued
/// before the new one starts. Session faults arrive on their own unbounded
/// channel and take priority over label events.
async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    mut faults: mpsc::UnboundedReceiver<Event>,
    initial: State,
    runner: Arc<dyn EffectRunner>,
    published: watch::Sender<State>,
) {
    let mut state = initial;
    emit_ui_state(&state);
    log::info!("State loop started");

    loop {
        let event = tokio::select! {
            biased;
            Some(fault) = faults.recv() => fault,
            event = rx.recv() => event.unwrap_or_else(|| {
                log::warn!("All event senders dropped, finalizing");
                Event::Exit
            }),
        };
        let exit = matches!(event, Event::Exit);
        if exit {
            log::info!("Exit requested, finalizing active segment");
        }

        let mut work = VecDeque::from([Step::Reduce(event)]);
        while let Some(step) = work.pop_front() {
            match step {
                Step::Reduce(event) => {
                    log::debug!("Received event: {:?}", event);

                    let (next, effects) = reduce(&state, event);
                    let (before, after) = (state.describe(), next.describe());
                    if before != after {
                        log::info!("State transition: {} -> {}", before, after);
                    }
                    state = next;
                    published.send_replace(state.clone());

                    for effect in effects.into_iter().rev() {
                        work.push_front(Step::Run(effect));
                    }
                }
                Step::Run(Effect::EmitUi) => emit_ui_state(&state),
                Step::Run(effect) => {
                    let runner = runner.clone();
                    match tokio::task::spawn_blocking(move || runner.run(effect)).await {
                        Ok(events) => {
                            for event in events.into_iter().rev() {
                                work.push_front(Step::Reduce(event));
                            }
                        }
                        Err(e) => log::error!("Effect task failed: {}", e),
                    }
                }
            }
        }

        if exit {
            break;
        }
    }

    log::info!("State loop ended");
}

/// Apply finished transcodes to the library, metrics and notices.
async fn run_report_listener(
    mut reports: mpsc::UnboundedReceiver<TranscodeReport>,
    library: Arc<Mutex<RecordingsLibrary>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    notices: NoticeSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            report = reports.recv() => match report {
                Some(report) => apply_report(report, &library, &metrics, &notices).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                // Every job has reported by now; drain what is buffered.
                while let Ok(report) = reports.try_recv() {
                    apply_report(report, &library, &metrics, &notices).await;
                }
                break;
            }
        }
    }
    log::debug!("Transcode report listener ended");
}

async fn apply_report(
    report: TranscodeReport,
    library: &Mutex<RecordingsLibrary>,
    metrics: &Mutex<MetricsCollector>,
    notices: &NoticeSender,
) {
    let TranscodeReport {
        job,
        elapsed,
        result,
    } = report;

    match result {
        Ok(success) => {
            metrics
                .lock()
                .await
                .transcode_finished(job.id, elapsed, Ok(()));
            library.lock().await.add(&job.label, job.target_path.clone());

            if let Some(e) = success.cleanup_error {
                notify(
                    notices,
                    NoticeKind::IoFault,
                    format!("Saved {:?} but could not remove {:?}: {}", job.label, job.raw_path, e),
                );
            }
            notify(
                notices,
                NoticeKind::RecordingSaved,
                format!("Saved {:?} to {:?}", job.label, job.target_path),
            );
        }
        Err(e) => {
            {
                let mut metrics = metrics.lock().await;
                metrics.transcode_finished(job.id, elapsed, Err(e.to_string()));
                metrics.record_error("transcode", e.to_string(), Some(job.id));
            }
            notify(
                notices,
                NoticeKind::from(&e),
                format!("Could not encode {:?}: {} (raw file kept at {:?})", job.label, e, job.raw_path),
            );
        }
    }
}

/// Entry point for the default setup: `lame` from settings and the
/// window-title normalizer.
pub struct Recorder;

impl Recorder {
    pub async fn launch(
        settings: AppSettings,
        capture: Arc<dyn CaptureSourceFactory>,
        now_playing: Arc<dyn NowPlayingSource>,
    ) -> Result<RecorderHandle, AudioError> {
        RecorderBuilder::new(settings, capture, now_playing)
            .launch()
            .await
    }
}

/// Configures and launches a recorder.
pub struct RecorderBuilder {
    settings: AppSettings,
    capture: Arc<dyn CaptureSourceFactory>,
    now_playing: Arc<dyn NowPlayingSource>,
    encoder: Option<Arc<dyn Encoder>>,
    normalizer: Option<Arc<dyn LabelNormalizer>>,
}

impl RecorderBuilder {
    pub fn new(
        settings: AppSettings,
        capture: Arc<dyn CaptureSourceFactory>,
        now_playing: Arc<dyn NowPlayingSource>,
    ) -> Self {
        Self {
            settings,
            capture,
            now_playing,
            encoder: None,
            normalizer: None,
        }
    }

    /// Replace the `lame` encoder built from settings.
    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Replace the window-title normalizer built from settings.
    pub fn normalizer(mut self, normalizer: Arc<dyn LabelNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Open the capture endpoint once, then start the monitor, the state loop and
    /// the transcode queue. Nothing is started when no endpoint is available.
    pub async fn launch(self) -> Result<RecorderHandle, AudioError> {
        let settings = self.settings.validated();

        let capture = self.capture.clone();
        let format = tokio::task::spawn_blocking(move || {
            let mut source = capture.create();
            let format = source.open();
            source.stop();
            format
        })
        .await
        .map_err(|e| AudioError::DeviceUnavailable(format!("endpoint check failed: {}", e)))??;
        log::info!(
            "Capture endpoint: {} Hz, {} channel(s), {}-bit",
            format.sample_rate,
            format.channels,
            format.bits_per_sample
        );

        let (event_tx, event_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel::<Event>();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = notice_channel();

        let encoder = self
            .encoder
            .unwrap_or_else(|| Arc::new(LameEncoder::new(settings.encoder_program.clone())));
        let normalizer = self
            .normalizer
            .unwrap_or_else(|| Arc::new(WindowTitleNormalizer::from_settings(&settings)));

        let queue = Arc::new(TranscodeQueue::new(
            encoder,
            QueueConfig::from_settings(&settings),
            report_tx,
        ));
        let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
        let library = Arc::new(Mutex::new(RecordingsLibrary::new()));
        let live = LiveLevel::new();
        let poll_interval = settings.poll_interval();
        let poll_timeout = settings.poll_timeout();
        let initial = State::new(settings.auto_arm, settings.skip_threshold());
        let shared_settings = Arc::new(Mutex::new(settings));

        let runner = SessionEffectRunner::new(
            self.capture,
            shared_settings.clone(),
            queue.clone(),
            metrics.clone(),
            live.clone(),
            notice_tx.clone(),
            fault_tx,
        );

        let (state_tx, state_rx) = watch::channel(initial.clone());
        let state_loop = tokio::spawn(run_state_loop(event_rx, fault_rx, initial, runner, state_tx));

        let monitor_cancel = CancellationToken::new();
        let monitor = NowPlayingMonitor::new(self.now_playing, normalizer);
        let monitor_task = tokio::spawn(run_monitor(
            monitor,
            poll_interval,
            poll_timeout,
            event_tx.clone(),
            monitor_cancel.clone(),
        ));

        let reports_cancel = CancellationToken::new();
        let report_task = tokio::spawn(run_report_listener(
            report_rx,
            library.clone(),
            metrics.clone(),
            notice_tx,
            reports_cancel.clone(),
        ));

        log::info!("songcap started");

        Ok(RecorderHandle {
            tx: event_tx,
            state: state_rx,
            settings: shared_settings,
            metrics,
            library,
            live,
            queue,
            notices: notice_rx,
            state_loop,
            monitor_task,
            monitor_cancel,
            report_task,
            reports_cancel,
        })
    }
}

/// Snapshot returned by [`RecorderHandle::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub ui: UiState,
    pub level_db: f32,
    pub pending_transcodes: usize,
}

/// Control surface of a running recorder.
pub struct RecorderHandle {
    tx: mpsc::Sender<Event>,
    state: watch::Receiver<State>,
    settings: Arc<Mutex<AppSettings>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    library: Arc<Mutex<RecordingsLibrary>>,
    live: LiveLevel,
    queue: Arc<TranscodeQueue>,
    notices: NoticeReceiver,
    state_loop: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
    monitor_cancel: CancellationToken,
    report_task: JoinHandle<()>,
    reports_cancel: CancellationToken,
}

impl RecorderHandle {
    async fn send(&self, event: Event) -> Result<(), String> {
        self.tx
            .send(event)
            .await
            .map_err(|e| format!("Recorder is not running: {}", e))
    }

    /// Arm recording; starts a segment right away if something is playing.
    pub async fn start(&self) -> Result<(), String> {
        self.send(Event::StartRequested).await
    }

    /// Disarm and finalize the active segment.
    pub async fn stop(&self) -> Result<(), String> {
        self.send(Event::StopRequested).await
    }

    pub fn status(&self) -> StatusSnapshot {
        let ui = state_to_ui(&self.state.borrow());
        StatusSnapshot {
            ui,
            level_db: self.live.level_db(),
            pending_transcodes: self.queue.pending(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.borrow().is_recording()
    }

    /// Current label, empty when nothing is playing.
    pub fn label(&self) -> String {
        self.state.borrow().label.clone()
    }

    pub fn level_db(&self) -> f32 {
        self.live.level_db()
    }

    pub fn channel_levels_db(&self) -> [f32; 2] {
        self.live.channels_db()
    }

    pub async fn recordings(&self) -> Vec<Recording> {
        self.library.lock().await.list()
    }

    /// Forget every recording. Files on disk are kept.
    pub async fn clear_recordings(&self) {
        self.library.lock().await.clear();
    }

    /// Delete a recording's file and drop it from the library.
    pub async fn delete_recording(&self, path: &Path) -> std::io::Result<Recording> {
        self.library.lock().await.delete(path)
    }

    pub async fn metrics(&self) -> MetricsSummary {
        self.metrics.lock().await.summary()
    }

    pub async fn segment_history(&self) -> Vec<SegmentMetrics> {
        self.metrics.lock().await.history()
    }

    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.metrics.lock().await.errors()
    }

    /// Open/close order of segment writers.
    pub async fn writer_timeline(&self) -> Vec<TimelineEntry> {
        self.metrics.lock().await.timeline()
    }

    /// Notices raised since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        let mut taken = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            taken.push(notice);
        }
        taken
    }

    /// Wait for the next notice. `None` once the recorder has shut down.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    pub async fn settings(&self) -> AppSettings {
        self.settings.lock().await.clone()
    }

    /// Replace live settings.
    ///
    /// Output directory and bitrate apply to the next segment. The skip
    /// threshold applies to segments started from now on. Poll interval,
    /// encoder and title rules are fixed at launch.
    pub async fn update_settings(&self, settings: AppSettings) -> Result<(), String> {
        let settings = settings.validated();
        let threshold = settings.skip_threshold();
        *self.settings.lock().await = settings;
        self.send(Event::SkipThresholdChanged { threshold }).await
    }

    /// Finalize the active segment, finish every queued transcode, then stop.
    pub async fn shutdown(self) {
        log::info!("Shutting down");

        self.monitor_cancel.cancel();
        if let Err(e) = self.monitor_task.await {
            log::warn!("Monitor task failed: {}", e);
        }

        if let Err(e) = self.tx.send(Event::Exit).await {
            log::warn!("State loop already gone: {}", e);
        }
        drop(self.tx);
        if let Err(e) = self.state_loop.await {
            log::error!("State loop task failed: {}", e);
        }

        self.queue.shutdown().await;

        self.reports_cancel.cancel();
        if let Err(e) = self.report_task.await {
            log::warn!("Report listener failed: {}", e);
        }

        log::info!("songcap stopped");
    }
}

//! One recorded segment: capture source + writer + meter
//!
//! A `CaptureSession` is started for a label and owns its source for its whole
//! life. Chunks flow from the source over the bounded chunk channel to a worker
//! thread that appends them to the segment file and feeds the level meter, so
//! neither disk latency nor metering ever runs in the driver callback.
//!
//! `stop()` returns only after the source is halted, the worker has drained
//! the channel and the file header is finalized.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use super::capture::{
    chunk_channel, AudioError, CaptureFormat, CaptureMessage, CaptureSource, ChunkReceiver,
};
use super::meter::{LevelMeter, LiveLevel};
use super::paths::AllocatedPath;
use super::writer::SegmentWriter;

/// How often the worker re-checks the stop flag while the channel is quiet
const WORKER_POLL: Duration = Duration::from_millis(50);

/// A failure that ended a segment early.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionFault {
    /// Writing the segment file failed
    Io(String),
    /// The capture endpoint went away
    DeviceLost(String),
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFault::Io(e) => write!(f, "segment write failed: {}", e),
            SessionFault::DeviceLost(e) => write!(f, "capture device lost: {}", e),
        }
    }
}

/// Called from the worker thread the first time a session faults.
pub type FaultNotifier = Arc<dyn Fn(Uuid, SessionFault) + Send + Sync>;

/// Everything known about a segment once its file is closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedSegment {
    pub id: Uuid,
    pub label: String,
    pub path: PathBuf,
    pub format: CaptureFormat,
    pub started_at: DateTime<Local>,
    /// Wall time between start and stop
    pub duration: Duration,
    pub frames: u64,
    pub bytes: u64,
    pub fault: Option<SessionFault>,
}

impl FinishedSegment {
    /// Audio actually written, derived from the frame count.
    pub fn audio_duration(&self) -> Duration {
        self.format.frames_to_duration(self.frames)
    }
}

struct WorkerOutcome {
    frames: u64,
    bytes: u64,
    fault: Option<SessionFault>,
}

pub struct CaptureSession {
    id: Uuid,
    label: String,
    path: PathBuf,
    format: CaptureFormat,
    started_at: DateTime<Local>,
    stopwatch: Instant,
    source: Box<dyn CaptureSource>,
    stopping: Arc<AtomicBool>,
    worker: Option<JoinHandle<WorkerOutcome>>,
    live: LiveLevel,
}

impl CaptureSession {
    /// Open the source, bind it to the claimed file and start capturing.
    ///
    /// On failure the claimed file is removed again so no empty segment is
    /// left behind.
    pub fn start(
        id: Uuid,
        label: &str,
        mut source: Box<dyn CaptureSource>,
        target: AllocatedPath,
        live: LiveLevel,
        on_fault: FaultNotifier,
    ) -> Result<Self, AudioError> {
        let AllocatedPath { path, file, .. } = target;

        let format = match source.open() {
            Ok(format) => format,
            Err(e) => {
                drop(file);
                remove_claimed(&path);
                return Err(e);
            }
        };

        let writer = match SegmentWriter::from_file(file, path.clone(), format) {
            Ok(writer) => writer,
            Err(e) => {
                remove_claimed(&path);
                return Err(e);
            }
        };

        let (tx, rx) = chunk_channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let meter = LevelMeter::new(&format, live.clone());

        let worker_stopping = stopping.clone();
        let worker = match std::thread::Builder::new()
            .name("songcap-segment".to_string())
            .spawn(move || run_worker(id, rx, writer, meter, worker_stopping, on_fault))
        {
            Ok(worker) => worker,
            Err(e) => {
                remove_claimed(&path);
                return Err(AudioError::StreamFailed(e.to_string()));
            }
        };

        if let Err(e) = source.start(tx) {
            source.stop();
            stopping.store(true, Ordering::SeqCst);
            let _ = worker.join();
            live.reset();
            remove_claimed(&path);
            return Err(e);
        }

        log::info!("Capture session {} started for {:?} -> {:?}", id, label, path);

        Ok(Self {
            id,
            label: label.to_string(),
            path,
            format,
            started_at: Local::now(),
            stopwatch: Instant::now(),
            source,
            stopping,
            worker: Some(worker),
            live,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    /// Halt capture, drain pending chunks and finalize the file.
    pub fn stop(mut self) -> FinishedSegment {
        self.finish()
    }

    fn finish(&mut self) -> FinishedSegment {
        self.source.stop();
        let duration = self.stopwatch.elapsed();
        self.stopping.store(true, Ordering::SeqCst);

        let outcome = match self.worker.take().map(|w| w.join()) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => WorkerOutcome {
                frames: 0,
                bytes: 0,
                fault: Some(SessionFault::Io("segment worker panicked".to_string())),
            },
            None => WorkerOutcome {
                frames: 0,
                bytes: 0,
                fault: None,
            },
        };
        self.live.reset();

        log::info!(
            "Capture session {} stopped after {:.1}s ({} frames){}",
            self.id,
            duration.as_secs_f64(),
            outcome.frames,
            outcome
                .fault
                .as_ref()
                .map(|f| format!(", fault: {}", f))
                .unwrap_or_default()
        );

        FinishedSegment {
            id: self.id,
            label: self.label.clone(),
            path: self.path.clone(),
            format: self.format,
            started_at: self.started_at,
            duration,
            frames: outcome.frames,
            bytes: outcome.bytes,
            fault: outcome.fault,
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            log::warn!("Capture session {} dropped without stop", self.id);
            self.finish();
        }
    }
}

fn remove_claimed(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove unused segment file {:?}: {}", path, e);
    }
}

fn run_worker(
    id: Uuid,
    rx: ChunkReceiver,
    mut writer: SegmentWriter,
    mut meter: LevelMeter,
    stopping: Arc<AtomicBool>,
    on_fault: FaultNotifier,
) -> WorkerOutcome {
    let mut fault: Option<SessionFault> = None;

    let raise = |fault: &mut Option<SessionFault>, new: SessionFault| {
        if fault.is_none() {
            log::error!("Capture session {} faulted: {}", id, new);
            on_fault(id, new.clone());
            *fault = Some(new);
        }
    };

    loop {
        let message = if stopping.load(Ordering::SeqCst) {
            // Source is halted: take what is already queued, then finish.
            match rx.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(WORKER_POLL) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match message {
            CaptureMessage::Chunk(samples) => {
                if fault.is_some() {
                    continue;
                }
                meter.feed(&samples);
                if let Err(e) = writer.write(&samples) {
                    raise(&mut fault, SessionFault::Io(e.to_string()));
                }
            }
            CaptureMessage::DeviceLost(reason) => {
                raise(&mut fault, SessionFault::DeviceLost(reason));
            }
        }
    }

    if let Err(e) = writer.close() {
        if fault.is_none() {
            fault = Some(SessionFault::Io(e.to_string()));
        }
    }

    WorkerOutcome {
        frames: writer.frames_written(),
        bytes: writer.data_bytes(),
        fault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::ChunkSender;
    use crate::audio::paths::allocate_segment_path;
    use std::sync::Mutex;

    /// Pushes a fixed script of messages on start, then holds the sender.
    struct ScriptedSource {
        format: CaptureFormat,
        script: Vec<CaptureMessage>,
        sink: Option<ChunkSender>,
        fail_open: bool,
    }

    impl ScriptedSource {
        fn new(script: Vec<CaptureMessage>) -> Self {
            Self {
                format: CaptureFormat::pcm16(8_000, 2),
                script,
                sink: None,
                fail_open: false,
            }
        }
    }

    impl CaptureSource for ScriptedSource {
        fn open(&mut self) -> Result<CaptureFormat, AudioError> {
            if self.fail_open {
                return Err(AudioError::DeviceUnavailable("scripted".to_string()));
            }
            Ok(self.format)
        }

        fn start(&mut self, sink: ChunkSender) -> Result<(), AudioError> {
            for message in self.script.drain(..) {
                sink.send(message).unwrap();
            }
            self.sink = Some(sink);
            Ok(())
        }

        fn stop(&mut self) {
            self.sink = None;
        }
    }

    fn no_faults() -> FaultNotifier {
        Arc::new(|_, _| {})
    }

    #[test]
    fn stop_finalizes_everything_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let target = allocate_segment_path(dir.path(), "Artist - Song").unwrap();
        let script = (0..10)
            .map(|_| CaptureMessage::Chunk(vec![1_000; 800]))
            .collect();

        let session = CaptureSession::start(
            Uuid::new_v4(),
            "Artist - Song",
            Box::new(ScriptedSource::new(script)),
            target,
            LiveLevel::new(),
            no_faults(),
        )
        .unwrap();
        assert_eq!(session.label(), "Artist - Song");

        let finished = session.stop();
        assert_eq!(finished.frames, 4_000);
        assert_eq!(finished.bytes, 16_000);
        assert_eq!(finished.audio_duration(), Duration::from_millis(500));
        assert!(finished.fault.is_none());

        let reader = hound::WavReader::open(&finished.path).unwrap();
        assert_eq!(reader.duration(), 4_000);
        assert_eq!(reader.spec().channels, 2);
    }

    #[test]
    fn immediate_stop_leaves_valid_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = allocate_segment_path(dir.path(), "Short").unwrap();

        let session = CaptureSession::start(
            Uuid::new_v4(),
            "Short",
            Box::new(ScriptedSource::new(Vec::new())),
            target,
            LiveLevel::new(),
            no_faults(),
        )
        .unwrap();
        let finished = session.stop();

        assert_eq!(finished.frames, 0);
        let reader = hound::WavReader::open(&finished.path).unwrap();
        assert_eq!(reader.duration(), 0);
    }

    #[test]
    fn device_loss_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = allocate_segment_path(dir.path(), "Lost").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let on_fault: FaultNotifier = Arc::new(move |id, fault| {
            seen_in_cb.lock().unwrap().push((id, fault));
        });

        let id = Uuid::new_v4();
        let script = vec![
            CaptureMessage::Chunk(vec![5; 40]),
            CaptureMessage::DeviceLost("unplugged".to_string()),
            CaptureMessage::DeviceLost("unplugged".to_string()),
            CaptureMessage::Chunk(vec![5; 40]),
        ];
        let session = CaptureSession::start(
            id,
            "Lost",
            Box::new(ScriptedSource::new(script)),
            target,
            LiveLevel::new(),
            on_fault,
        )
        .unwrap();
        let finished = session.stop();

        assert_eq!(
            finished.fault,
            Some(SessionFault::DeviceLost("unplugged".to_string()))
        );
        // Chunks after the fault are not written
        assert_eq!(finished.frames, 20);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, id);
        // The raw file stays for inspection
        assert!(finished.path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_disk_faults_the_session() {
        let dir = tempfile::tempdir().unwrap();
        // Writes through the link fail with ENOSPC once the buffer flushes.
        let path = dir.path().join("Full.wav");
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let target = AllocatedPath {
            path: path.clone(),
            file,
            disambiguated: false,
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let on_fault: FaultNotifier = Arc::new(move |id, fault| {
            seen_in_cb.lock().unwrap().push((id, fault));
        });

        let id = Uuid::new_v4();
        let script = (0..10)
            .map(|_| CaptureMessage::Chunk(vec![1_000; 8_000]))
            .collect();
        let session = CaptureSession::start(
            id,
            "Full",
            Box::new(ScriptedSource::new(script)),
            target,
            LiveLevel::new(),
            on_fault,
        )
        .unwrap();
        let finished = session.stop();

        assert!(matches!(finished.fault, Some(SessionFault::Io(_))));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, id);
        assert!(matches!(seen[0].1, SessionFault::Io(_)));
    }

    #[test]
    fn failed_open_releases_the_claimed_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = allocate_segment_path(dir.path(), "Nope").unwrap();
        let path = target.path.clone();
        let mut source = ScriptedSource::new(Vec::new());
        source.fail_open = true;

        let result = CaptureSession::start(
            Uuid::new_v4(),
            "Nope",
            Box::new(source),
            target,
            LiveLevel::new(),
            no_faults(),
        );
        assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))));
        assert!(!path.exists());
    }

    #[test]
    fn meter_sees_the_same_stream() {
        let dir = tempfile::tempdir().unwrap();
        let target = allocate_segment_path(dir.path(), "Loud").unwrap();
        let live = LiveLevel::new();
        // 8 kHz stereo: one quarter-second window is 2000 frames
        let script = (0..5)
            .map(|_| CaptureMessage::Chunk(vec![16_384; 800]))
            .collect();

        let session = CaptureSession::start(
            Uuid::new_v4(),
            "Loud",
            Box::new(ScriptedSource::new(script)),
            target,
            live.clone(),
            no_faults(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while live.level_db() < -10.0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!((live.level_db() + 6.02).abs() < 0.05);

        session.stop();
        assert_eq!(live.level_db(), crate::audio::meter::MIN_DB);
    }
}

//! Loopback capture using CPAL
//!
//! The `LoopbackSource` owns the native stream on a dedicated audio thread and
//! hands 16-bit PCM chunks to whoever started it over a bounded channel.
//! Nothing in the driver callback blocks: a full channel drops the chunk and
//! bumps an overrun counter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use serde::Serialize;

/// Chunks buffered between the driver callback and the segment worker.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Device names that usually expose what the system is playing.
const LOOPBACK_HINTS: [&str; 4] = ["monitor", "loopback", "stereo mix", "blackhole"];

/// Errors that can occur while capturing or writing audio.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// No usable capture endpoint exists
    DeviceUnavailable(String),
    /// The endpoint disappeared while a session was running
    DeviceLost(String),
    StreamFailed(String),
    UnsupportedFormat(String),
    /// No free file name could be claimed for a segment
    FileConflict(String),
    Io(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "No capture device available: {}", e),
            AudioError::DeviceLost(e) => write!(f, "Capture device lost: {}", e),
            AudioError::StreamFailed(e) => write!(f, "Failed to run audio stream: {}", e),
            AudioError::UnsupportedFormat(e) => write!(f, "Unsupported audio format: {}", e),
            AudioError::FileConflict(e) => write!(f, "Could not claim an output file: {}", e),
            AudioError::Io(e) => write!(f, "Audio file I/O failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

impl From<std::io::Error> for AudioError {
    fn from(e: std::io::Error) -> Self {
        AudioError::Io(e.to_string())
    }
}

/// PCM layout delivered by a capture source.
///
/// Sample rate and channel count come from the endpoint; loopback capture
/// cannot be resampled. Samples are always delivered as 16-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl CaptureFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn bytes_per_frame(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} channels, {}-bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// Messages pushed from the driver side to the segment worker.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureMessage {
    /// Interleaved samples, whole frames
    Chunk(Vec<i16>),
    DeviceLost(String),
}

pub type ChunkSender = SyncSender<CaptureMessage>;
pub type ChunkReceiver = Receiver<CaptureMessage>;

/// Bounded hand-off between a capture source and its consumer.
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::sync_channel(CHUNK_CHANNEL_CAPACITY)
}

/// A push-style PCM source.
///
/// `start` hands the source the sending half of a chunk channel. The source
/// must release every clone of that sender when it stops, so the consumer sees
/// the channel close once the last chunk is delivered.
pub trait CaptureSource: Send {
    /// Open the endpoint and report the format it will deliver.
    fn open(&mut self) -> Result<CaptureFormat, AudioError>;

    /// Begin delivering chunks into `sink`.
    fn start(&mut self, sink: ChunkSender) -> Result<(), AudioError>;

    /// Halt delivery and release the device. Calling it when not started is a no-op.
    fn stop(&mut self);
}

/// Creates a fresh capture source for each recorded segment.
pub trait CaptureSourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn CaptureSource>;
}

impl<F> CaptureSourceFactory for F
where
    F: Fn() -> Box<dyn CaptureSource> + Send + Sync,
{
    fn create(&self) -> Box<dyn CaptureSource> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    /// Render device opened as an input stream (WASAPI loopback)
    OutputLoopback,
    /// Capture device that mirrors the output (PulseAudio monitor, BlackHole, ...)
    MonitorInput,
    DefaultInput,
}

struct Endpoint {
    device: Device,
    config: SupportedStreamConfig,
    kind: EndpointKind,
}

impl Endpoint {
    fn format(&self) -> CaptureFormat {
        CaptureFormat::pcm16(self.config.sample_rate().0, self.config.channels())
    }
}

fn select_endpoint(host: &Host) -> Result<Endpoint, AudioError> {
    if cfg!(target_os = "windows") {
        if let Some(device) = host.default_output_device() {
            if let Ok(config) = device.default_output_config() {
                return Ok(Endpoint {
                    device,
                    config,
                    kind: EndpointKind::OutputLoopback,
                });
            }
        }
    }

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            let name = device.name().unwrap_or_default().to_lowercase();
            if !LOOPBACK_HINTS.iter().any(|hint| name.contains(hint)) {
                continue;
            }
            if let Ok(config) = device.default_input_config() {
                return Ok(Endpoint {
                    device,
                    config,
                    kind: EndpointKind::MonitorInput,
                });
            }
        }
    }

    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no active capture endpoint".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

    Ok(Endpoint {
        device,
        config,
        kind: EndpointKind::DefaultInput,
    })
}

struct AudioThread {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Captures whatever the default output is playing.
pub struct LoopbackSource {
    format: Option<CaptureFormat>,
    thread: Option<AudioThread>,
    overruns: Arc<AtomicU64>,
}

impl LoopbackSource {
    pub fn new() -> Self {
        Self {
            format: None,
            thread: None,
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Chunks dropped because the consumer fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for LoopbackSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for LoopbackSource {
    fn open(&mut self) -> Result<CaptureFormat, AudioError> {
        let host = cpal::default_host();
        let endpoint = select_endpoint(&host)?;
        let format = endpoint.format();

        log::info!(
            "Using capture endpoint {:?} ({:?}): {}, native {:?}",
            endpoint.device.name(),
            endpoint.kind,
            format,
            endpoint.config.sample_format()
        );

        self.format = Some(format);
        Ok(format)
    }

    fn start(&mut self, sink: ChunkSender) -> Result<(), AudioError> {
        if self.thread.is_some() {
            return Ok(());
        }
        let expected = self
            .format
            .ok_or_else(|| AudioError::StreamFailed("source was not opened".to_string()))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);
        let overruns = self.overruns.clone();

        let handle = std::thread::Builder::new()
            .name("songcap-audio".to_string())
            .spawn(move || run_audio_thread(expected, sink, overruns, ready_tx, stop_rx))
            .map_err(|e| AudioError::StreamFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(AudioThread { stop_tx, handle });
                log::info!("Loopback capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamFailed(
                    "audio thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.stop_tx.send(());
            if thread.handle.join().is_err() {
                log::error!("Audio thread panicked while stopping");
            }
            log::info!(
                "Loopback capture stopped ({} chunks dropped)",
                self.overruns()
            );
        }
    }
}

impl Drop for LoopbackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the stream for its whole life; parks until told to stop.
fn run_audio_thread(
    expected: CaptureFormat,
    sink: ChunkSender,
    overruns: Arc<AtomicU64>,
    ready_tx: SyncSender<Result<(), AudioError>>,
    stop_rx: Receiver<()>,
) {
    let stream = match open_stream(expected, sink, overruns) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Returns on an explicit stop or when the source is dropped.
    let _ = stop_rx.recv();
    drop(stream);
}

fn open_stream(
    expected: CaptureFormat,
    sink: ChunkSender,
    overruns: Arc<AtomicU64>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let endpoint = select_endpoint(&host)?;
    if endpoint.format() != expected {
        return Err(AudioError::UnsupportedFormat(format!(
            "endpoint changed from {} to {}",
            expected,
            endpoint.format()
        )));
    }

    let sample_format = endpoint.config.sample_format();
    let config: StreamConfig = endpoint.config.into();
    let device = &endpoint.device;

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, &config, sink, overruns),
        SampleFormat::U16 => build_stream_typed::<u16>(device, &config, sink, overruns),
        SampleFormat::I32 => build_stream_typed::<i32>(device, &config, sink, overruns),
        SampleFormat::F32 => build_stream_typed::<f32>(device, &config, sink, overruns),
        SampleFormat::F64 => build_stream_typed::<f64>(device, &config, sink, overruns),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    sink: ChunkSender,
    overruns: Arc<AtomicU64>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_sink = sink.clone();
    let err_fn = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            log::error!("Capture device is no longer available");
            let _ = err_sink.send(CaptureMessage::DeviceLost(
                "capture device is no longer available".to_string(),
            ));
        }
        other => log::error!("Audio stream error: {}", other),
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let chunk: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                match sink.try_send(CaptureMessage::Chunk(chunk)) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        overruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamFailed(e.to_string()))
}

/// Convert any sample type to i16 for WAV writing.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

//! Peak level metering for the capture stream
//!
//! `LevelMeter` runs inside the segment worker and folds every chunk into a
//! per-channel peak over a quarter-second window. When a window completes the
//! peaks are converted to decibels and published to a `LiveLevel`, which the
//! UI side can read from any thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::capture::CaptureFormat;

/// Floor of the meter scale
pub const MIN_DB: f32 = -60.0;

/// Ceiling of the meter scale
pub const MAX_DB: f32 = 18.0;

/// Channels exposed to the UI (left/right; mono is mirrored)
pub const METER_CHANNELS: usize = 2;

/// Windows per second of audio
const WINDOWS_PER_SECOND: u32 = 4;

/// Convert a linear amplitude (0.0-1.0) to decibels clamped to the meter scale.
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 || !amplitude.is_finite() {
        return MIN_DB;
    }
    (20.0 * amplitude.log10()).clamp(MIN_DB, MAX_DB)
}

/// Thread-safe view of the most recent meter reading.
#[derive(Clone, Debug)]
pub struct LiveLevel {
    levels: Arc<[AtomicU32; METER_CHANNELS]>,
}

impl LiveLevel {
    pub fn new() -> Self {
        Self {
            levels: Arc::new([
                AtomicU32::new(MIN_DB.to_bits()),
                AtomicU32::new(MIN_DB.to_bits()),
            ]),
        }
    }

    pub fn set_channel_db(&self, channel: usize, db: f32) {
        if let Some(slot) = self.levels.get(channel) {
            slot.store(db.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn channel_db(&self, channel: usize) -> f32 {
        self.levels
            .get(channel)
            .map(|slot| f32::from_bits(slot.load(Ordering::Relaxed)))
            .unwrap_or(MIN_DB)
    }

    /// Loudest channel.
    pub fn level_db(&self) -> f32 {
        (0..METER_CHANNELS)
            .map(|ch| self.channel_db(ch))
            .fold(MIN_DB, f32::max)
    }

    pub fn channels_db(&self) -> [f32; METER_CHANNELS] {
        [self.channel_db(0), self.channel_db(1)]
    }

    pub fn reset(&self) {
        for channel in 0..METER_CHANNELS {
            self.set_channel_db(channel, MIN_DB);
        }
    }
}

impl Default for LiveLevel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LevelMeter {
    channels: usize,
    window_frames: usize,
    /// Float copy of the incoming chunk; grows to fit, never truncates
    scratch: Vec<f32>,
    peaks: Vec<f32>,
    next_channel: usize,
    frames_in_window: usize,
    latest_db: Vec<f32>,
    live: LiveLevel,
}

impl LevelMeter {
    pub fn new(format: &CaptureFormat, live: LiveLevel) -> Self {
        let channels = format.channels.max(1) as usize;
        let window_frames = (format.sample_rate / WINDOWS_PER_SECOND).max(1) as usize;

        Self {
            channels,
            window_frames,
            scratch: Vec::new(),
            peaks: vec![0.0; channels],
            next_channel: 0,
            frames_in_window: 0,
            latest_db: vec![MIN_DB; channels],
            live,
        }
    }

    pub fn window_frames(&self) -> usize {
        self.window_frames
    }

    /// Fold interleaved samples into the running window.
    pub fn feed(&mut self, samples: &[i16]) {
        if self.scratch.len() < samples.len() {
            self.scratch.resize(samples.len(), 0.0);
        }
        for (dst, &src) in self.scratch.iter_mut().zip(samples) {
            *dst = src as f32 / 32768.0;
        }

        for i in 0..samples.len() {
            let value = self.scratch[i].abs();
            let peak = &mut self.peaks[self.next_channel];
            if value > *peak {
                *peak = value;
            }

            self.next_channel += 1;
            if self.next_channel == self.channels {
                self.next_channel = 0;
                self.frames_in_window += 1;
                if self.frames_in_window == self.window_frames {
                    self.publish();
                }
            }
        }
    }

    /// Most recent reading of the loudest channel, in dB.
    pub fn read(&self) -> f32 {
        self.latest_db.iter().copied().fold(MIN_DB, f32::max)
    }

    pub fn read_channels(&self) -> &[f32] {
        &self.latest_db
    }

    /// Drop the partial window and put the live reading back to the floor.
    pub fn reset(&mut self) {
        self.peaks.iter_mut().for_each(|p| *p = 0.0);
        self.latest_db.iter_mut().for_each(|db| *db = MIN_DB);
        self.next_channel = 0;
        self.frames_in_window = 0;
        self.live.reset();
    }

    fn publish(&mut self) {
        for (channel, peak) in self.peaks.iter_mut().enumerate() {
            self.latest_db[channel] = amplitude_to_db(*peak);
            *peak = 0.0;
        }
        self.frames_in_window = 0;

        if self.channels == 1 {
            self.live.set_channel_db(0, self.latest_db[0]);
            self.live.set_channel_db(1, self.latest_db[0]);
        } else {
            for channel in 0..METER_CHANNELS {
                self.live.set_channel_db(channel, self.latest_db[channel]);
            }
        }
    }

    #[cfg(test)]
    fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

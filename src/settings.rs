use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::default_output_dir;

const SETTINGS_DIR_NAME: &str = "songcap";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Bitrates the encoder is offered (kbps).
pub const SUPPORTED_BITRATES: [u32; 5] = [96, 128, 160, 192, 320];
pub const DEFAULT_BITRATE_KBPS: u32 = 128;

/// Faster polling than this only burns CPU on process lookups.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Where raw segments and encoded tracks are written.
    pub output_dir: PathBuf,

    /// Target bitrate for encoded tracks; one of `SUPPORTED_BITRATES`.
    pub bitrate_kbps: u32,

    /// Drop segments shorter than `skip_threshold_secs` instead of encoding them
    /// (ads and skipped tracks).
    pub skip_enabled: bool,
    pub skip_threshold_secs: u64,

    /// How often the player's window title is polled.
    pub poll_interval_ms: u64,

    /// A poll that has not answered by then reads as "nothing playing".
    pub poll_timeout_ms: u64,

    /// Encoder executable, looked up on PATH unless absolute.
    pub encoder_program: String,

    /// Encoder runs longer than this are killed and the job fails.
    pub encoder_timeout_secs: u64,

    pub max_concurrent_transcodes: usize,

    /// Process whose main window title carries the now-playing text.
    pub player_process: String,

    /// Decoration the player puts in front of the track in its title.
    pub title_prefix: String,

    /// Titles the player shows when nothing is playing.
    pub idle_titles: Vec<String>,

    /// Titles this short or shorter are treated as "nothing playing".
    pub min_title_len: usize,

    /// Start armed so the first track change begins recording.
    pub auto_arm: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            skip_enabled: false,
            skip_threshold_secs: 30,
            poll_interval_ms: 100,
            poll_timeout_ms: 2_000,
            encoder_program: "lame".to_string(),
            encoder_timeout_secs: 20,
            max_concurrent_transcodes: 2,
            player_process: "spotify".to_string(),
            title_prefix: "Spotify - ".to_string(),
            idle_titles: vec![
                "Spotify".to_string(),
                "Spotify Free".to_string(),
                "Spotify Premium".to_string(),
            ],
            min_title_len: 7,
            auto_arm: true,
        }
    }
}

impl AppSettings {
    /// Skip threshold when enabled.
    pub fn skip_threshold(&self) -> Option<Duration> {
        self.skip_enabled
            .then(|| Duration::from_secs(self.skip_threshold_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(self.poll_interval_ms))
    }

    pub fn encoder_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_timeout_secs)
    }

    /// Coerce out-of-range values back to something usable.
    pub fn validated(mut self) -> Self {
        if !SUPPORTED_BITRATES.contains(&self.bitrate_kbps) {
            log::warn!(
                "Settings: unsupported bitrate {} kbps, using {}",
                self.bitrate_kbps,
                DEFAULT_BITRATE_KBPS
            );
            self.bitrate_kbps = DEFAULT_BITRATE_KBPS;
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            log::warn!(
                "Settings: poll interval {}ms too short, using {}ms",
                self.poll_interval_ms,
                MIN_POLL_INTERVAL_MS
            );
            self.poll_interval_ms = MIN_POLL_INTERVAL_MS;
        }
        if self.max_concurrent_transcodes == 0 {
            self.max_concurrent_transcodes = 1;
        }
        self
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    let settings = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    };
    settings.validated()
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Temp file in the same directory, then rename over the real one.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename refuses to replace an existing file.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

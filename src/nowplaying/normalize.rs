//! Turning raw window titles into now-playing labels

use crate::settings::AppSettings;

/// Maps raw text from a now-playing source to a label.
///
/// An empty label means nothing identifiable is playing.
pub trait LabelNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

impl<F> LabelNormalizer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn normalize(&self, raw: &str) -> String {
        self(raw)
    }
}

/// Window-title heuristic for desktop players.
///
/// Titles no longer than `min_len` characters, or equal to one of the player's
/// idle titles, yield the empty label. Otherwise the decoration prefix is
/// stripped when present and the rest is trimmed.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTitleNormalizer {
    prefix: String,
    idle_titles: Vec<String>,
    min_len: usize,
}

impl WindowTitleNormalizer {
    pub fn new(prefix: impl Into<String>, idle_titles: Vec<String>, min_len: usize) -> Self {
        Self {
            prefix: prefix.into(),
            idle_titles,
            min_len,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(
            settings.title_prefix.clone(),
            settings.idle_titles.clone(),
            settings.min_title_len,
        )
    }
}

impl Default for WindowTitleNormalizer {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

impl LabelNormalizer for WindowTitleNormalizer {
    fn normalize(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.chars().count() <= self.min_len {
            return String::new();
        }
        if raw == self.prefix.trim() || self.idle_titles.iter().any(|idle| idle == raw) {
            return String::new();
        }

        raw.strip_prefix(self.prefix.as_str())
            .unwrap_or(raw)
            .trim()
            .to_string()
    }
}

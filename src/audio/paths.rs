//! Output file naming
//!
//! Raw segments and their encoded counterparts share one directory and are
//! named after the segment label: `<dir>/<stem>.wav` while recording,
//! `<dir>/<stem>.mp3` once transcoded. A label that collides with an existing
//! file gets a ` (2)`, ` (3)`, ... suffix instead of overwriting it.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub const RAW_EXTENSION: &str = "wav";
pub const ENCODED_EXTENSION: &str = "mp3";

/// Longest stem we generate, in bytes
const MAX_STEM_BYTES: usize = 120;

/// Suffixes tried before giving up on a label
const MAX_DISAMBIGUATION: u32 = 999;

const FALLBACK_STEM: &str = "untitled";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Default output directory.
/// Returns: ~/Music/songcap/ (or the platform equivalent)
pub fn default_output_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("songcap")
}

/// Turn a label into something every common file system accepts.
pub fn sanitize_file_stem(label: &str) -> String {
    let replaced: String = label
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut stem = truncate_on_char_boundary(replaced.trim(), MAX_STEM_BYTES)
        .trim_end_matches(['.', ' '])
        .to_string();

    let base = stem.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(base)) {
        stem.insert(0, '_');
    }

    if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem
    }
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Where the encoded file for a raw segment goes.
pub fn encoded_path_for(raw: &Path) -> PathBuf {
    raw.with_extension(ENCODED_EXTENSION)
}

/// A raw segment file claimed exclusively for one session.
#[derive(Debug)]
pub struct AllocatedPath {
    pub path: PathBuf,
    pub file: File,
    /// True when a suffix was needed to avoid an existing file
    pub disambiguated: bool,
}

/// Claim a fresh raw file for `label` inside `dir`, creating `dir` if needed.
///
/// A candidate is only taken when neither its raw nor its encoded name exists,
/// so a finished recording of the same track is never overwritten. The raw
/// file is created with create-new semantics; losing a race just moves on to
/// the next suffix.
pub fn allocate_segment_path(dir: &Path, label: &str) -> io::Result<AllocatedPath> {
    fs::create_dir_all(dir)?;
    let stem = sanitize_file_stem(label);

    for n in 1..=MAX_DISAMBIGUATION {
        let candidate_stem = if n == 1 {
            stem.clone()
        } else {
            format!("{} ({})", stem, n)
        };
        let raw = dir.join(format!("{}.{}", candidate_stem, RAW_EXTENSION));
        if encoded_path_for(&raw).exists() {
            continue;
        }

        match OpenOptions::new().write(true).create_new(true).open(&raw) {
            Ok(file) => {
                if n > 1 {
                    log::info!("Output name for {:?} taken, using {:?}", label, raw);
                }
                return Ok(AllocatedPath {
                    path: raw,
                    file,
                    disambiguated: n > 1,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {:?} in {:?}", label, dir),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsafe_characters_are_replaced() {
        assert_eq!(
            sanitize_file_stem("AC/DC - Back: In <Black>?"),
            "AC_DC - Back_ In _Black__"
        );
        assert_eq!(sanitize_file_stem("a\\b|c*d\"e"), "a_b_c_d_e");
        assert_eq!(sanitize_file_stem("tab\there"), "tab_here");
    }

    #[test]
    fn trailing_dots_and_spaces_are_trimmed() {
        assert_eq!(sanitize_file_stem("  Song...  "), "Song");
    }

    #[test]
    fn empty_labels_fall_back() {
        assert_eq!(sanitize_file_stem(""), "untitled");
        assert_eq!(sanitize_file_stem(" . "), "untitled");
    }

    #[test]
    fn reserved_device_names_are_prefixed() {
        assert_eq!(sanitize_file_stem("con"), "_con");
        assert_eq!(sanitize_file_stem("LPT1.txt"), "_LPT1.txt");
        assert_eq!(sanitize_file_stem("Console"), "Console");
    }

    #[test]
    fn long_labels_truncate_on_char_boundary() {
        let label = "é".repeat(200);
        let stem = sanitize_file_stem(&label);
        assert!(stem.len() <= MAX_STEM_BYTES);
        assert!(stem.chars().all(|c| c == 'é'));
    }

    #[test]
    fn encoded_path_swaps_extension() {
        assert_eq!(
            encoded_path_for(Path::new("/music/A - B.wav")),
            PathBuf::from("/music/A - B.mp3")
        );
    }

    #[test]
    fn allocation_disambiguates_instead_of_overwriting() {
        let dir = tempfile::tempdir().unwrap();

        let first = allocate_segment_path(dir.path(), "Artist - Song").unwrap();
        assert_eq!(first.path, dir.path().join("Artist - Song.wav"));
        assert!(!first.disambiguated);

        let second = allocate_segment_path(dir.path(), "Artist - Song").unwrap();
        assert_eq!(second.path, dir.path().join("Artist - Song (2).wav"));
        assert!(second.disambiguated);
    }

    #[test]
    fn finished_recording_blocks_the_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Song.mp3"), b"done").unwrap();

        let allocated = allocate_segment_path(dir.path(), "Song").unwrap();
        assert_eq!(allocated.path, dir.path().join("Song (2).wav"));
        assert_eq!(std::fs::read(dir.path().join("Song.mp3")).unwrap(), b"done");
    }

    #[test]
    fn allocation_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let allocated = allocate_segment_path(&nested, "x/y").unwrap();
        assert_eq!(allocated.path, nested.join("x_y.wav"));
        assert!(allocated.path.exists());
    }
}

//! External encoder command lines

use tokio::process::Command;

use super::TranscodeJob;

/// Builds the process invocation for one job.
///
/// The queue owns stdio, kill-on-drop and the deadline; implementations only
/// describe what to run.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    fn command(&self, job: &TranscodeJob) -> Command;
}

/// LAME: `lame -b <kbps> --tt <title> --ta <artist> <in.wav> <out.mp3>`
#[derive(Debug, Clone)]
pub struct LameEncoder {
    program: String,
}

impl LameEncoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(job: &TranscodeJob) -> Vec<String> {
        vec![
            "-b".to_string(),
            job.bitrate_kbps.to_string(),
            "--tt".to_string(),
            job.tag.title.clone(),
            "--ta".to_string(),
            job.tag.artist.clone(),
            job.raw_path.to_string_lossy().into_owned(),
            job.target_path.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for LameEncoder {
    fn default() -> Self {
        Self::new("lame")
    }
}

impl Encoder for LameEncoder {
    fn name(&self) -> &str {
        &self.program
    }

    fn command(&self, job: &TranscodeJob) -> Command {
        let mut command = Command::new(&self.program);
        command.args(Self::args(job));
        command
    }
}

//! Where the raw now-playing text comes from
//!
//! The desktop players we follow expose the current track only through the
//! title of their main window. The provided source finds the player's
//! processes with `sysinfo`, then reads the title of a visible window they
//! own: through `EnumWindows` on Windows, through the host's window tooling
//! elsewhere. Every failure (player not running, tool missing, no window,
//! tool too slow) collapses to `None`.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// Host tools that have not answered by then are killed
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(1);

const TOOL_POLL: Duration = Duration::from_millis(5);

/// Supplies the raw title text of the player being followed.
pub trait NowPlayingSource: Send + Sync {
    /// `None` when the player is not running or has no titled window.
    fn window_title(&self) -> Option<String>;
}

impl<F> NowPlayingSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn window_title(&self) -> Option<String> {
        self()
    }
}

/// Reads the main window title of a running process by name.
#[derive(Debug, Clone)]
pub struct ProcessWindowSource {
    process_name: String,
    tool_timeout: Duration,
}

impl ProcessWindowSource {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Ids of running processes whose executable is the player.
    fn player_pids(&self) -> Vec<u32> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        sys.processes()
            .iter()
            .filter(|(_, process)| {
                is_process_named(&process.name().to_string_lossy(), &self.process_name)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    #[cfg(target_os = "windows")]
    fn query(&self, pids: &[u32]) -> Option<String> {
        windows_titles::visible_window_titles(pids)
            .into_iter()
            .map(|title| title.trim().to_string())
            .find(|title| !title.is_empty())
    }

    #[cfg(target_os = "macos")]
    fn query(&self, _pids: &[u32]) -> Option<String> {
        let process = capitalize(&self.process_name);
        let script = format!(
            "tell application \"System Events\" to if exists process \"{0}\" then get name of window 1 of process \"{0}\"",
            process
        );
        let mut command = Command::new("osascript");
        command.args(["-e", script.as_str()]);
        run_tool(command, self.tool_timeout)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    fn query(&self, _pids: &[u32]) -> Option<String> {
        let mut command = Command::new("xdotool");
        command.args([
            "search",
            "--onlyvisible",
            "--class",
            self.process_name.as_str(),
            "getwindowname",
        ]);
        run_tool(command, self.tool_timeout)
    }
}

impl NowPlayingSource for ProcessWindowSource {
    fn window_title(&self) -> Option<String> {
        let pids = self.player_pids();
        if pids.is_empty() {
            return None;
        }
        self.query(&pids)
    }
}

/// Whether a process name from the process table is the player
/// (`Spotify.exe`, `spotify` and `Spotify` all match `spotify`).
pub fn is_process_named(process: &str, wanted: &str) -> bool {
    let process = process.trim();
    let stem = process
        .len()
        .checked_sub(4)
        .filter(|&cut| process.is_char_boundary(cut) && process[cut..].eq_ignore_ascii_case(".exe"))
        .map_or(process, |cut| &process[..cut]);
    !wanted.is_empty() && stem.eq_ignore_ascii_case(wanted.trim())
}

/// Run a window tool and return the first line it prints.
///
/// The tool is killed once `timeout` passes; a non-zero exit (xdotool exits 1
/// when no window matches) or no output gives `None`.
pub fn run_tool(mut command: Command, timeout: Duration) -> Option<String> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| log::trace!("{} unavailable: {}", program, e))
        .ok()?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if started.elapsed() >= timeout => {
                log::warn!("{} did not answer within {:?}, killing it", program, timeout);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => std::thread::sleep(TOOL_POLL),
            Err(e) => {
                log::debug!("Waiting for {} failed: {}", program, e);
                let _ = child.kill();
                return None;
            }
        }
    }

    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    first_title_line(&String::from_utf8_lossy(&output.stdout))
}

/// First non-empty line of tool output.
pub fn first_title_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(target_os = "macos")]
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(target_os = "windows")]
mod windows_titles {
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowTextLengthW, GetWindowTextW, GetWindowThreadProcessId,
        IsWindowVisible,
    };

    struct WindowScan<'a> {
        pids: &'a [u32],
        titles: Vec<String>,
    }

    /// Titles of visible top-level windows owned by `pids`, in z-order.
    pub(super) fn visible_window_titles(pids: &[u32]) -> Vec<String> {
        let mut scan = WindowScan {
            pids,
            titles: Vec::new(),
        };
        unsafe {
            let _ = EnumWindows(
                Some(collect_title),
                LPARAM(&mut scan as *mut WindowScan<'_> as isize),
            );
        }
        scan.titles
    }

    unsafe extern "system" fn collect_title(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let scan = &mut *(lparam.0 as *mut WindowScan<'_>);

        if !IsWindowVisible(hwnd).as_bool() {
            return BOOL(1);
        }

        let mut pid: u32 = 0;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        if !scan.pids.contains(&pid) {
            return BOOL(1);
        }

        let len = GetWindowTextLengthW(hwnd);
        if len <= 0 {
            return BOOL(1);
        }
        let mut buf = vec![0u16; len as usize + 1];
        let copied = GetWindowTextW(hwnd, &mut buf);
        if copied > 0 {
            scan.titles
                .push(String::from_utf16_lossy(&buf[..copied as usize]));
        }

        BOOL(1)
    }
}

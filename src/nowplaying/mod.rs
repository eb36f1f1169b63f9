//! Now-playing label polling
//!
//! The monitor asks a `NowPlayingSource` for the player's raw title on a fixed
//! cadence, normalizes it, and forwards the label to the state machine: the
//! first poll as a baseline, later polls only when the label differs from the
//! previously observed one.

mod normalize;
mod source;

pub use normalize::{LabelNormalizer, WindowTitleNormalizer};
pub use source::{
    first_title_line, is_process_named, run_tool, NowPlayingSource, ProcessWindowSource,
    DEFAULT_TOOL_TIMEOUT,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::state_machine::Event;

/// Normalized now-playing text; empty means nothing identifiable is playing.
pub type NowPlayingLabel = String;

/// Result of comparing a fresh label to the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First label ever seen
    Baseline(NowPlayingLabel),
    Changed {
        previous: NowPlayingLabel,
        current: NowPlayingLabel,
    },
    Unchanged,
}

pub struct NowPlayingMonitor {
    source: Arc<dyn NowPlayingSource>,
    normalizer: Arc<dyn LabelNormalizer>,
    last: Option<NowPlayingLabel>,
}

impl NowPlayingMonitor {
    pub fn new(source: Arc<dyn NowPlayingSource>, normalizer: Arc<dyn LabelNormalizer>) -> Self {
        Self {
            source,
            normalizer,
            last: None,
        }
    }

    /// Query the source once. A missing player yields the empty label.
    pub fn poll(&self) -> NowPlayingLabel {
        poll_label(self.source.as_ref(), self.normalizer.as_ref())
    }

    /// Compare `label` to the last observed one and remember it.
    pub fn observe(&mut self, label: NowPlayingLabel) -> Observation {
        match self.last.replace(label.clone()) {
            None => Observation::Baseline(label),
            Some(previous) if previous == label => Observation::Unchanged,
            Some(previous) => Observation::Changed {
                previous,
                current: label,
            },
        }
    }

    pub fn last_label(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

fn poll_label(source: &dyn NowPlayingSource, normalizer: &dyn LabelNormalizer) -> NowPlayingLabel {
    source
        .window_title()
        .map(|raw| normalizer.normalize(&raw))
        .unwrap_or_default()
}

/// One poll on the blocking pool, bounded by `poll_timeout`.
async fn timed_poll(
    monitor: &NowPlayingMonitor,
    poll_timeout: Duration,
    abandoned: &Arc<AtomicUsize>,
) -> NowPlayingLabel {
    let source = monitor.source.clone();
    let normalizer = monitor.normalizer.clone();
    let mut poll =
        tokio::task::spawn_blocking(move || poll_label(source.as_ref(), normalizer.as_ref()));

    match tokio::time::timeout(poll_timeout, &mut poll).await {
        Ok(Ok(label)) => label,
        Ok(Err(e)) => {
            log::warn!("Now-playing poll panicked: {}", e);
            String::new()
        }
        Err(_) => {
            log::warn!(
                "Now-playing source did not answer within {:?}, treating as not playing",
                poll_timeout
            );
            abandoned.fetch_add(1, Ordering::SeqCst);
            let abandoned = abandoned.clone();
            tokio::spawn(async move {
                let _ = poll.await;
                abandoned.fetch_sub(1, Ordering::SeqCst);
            });
            String::new()
        }
    }
}

/// Polls still running after their deadline. Past this many, ticks report
/// the empty label without asking the source again.
const MAX_ABANDONED_POLLS: usize = 2;

/// Poll until cancelled or until the state machine goes away.
///
/// Each poll runs on the blocking pool since sources shell out to host tools.
/// A poll that has not answered within `poll_timeout` counts as "nothing
/// playing" and is left to finish on its own. Ticks missed while a slow poll
/// is running are skipped, not bunched up.
pub async fn run_monitor(
    mut monitor: NowPlayingMonitor,
    interval: Duration,
    poll_timeout: Duration,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    log::info!(
        "Now-playing monitor started (every {:?}, deadline {:?})",
        interval,
        poll_timeout
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let abandoned = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let label = if abandoned.load(Ordering::SeqCst) >= MAX_ABANDONED_POLLS {
            log::debug!("Now-playing source still stuck, skipping poll");
            String::new()
        } else {
            timed_poll(&monitor, poll_timeout, &abandoned).await
        };

        let event = match monitor.observe(label) {
            Observation::Unchanged => continue,
            Observation::Baseline(label) => {
                log::info!("Now playing (baseline): {:?}", label);
                Event::LabelBaseline { label }
            }
            Observation::Changed { previous, current } => {
                log::info!("Now playing changed: {:?} -> {:?}", previous, current);
                Event::LabelChanged { label: current }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(event) => {
                if sent.is_err() {
                    log::debug!("State loop closed, stopping now-playing monitor");
                    break;
                }
            }
        }
    }

    log::info!("Now-playing monitor stopped");
}

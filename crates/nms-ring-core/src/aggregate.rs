//! Level aggregator: coalesces a burst of severity tags into one ring.
//!
//! One rendering pass of the probe tool prints many grade tags (one per
//! visible region). Only the single best result should ring, and only once,
//! so the aggregator keeps a debounce window instead of firing per tag:
//!
//! ```text
//! Idle --pass marker--> Open --delay elapses--> flush --> Idle
//! ```
//!
//! While the window is open, incoming events fold into a running maximum;
//! on expiry the maximum (if any) is dispatched exactly once. The window
//! never holds an event log, so memory stays O(1) no matter how large the
//! burst is.
//!
//! The window state is owned by a single consumer task and reached only
//! through one mpsc channel, so no locking is involved. A flush observes
//! every event enqueued before its timer tick; events enqueued afterwards
//! belong to the next window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::level::Severity;

/// Dispatch target for a flushed window. The proxy wires this to the ring
/// player; tests substitute a recording stub.
pub trait Notify: Send + Sync {
    fn notify(&self, level: Severity);
}

/// Input to the aggregation window.
#[derive(Debug, Clone, Copy)]
pub enum WindowEvent {
    /// A rendering pass finished: open (or reset) the window.
    PassComplete,
    /// One severity tag observed in the output.
    Level(Severity),
}

/// Sender half handed to the classifier path.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<WindowEvent>,
}

impl AggregatorHandle {
    pub fn pass_complete(&self) {
        let _ = self.tx.send(WindowEvent::PassComplete);
    }

    pub fn level(&self, level: Severity) {
        let _ = self.tx.send(WindowEvent::Level(level));
    }
}

/// Spawn the aggregator's flush loop.
///
/// The loop ends when every handle is dropped or the shutdown signal fires;
/// either way a pending unflushed maximum is discarded, so no ring can fire
/// after cancellation.
pub fn spawn(
    delay: Duration,
    notifier: Arc<dyn Notify>,
    shutdown: watch::Receiver<bool>,
) -> (AggregatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(flush_loop(delay, rx, notifier, shutdown));
    (AggregatorHandle { tx }, handle)
}

async fn flush_loop(
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<WindowEvent>,
    notifier: Arc<dyn Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The whole window: a deadline while open, and the running maximum.
    let mut deadline: Option<Instant> = None;
    let mut highest: Option<Severity> = None;

    loop {
        // select! needs an armed future even when the window is idle; the
        // far-future fallback is never awaited because of the guard.
        let expiry = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        // Biased: shutdown wins any race, and every event already enqueued
        // is folded in before the timer branch can flush the window.
        tokio::select! {
            biased;

            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("shutdown observed, discarding pending window");
                return;
            }

            event = rx.recv() => match event {
                Some(WindowEvent::PassComplete) => {
                    trace!("pass complete, window opened");
                    deadline = Some(Instant::now() + delay);
                    highest = None;
                }
                Some(WindowEvent::Level(level)) => {
                    if deadline.is_some() {
                        let folded = highest.map_or(level, |h| h.max(level));
                        trace!(%level, best = %folded, "level event folded");
                        highest = Some(folded);
                    } else {
                        trace!(%level, "level event outside window, ignored");
                    }
                }
                None => {
                    debug!("aggregator channel closed, discarding pending window");
                    return;
                }
            },

            _ = sleep_until(expiry), if deadline.is_some() => {
                deadline = None;
                if let Some(level) = highest.take() {
                    debug!(%level, "window flushed");
                    notifier.notify(level);
                }
            }
        }
    }
}

//! Single-slot handoff between frame acquisition and the detector.

use crate::annotate::Annotator;
use crate::detect::{detect_shared, SharedDetector};
use crate::frame::Frame;
use crate::report::FrameReport;
use crossbeam_channel::{Sender, TrySendError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

enum SlotState {
    Empty,
    Pending(Frame),
    InFlight,
}

/// Holds at most one frame waiting for, or undergoing, analysis.
///
/// A frame is accepted only while the slot is empty: neither a waiting
/// frame nor one still being analysed may be displaced or queued behind.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Places `frame` in the slot if it is empty. Never blocks; returns
    /// `false` and drops the frame when the slot is occupied.
    pub fn offer(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Pending(frame);
            self.ready.notify_one();
            true
        } else {
            false
        }
    }

    /// Waits up to `timeout` for a pending frame and claims it. The slot
    /// stays occupied until the returned claim is dropped.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Claim<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if matches!(*state, SlotState::Pending(_)) {
                let SlotState::Pending(frame) = std::mem::replace(&mut *state, SlotState::InFlight)
                else {
                    unreachable!("slot checked as pending");
                };
                return Some(Claim { slot: self, frame });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self.lock(), SlotState::Empty)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(*self.lock(), SlotState::InFlight)
    }

    fn release(&self) {
        *self.lock() = SlotState::Empty;
    }
}

/// A frame taken out of the slot. Dropping it frees the slot.
pub struct Claim<'a> {
    slot: &'a FrameSlot,
    frame: Frame,
}

impl Deref for Claim<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// What the worker hands back for each analysed frame.
#[derive(Clone, Debug)]
pub struct RelayOutput {
    pub annotated: Frame,
    pub report: FrameReport,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub submitted: u64,
    pub dropped: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Background detection worker fed through a [`FrameSlot`].
pub struct Relay {
    slot: Arc<FrameSlot>,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn spawn(
        detector: SharedDetector,
        annotator: Annotator,
        sink: Sender<RelayOutput>,
        idle: Duration,
    ) -> Self {
        let slot = Arc::new(FrameSlot::new());
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_slot = slot.clone();
        let worker_counters = counters.clone();
        let worker_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("detect-relay".into())
            .spawn(move || {
                run_worker(
                    &worker_slot,
                    &detector,
                    &annotator,
                    &sink,
                    &worker_counters,
                    &worker_shutdown,
                    idle,
                )
            });
        let join = match join {
            Ok(j) => Some(j),
            Err(e) => {
                error!("failed to spawn relay worker: {e}");
                None
            }
        };
        Self {
            slot,
            counters,
            shutdown,
            join,
        }
    }

    /// Hands `frame` to the worker; `false` means the worker is busy and
    /// the frame was discarded.
    pub fn submit(&self, frame: Frame) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let accepted = self.slot.offer(frame);
        if !accepted {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("relay busy, frame dropped");
        }
        accepted
    }

    pub fn is_idle(&self) -> bool {
        self.slot.is_empty()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker after its current frame and waits for it.
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow::anyhow!("relay worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn run_worker(
    slot: &FrameSlot,
    detector: &SharedDetector,
    annotator: &Annotator,
    sink: &Sender<RelayOutput>,
    counters: &Counters,
    shutdown: &AtomicBool,
    idle: Duration,
) {
    debug!("relay worker started");
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = slot.take_timeout(idle) else {
            continue;
        };
        let start = Instant::now();
        let detections = match detect_shared(detector, &frame) {
            Ok(d) => d,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("detection failed, frame skipped: {e}");
                continue;
            }
        };
        let report = FrameReport::new(detections, start.elapsed());
        let annotated = annotator.annotate(&frame, &report.detections);
        drop(frame);
        counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            detections = report.detections.len(),
            elapsed = ?report.elapsed,
            "frame analysed"
        );
        match sink.try_send(RelayOutput { annotated, report }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("display behind, result dropped"),
            Err(TrySendError::Disconnected(_)) => {
                debug!("display gone, relay worker exiting");
                break;
            }
        }
    }
    debug!("relay worker stopped");
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

/// Grants exclusive use of the camera device to one stream at a time.
///
/// Every [`acquire`](Self::acquire) or [`stop_all`](Self::stop_all) bumps an
/// epoch; a stream holding an older lease sees it go stale before its next
/// frame, releases the device, and lets the newcomer in.
#[derive(Default)]
pub struct CameraGate {
    epoch: AtomicU64,
    device: Mutex<()>,
}

pub struct CameraLease<'a> {
    gate: &'a CameraGate,
    epoch: u64,
    _device: MutexGuard<'a, ()>,
}

impl CameraGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preempts any current stream and blocks until the device is free.
    pub fn acquire(&self) -> CameraLease<'_> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let device = self.device.lock().unwrap_or_else(|p| p.into_inner());
        CameraLease {
            gate: self,
            epoch,
            _device: device,
        }
    }

    /// Asks every active stream to release the device. Returns whether a
    /// stream was holding it; calling this with no stream is a no-op.
    pub fn stop_all(&self) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        matches!(self.device.try_lock(), Err(TryLockError::WouldBlock))
    }
}

impl CameraLease<'_> {
    pub fn is_current(&self) -> bool {
        self.gate.epoch.load(Ordering::SeqCst) == self.epoch
    }
}

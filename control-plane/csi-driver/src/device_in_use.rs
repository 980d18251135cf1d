//! Device in use tracking for NodeUnstageVolume.
//!
//! After the staging path is unmounted the device may still be referenced by a lower layer,
//! for example a device mapper cache which hasn't let go of it yet. Instead of waiting for it
//! in-process, the unstage call fails and the CO retries. The first time a device is seen in
//! use is recorded and once the configured timeout has elapsed since then, the next retry gives
//! up on waiting and reports success.
use snafu::Snafu;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// A source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outcome of checking whether a device has been released.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceCheck {
    /// Nothing references the device anymore.
    Unused,
    /// The device is still referenced; retry later.
    Blocking { reason: String },
    /// It is not possible to tell whether the device is still referenced, but the unmount has
    /// already succeeded so there is nothing left to wait for.
    Ignorable { reason: String },
    /// Unstage must fail now, without starting or clearing the wait for the device.
    Fatal { reason: String },
}

/// Device in use tracker errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("NodeUnstageVolume for volume {volume_id} failed: {reason}"))]
    StillInUse { volume_id: String, reason: String },
    #[snafu(display(
        "NodeUnstageVolume for volume {volume_id} failed to check if the device is in use: {reason}"
    ))]
    CheckFailed { volume_id: String, reason: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        tonic::Status::internal(error.to_string())
    }
}

/// Keeps track of when each volume's device was first found to be in use.
#[derive(Debug)]
pub struct DeviceInUseTracker {
    timeout: Duration,
    clock: Arc<dyn Clock>,
    first_seen: Mutex<HashMap<String, Instant>>,
}

impl DeviceInUseTracker {
    /// Return a new `Self` using the system clock.
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }
    /// Return a new `Self` using the given clock.
    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout,
            clock,
            first_seen: Mutex::new(HashMap::new()),
        }
    }
    /// The give-up timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    /// When the given volume's device was first seen in use, if it's being tracked.
    pub fn first_seen(&self, volume_id: &str) -> Option<Instant> {
        self.first_seen
            .lock()
            .expect("not poisoned")
            .get(volume_id)
            .copied()
    }

    /// Fold a device check into the tracked state for `volume_id`.
    /// Ok means the unstage may proceed, Err means it must be retried.
    pub fn evaluate(&self, volume_id: &str, check: DeviceCheck) -> Result<(), Error> {
        let mut first_seen = self.first_seen.lock().expect("not poisoned");
        match check {
            DeviceCheck::Unused => {
                first_seen.remove(volume_id);
                Ok(())
            }
            DeviceCheck::Ignorable { reason } => {
                warn!(
                    volume.id = volume_id,
                    %reason,
                    "Unable to check if device is unused. Device has been unmounted successfully. Ignoring and continuing with unstaging"
                );
                first_seen.remove(volume_id);
                Ok(())
            }
            DeviceCheck::Fatal { reason } => Err(Error::CheckFailed {
                volume_id: volume_id.to_string(),
                reason,
            }),
            DeviceCheck::Blocking { reason } => {
                let now = self.clock.now();
                match first_seen.get(volume_id) {
                    Some(since) if now.saturating_duration_since(*since) >= self.timeout => {
                        warn!(
                            volume.id = volume_id,
                            %reason,
                            "Device could not be released after timeout of {:?}. NodeUnstageVolume will return success",
                            self.timeout
                        );
                        first_seen.remove(volume_id);
                        Ok(())
                    }
                    Some(since) => {
                        debug!(
                            volume.id = volume_id,
                            elapsed = ?now.saturating_duration_since(*since),
                            "Device is still in use"
                        );
                        Err(Error::StillInUse {
                            volume_id: volume_id.to_string(),
                            reason,
                        })
                    }
                    None => {
                        first_seen.insert(volume_id.to_string(), now);
                        debug!(volume.id = volume_id, "Device is in use, tracking it");
                        Err(Error::StillInUse {
                            volume_id: volume_id.to_string(),
                            reason,
                        })
                    }
                }
            }
        }
    }
}

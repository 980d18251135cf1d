//! Volume Concurrency Limiter Module
//!
//! In general the Cluster Orchestrator (CO) is responsible for ensuring that there is no more
//! than one call “in-flight” per volume at a given time. However, in some circumstances, the
//! CO MAY lose state (for example when the CO crashes and restarts), and MAY issue multiple
//! calls simultaneously for the same volume. The plugin SHOULD handle this as gracefully as
//! possible. The error code ABORTED MAY be returned by the plugin in this case (see the Error
//! Scheme section for details).
use snafu::Snafu;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("An operation with the given Volume ID {id} already exists"))]
    OperationInProgress { id: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress { .. } => tonic::Status::aborted(error.to_string()),
        }
    }
}

type Inventory = Arc<Mutex<HashSet<String>>>;

/// The set of volume ids which have an operation in-flight.
/// Membership test and insertion happen under the same lock, so only a single caller can win
/// the reservation for a given volume id.
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    inventory: Inventory,
}

impl VolumeLocks {
    /// Return a new empty `Self`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take a new volume reservation and returns error if an existing
    /// operation is already in progress. Never blocks waiting for the current holder.
    pub fn try_acquire(&self, volume_id: &str) -> Result<VolumeOpGuard, Error> {
        let mut inventory = self.inventory.lock().expect("not poisoned");
        if !inventory.insert(volume_id.to_string()) {
            trace!(volume.id = volume_id, "Operation already exists for volume");
            return Err(Error::OperationInProgress {
                id: volume_id.to_string(),
            });
        }
        trace!(volume.id = volume_id, "New reservation");
        Ok(VolumeOpGuard {
            volume_id: volume_id.to_string(),
            inventory: self.inventory.clone(),
        })
    }

    /// Check if the given volume currently has an operation in-flight.
    pub fn is_locked(&self, volume_id: &str) -> bool {
        self.inventory
            .lock()
            .expect("not poisoned")
            .contains(volume_id)
    }
}

/// This Operation guard is used to ensure there is no more than 1 in-flight operation
/// for a given volume by taking a reservation for the volume's id.
/// When this is dropped the reservation is returned and a new operation can be accepted.
#[derive(Debug)]
pub struct VolumeOpGuard {
    volume_id: String,
    inventory: Inventory,
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = self.inventory.lock().expect("not poisoned");
        inventory.remove(&self.volume_id);
        trace!(volume.id = self.volume_id, "Reservation released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_reservation_per_volume() {
        let locks = VolumeLocks::new();
        let guard = locks.try_acquire("vol-1").unwrap();
        assert!(locks.is_locked("vol-1"));

        let error = locks.try_acquire("vol-1").unwrap_err();
        assert_eq!(tonic::Status::from(error).code(), tonic::Code::Aborted);

        // other volumes are not affected
        let _other = locks.try_acquire("vol-2").unwrap();

        drop(guard);
        assert!(!locks.is_locked("vol-1"));
        assert!(locks.try_acquire("vol-1").is_ok());
    }

    #[test]
    fn released_on_early_return() {
        fn operation(locks: &VolumeLocks, fail: bool) -> Result<(), String> {
            let _guard = locks.try_acquire("vol-1").map_err(|e| e.to_string())?;
            if fail {
                return Err("validation failed".into());
            }
            Ok(())
        }
        let locks = VolumeLocks::new();
        assert!(operation(&locks, true).is_err());
        assert!(!locks.is_locked("vol-1"));
        assert!(operation(&locks, false).is_ok());
        assert!(!locks.is_locked("vol-1"));
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let locks = VolumeLocks::new();
        let start = Arc::new(std::sync::Barrier::new(8));
        let tried = Arc::new(std::sync::Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let start = start.clone();
                let tried = tried.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let guard = locks.try_acquire("vol-1");
                    // keep the guard alive until every thread has tried
                    tried.wait();
                    guard.is_ok()
                })
            })
            .collect::<Vec<_>>();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

//! Bulkhead limiting concurrently in-flight event broadcasts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ConexusError;

/// Bounds `maxConcurrentEvents` in-flight broadcasts; rejects with
/// `ConexusError::Overloaded` once the limit is reached rather than queuing.
#[derive(Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
}

/// Held for the duration of one admitted operation; releases its slot on drop.
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Try to admit one operation. Returns a permit that releases the slot
    /// when dropped, or `Overloaded` if the limit has been reached.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, ConexusError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(BulkheadPermit { _permit: permit, in_flight: self.in_flight.clone() })
            }
            Err(_) => Err(ConexusError::Overloaded {
                in_flight: self.in_flight.load(Ordering::Acquire),
                max: self.max_concurrent,
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_operations_within_limit() {
        let bulkhead = Bulkhead::new(2);
        let a = bulkhead.try_acquire().unwrap();
        let b = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[test]
    fn rejects_when_at_capacity() {
        let bulkhead = Bulkhead::new(1);
        let _permit = bulkhead.try_acquire().unwrap();
        let err = bulkhead.try_acquire().unwrap_err();
        assert!(err.is_overloaded());
    }

    #[test]
    fn releases_slot_on_drop() {
        let bulkhead = Bulkhead::new(1);
        {
            let _permit = bulkhead.try_acquire().unwrap();
            assert!(bulkhead.try_acquire().is_err());
        }
        assert!(bulkhead.try_acquire().is_ok());
    }
}

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of download slots shared by every request handler.
///
/// Acquisition never waits: a saturated pool rejects the request so the
/// caller can answer 429 instead of queueing.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One held download slot. The slot returns to the pool when this value is
/// dropped, whichever way the owning task ends.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_acquire_is_rejected_until_a_slot_frees() {
        let admission = AdmissionController::new(3);
        let first = admission.try_acquire().expect("first slot");
        let _second = admission.try_acquire().expect("second slot");
        let _third = admission.try_acquire().expect("third slot");

        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.available(), 0);

        drop(first);
        assert_eq!(admission.available(), 1);
        assert!(admission.try_acquire().is_some());
    }

    #[tokio::test]
    async fn permit_released_when_task_panics() {
        let admission = AdmissionController::new(1);
        let permit = admission.try_acquire().expect("slot");

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let outcome: Result<(), &str> = Err("task body failed");
            outcome.unwrap();
        });
        assert!(handle.await.is_err());

        assert_eq!(admission.available(), admission.capacity());
    }
}

//! Transcode admission control.
//!
//! A fixed ceiling on concurrent transcodes. Requests over the ceiling are
//! rejected immediately with [`AdmissionError::Busy`] instead of queueing, and
//! a rejected request never holds a slot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

/// Default ceiling on concurrent transcodes
pub const DEFAULT_MAX_CONCURRENT_TRANSCODES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Server busy: {active}/{ceiling} transcodes running, retry later")]
    Busy { active: usize, ceiling: usize },
}

#[derive(Debug)]
struct AdmissionInner {
    active: AtomicUsize,
    ceiling: usize,
}

/// Shared transcode counter. Clones share the same slots.
#[derive(Debug, Clone)]
pub struct TranscodeAdmission {
    inner: Arc<AdmissionInner>,
}

impl TranscodeAdmission {
    /// Creates a controller; a ceiling of 0 is raised to 1.
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                active: AtomicUsize::new(0),
                ceiling: ceiling.max(1),
            }),
        }
    }

    /// Takes a slot or fails with `Busy` without changing the count.
    pub fn try_acquire(&self) -> Result<TranscodePermit, AdmissionError> {
        let ceiling = self.inner.ceiling;
        let mut current = self.inner.active.load(Ordering::Acquire);

        loop {
            if current >= ceiling {
                warn!(active = current, ceiling, "Transcode rejected, at capacity");
                return Err(AdmissionError::Busy {
                    active: current,
                    ceiling,
                });
            }

            match self.inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(active = current + 1, ceiling, "Transcode admitted");
                    return Ok(TranscodePermit {
                        inner: Arc::clone(&self.inner),
                        released: AtomicBool::new(false),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Transcodes currently holding a slot
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }
}

impl Default for TranscodeAdmission {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_TRANSCODES)
    }
}

/// A held transcode slot.
///
/// Released exactly once: by [`TranscodePermit::release`] or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct TranscodePermit {
    inner: Arc<AdmissionInner>,
    released: AtomicBool,
}

impl TranscodePermit {
    /// Returns the slot. Later calls are no-ops.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let before = self.inner.active.fetch_sub(1, Ordering::AcqRel);
            debug!(active = before - 1, "Transcode slot released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for TranscodePermit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_over_ceiling_is_rejected_without_slot() {
        let admission = TranscodeAdmission::new(3);
        let permits: Vec<_> = (0..3).map(|_| admission.try_acquire().unwrap()).collect();
        assert_eq!(admission.active(), 3);

        let err = admission.try_acquire().unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Busy {
                active: 3,
                ceiling: 3
            }
        );
        assert_eq!(admission.active(), 3);
        drop(permits);
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn test_release_admits_exactly_one_more() {
        let admission = TranscodeAdmission::new(2);
        let first = admission.try_acquire().unwrap();
        let _second = admission.try_acquire().unwrap();

        first.release();
        let _third = admission.try_acquire().unwrap();
        assert!(admission.try_acquire().is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let admission = TranscodeAdmission::new(2);
        let permit = admission.try_acquire().unwrap();
        let _other = admission.try_acquire().unwrap();

        permit.release();
        permit.release();
        assert!(permit.is_released());
        drop(permit);
        assert_eq!(admission.active(), 1);
    }

    #[test]
    fn test_zero_ceiling_is_raised_to_one() {
        let admission = TranscodeAdmission::new(0);
        assert_eq!(admission.ceiling(), 1);
        assert!(admission.try_acquire().is_ok());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_ceiling() {
        let admission = TranscodeAdmission::new(4);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || admission.try_acquire().ok())
            })
            .collect();

        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(granted.len(), 4);
        assert_eq!(admission.active(), 4);
    }
}

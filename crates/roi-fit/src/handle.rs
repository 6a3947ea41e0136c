//! Shared ownership of a registry during fits.
//!
//! A [`RegistryHandle`] pairs the registry with the phase of the fit running
//! against it. The registry lock is only taken for short, non-blocking steps
//! (enumerating free parameters, committing results); the engine runs
//! without it. The phase marker is what rejects a second fit while one is in
//! flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roi_core::Registry;
use serde::Serialize;

use crate::error::FitError;

/// Phase of the most recent fit invocation on a registry.
///
/// ```text
/// IDLE -> PREPARING -> RUNNING -> CONVERGED
///                  \          \-> FAILED
///                   \-> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FitPhase {
    /// No fit has run yet.
    Idle = 0,
    /// Free parameters are being collected.
    Preparing = 1,
    /// The engine is running.
    Running = 2,
    /// The last fit converged and was committed.
    Converged = 3,
    /// The last fit failed; the registry was left unchanged.
    Failed = 4,
}

impl FitPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Preparing,
            2 => Self::Running,
            3 => Self::Converged,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Returns `true` while a fit is in flight.
    #[inline]
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Preparing | Self::Running)
    }
}

/// Shared handle to the registry of one analysis session.
///
/// Cloning the handle shares the same registry and fit phase.
///
/// # Examples
///
/// ```
/// use roi_core::{DiffuseModels, Registry, SkyDir};
/// use roi_fit::{FitPhase, RegistryHandle};
///
/// let registry = Registry::new(SkyDir::new(0.0, 0.0), DiffuseModels::default());
/// let handle = RegistryHandle::new(registry);
/// assert_eq!(handle.read().len(), 2);
/// assert_eq!(handle.phase(), FitPhase::Idle);
/// ```
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    registry: Arc<RwLock<Registry>>,
    phase: Arc<AtomicU8>,
}

impl RegistryHandle {
    /// Wraps a registry.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            phase: Arc::new(AtomicU8::new(FitPhase::Idle as u8)),
        }
    }

    /// Locks the registry for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    /// Locks the registry for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write()
    }

    /// Phase of the most recent fit.
    #[must_use]
    pub fn phase(&self) -> FitPhase {
        FitPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Returns `true` if both handles share one registry.
    #[must_use]
    pub fn same_registry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
    }

    /// Marks a fit as started.
    ///
    /// # Errors
    ///
    /// [`FitError::ConcurrentFit`] if a fit is already preparing or running.
    pub(crate) fn begin(&self) -> Result<PhaseGuard<'_>, FitError> {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            let previous = FitPhase::from_u8(current);
            if previous.is_busy() {
                return Err(FitError::ConcurrentFit);
            }
            match self.phase.compare_exchange_weak(
                current,
                FitPhase::Preparing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(PhaseGuard {
                        phase: &self.phase,
                        previous,
                        finished: false,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Holds a handle's phase while a fit is in flight.
///
/// Dropping the guard without [`finish`](Self::finish) puts back the phase it
/// replaced.
#[derive(Debug)]
pub(crate) struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
    previous: FitPhase,
    finished: bool,
}

impl PhaseGuard<'_> {
    pub(crate) fn set(&self, phase: FitPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn finish(mut self, outcome: FitPhase) {
        self.set(outcome);
        self.finished = true;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.set(self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roi_core::{DiffuseModels, SkyDir};

    fn handle() -> RegistryHandle {
        RegistryHandle::new(Registry::new(SkyDir::new(0.0, 0.0), DiffuseModels::default()))
    }

    #[test]
    fn test_begin_rejects_concurrent_fit() {
        let handle = handle();
        let guard = handle.begin().unwrap();
        assert_eq!(handle.phase(), FitPhase::Preparing);
        assert_eq!(handle.begin().unwrap_err(), FitError::ConcurrentFit);

        guard.set(FitPhase::Running);
        let clone = handle.clone();
        assert_eq!(clone.begin().unwrap_err(), FitError::ConcurrentFit);

        guard.finish(FitPhase::Converged);
        assert_eq!(handle.phase(), FitPhase::Converged);
        assert!(handle.begin().is_ok());
    }

    #[test]
    fn test_dropped_guard_restores_previous_phase() {
        let handle = handle();
        handle.begin().unwrap().finish(FitPhase::Failed);
        {
            let guard = handle.begin().unwrap();
            guard.set(FitPhase::Running);
        }
        assert_eq!(handle.phase(), FitPhase::Failed);
    }

    #[test]
    fn test_clones_share_registry() {
        let a = handle();
        let b = a.clone();
        assert!(a.same_registry(&b));
        assert!(!a.same_registry(&handle()));
        b.write().log_likelihood = Some(-10.0);
        assert_eq!(a.read().log_likelihood, Some(-10.0));
    }
}

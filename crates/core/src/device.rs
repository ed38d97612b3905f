//! Accelerator residency.
//!
//! Only one step's model weights fit on the device at a time. A step
//! acquires a [`DeviceLease`] before calling the backend; acquiring evicts
//! whatever other step is resident, and dropping the lease unloads the
//! step's weights when `auto_unload` is set. Because release happens in
//! `Drop`, weights are freed on error paths too.

use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::ModelBackend;
use crate::step::PipelineStep;

pub struct Device {
    backend: Arc<dyn ModelBackend>,
    resident: Mutex<Option<PipelineStep>>,
}

impl Device {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            resident: Mutex::new(None),
        }
    }

    /// Step whose weights are currently loaded, if any.
    pub fn resident(&self) -> Option<PipelineStep> {
        *self.resident.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the device for `step`, evicting any other resident step.
    pub fn acquire(&self, step: PipelineStep, auto_unload: bool) -> DeviceLease<'_> {
        let mut resident = self.resident.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *resident {
            if previous != step {
                tracing::debug!(evicted = %previous, step = %step, "Evicting resident weights");
                self.backend.unload(previous);
            }
        }
        *resident = Some(step);
        DeviceLease {
            device: self,
            step,
            auto_unload,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("resident", &self.resident())
            .finish_non_exhaustive()
    }
}

/// Scoped claim on the device for one step.
pub struct DeviceLease<'a> {
    device: &'a Device,
    step: PipelineStep,
    auto_unload: bool,
}

impl DeviceLease<'_> {
    pub fn step(&self) -> PipelineStep {
        self.step
    }

    pub fn backend(&self) -> &dyn ModelBackend {
        self.device.backend.as_ref()
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        if !self.auto_unload {
            return;
        }
        let mut resident = self
            .device
            .resident
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.device.backend.unload(self.step);
        if *resident == Some(self.step) {
            *resident = None;
        }
    }
}

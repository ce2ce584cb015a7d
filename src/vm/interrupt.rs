//! Asynchronous interruption of a running VM
//!
//! An [`InterruptHandle`] can be cloned and sent to other threads. Setting
//! an interrupt raises a flag the dispatch loop checks before every
//! instruction; the payload decides what happens next.

use crate::error::HostError;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// What an interrupt asks the VM to do
pub enum Interrupt {
    /// Run the callback on the VM thread and continue. A failing callback
    /// aborts the run with `InterruptCallbackFailed`.
    Callback(Box<dyn FnOnce() -> Result<(), HostError> + Send>),
    /// Abort the run, surfacing this error
    Error(HostError),
    /// Abort the run, surfacing arbitrary host data
    Data(Box<dyn Any + Send>),
}

impl Interrupt {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), HostError> + Send + 'static,
    {
        Interrupt::Callback(Box::new(f))
    }

    pub fn data<T: Any + Send>(data: T) -> Self {
        Interrupt::Data(Box::new(data))
    }
}

#[derive(Default)]
struct InterruptState {
    flag: AtomicBool,
    payload: Mutex<Option<Interrupt>>,
}

/// Thread-safe handle for interrupting a VM
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        InterruptHandle::default()
    }

    fn payload(&self) -> MutexGuard<'_, Option<Interrupt>> {
        self.inner
            .payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request an interrupt. Replaces any pending payload.
    pub fn interrupt(&self, reason: Interrupt) {
        *self.payload() = Some(reason);
        self.inner.flag.store(true, Ordering::Release);
    }

    /// Drop a pending interrupt
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::Release);
        *self.payload() = None;
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Clear the flag and take the payload
    pub(crate) fn take(&self) -> Option<Interrupt> {
        let mut payload = self.payload();
        self.inner.flag.store(false, Ordering::Release);
        payload.take()
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("set", &self.is_set())
            .finish()
    }
}

//! Process-wide environment lifecycle.
//!
//! The fabric worker pool and the progress callback are process-wide
//! resources shared by every open window. Instead of ambient globals, the
//! lifecycle lives in an explicit `Environment` handed to each window:
//! lazy initialization on the first registration, teardown when the last
//! window deregisters. A single mutex serializes these paths; everything
//! else in the crate synchronizes through remote atomics.

use std::sync::Mutex;

/// Shared process-wide state for all windows.
#[derive(Debug)]
pub struct Environment {
    state: Mutex<EnvState>,
}

#[derive(Debug)]
struct EnvState {
    initialized: bool,
    progress_refs: u32,
}

impl Environment {
    /// Create an uninitialized environment.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EnvState {
                initialized: false,
                progress_refs: 0,
            }),
        }
    }

    /// Register one progress consumer, initializing the environment on the
    /// first registration.
    pub(crate) fn register_progress(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            state.initialized = true;
        }
        state.progress_refs += 1;
    }

    /// Deregister one progress consumer, tearing the environment down when
    /// the count reaches zero.
    pub(crate) fn unregister_progress(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.progress_refs > 0, "progress refcount underflow");
        state.progress_refs -= 1;
        if state.progress_refs == 0 {
            state.initialized = false;
        }
    }

    /// Whether any window currently holds the environment open.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// Number of windows registered for progress.
    pub fn progress_refs(&self) -> u32 {
        self.state.lock().unwrap().progress_refs
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

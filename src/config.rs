//! Window configuration.

use crate::state::ATTACH_MAX;

/// Per-window configuration.
///
/// These map to the info keys and environment variables the surrounding
/// runtime resolves before window creation; the core only consumes the
/// resolved values.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Refuse passive-target locking entirely.
    /// Default: false
    pub no_locks: bool,
    /// Allow single-element accumulates to bypass the accumulate lock when
    /// the fabric can express them as one intrinsic atomic.
    /// Default: false
    pub acc_single_intrinsic: bool,
    /// Maximum number of simultaneously attached dynamic regions.
    /// Capped at [`ATTACH_MAX`]. Default: 32
    pub max_attached_regions: usize,
    /// Component selection priority, kept for the surrounding runtime's
    /// component negotiation.
    /// Default: 60
    pub priority: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            no_locks: false,
            acc_single_intrinsic: false,
            max_attached_regions: ATTACH_MAX,
            priority: 60,
        }
    }
}

impl WindowConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable passive-target locking.
    pub fn with_no_locks(mut self, no_locks: bool) -> Self {
        self.no_locks = no_locks;
        self
    }

    /// Enable the single-intrinsic accumulate fast path.
    pub fn with_acc_single_intrinsic(mut self, enabled: bool) -> Self {
        self.acc_single_intrinsic = enabled;
        self
    }

    /// Set the dynamic-region capacity (capped at [`ATTACH_MAX`]).
    pub fn with_max_attached_regions(mut self, max: usize) -> Self {
        self.max_attached_regions = max.min(ATTACH_MAX);
        self
    }

    /// Set the component selection priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

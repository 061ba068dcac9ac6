//! Access and exposure epoch tracking.
//!
//! Every public window operation is gated on the current epoch. Exactly one
//! access epoch is active at a time, process-wide per window; the exposure
//! epoch is tracked independently for active-target post/wait.

use crate::error::{Error, Result};

/// Access-side epoch of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEpoch {
    /// No epoch open.
    None,
    /// Active-target fence epoch.
    Fence,
    /// Passive-target epoch with per-target locks.
    Passive,
    /// Passive-target epoch covering all peers.
    PassiveAll,
}

impl std::fmt::Display for AccessEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessEpoch::None => "none",
            AccessEpoch::Fence => "fence",
            AccessEpoch::Passive => "passive",
            AccessEpoch::PassiveAll => "passive-all",
        };
        f.write_str(name)
    }
}

/// Exposure-side epoch of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureEpoch {
    /// No epoch open.
    None,
    /// Active-target fence epoch.
    Fence,
    /// Post epoch with pending completions.
    Post,
}

/// Per-window epoch state.
#[derive(Debug, Clone, Copy)]
pub struct EpochState {
    /// Current access epoch.
    pub access: AccessEpoch,
    /// Current exposure epoch.
    pub exposure: ExposureEpoch,
}

impl EpochState {
    /// Initial state: no epoch open on either side.
    pub fn new() -> Self {
        Self {
            access: AccessEpoch::None,
            exposure: ExposureEpoch::None,
        }
    }

    /// Check that no passive or active access epoch is open.
    ///
    /// A lock, lock-all, or fence may only start from `None` or from a
    /// previous `Fence` epoch.
    pub fn require_idle(&self, call: &'static str) -> Result<()> {
        match self.access {
            AccessEpoch::None | AccessEpoch::Fence => Ok(()),
            epoch => Err(Error::SyncOrder { call, epoch }),
        }
    }

    /// Check that a per-target passive epoch is open.
    pub fn require_passive(&self, call: &'static str) -> Result<()> {
        match self.access {
            AccessEpoch::Passive => Ok(()),
            epoch => Err(Error::SyncOrder { call, epoch }),
        }
    }

    /// Check that a passive-all epoch is open.
    pub fn require_passive_all(&self, call: &'static str) -> Result<()> {
        match self.access {
            AccessEpoch::PassiveAll => Ok(()),
            epoch => Err(Error::SyncOrder { call, epoch }),
        }
    }

    /// Check that some passive-target epoch is open.
    ///
    /// Sync and the flush family are only meaningful while the caller holds
    /// passive-target access.
    pub fn require_any_passive(&self, call: &'static str) -> Result<()> {
        match self.access {
            AccessEpoch::Passive | AccessEpoch::PassiveAll => Ok(()),
            epoch => Err(Error::SyncOrder { call, epoch }),
        }
    }
}

impl Default for EpochState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_guard() {
        let mut state = EpochState::new();
        assert!(state.require_idle("lock").is_ok());

        state.access = AccessEpoch::Fence;
        assert!(state.require_idle("lock").is_ok());

        state.access = AccessEpoch::Passive;
        assert!(matches!(
            state.require_idle("lock"),
            Err(Error::SyncOrder { call: "lock", .. })
        ));

        state.access = AccessEpoch::PassiveAll;
        assert!(state.require_idle("lock_all").is_err());
    }

    #[test]
    fn test_passive_guards() {
        let mut state = EpochState::new();
        assert!(state.require_any_passive("flush").is_err());

        state.access = AccessEpoch::Passive;
        assert!(state.require_passive("unlock").is_ok());
        assert!(state.require_passive_all("unlock_all").is_err());
        assert!(state.require_any_passive("flush").is_ok());

        state.access = AccessEpoch::PassiveAll;
        assert!(state.require_passive("unlock").is_err());
        assert!(state.require_passive_all("unlock_all").is_ok());
        assert!(state.require_any_passive("sync").is_ok());
    }
}

//! Error types for oswin.

use std::io;

use crate::epoch::AccessEpoch;
use crate::Rank;

/// Window synchronization errors.
#[derive(Debug)]
pub enum Error {
    /// Transport error from the fabric or the helper channel.
    Io(io::Error),
    /// Operation called in an access epoch that does not permit it.
    SyncOrder {
        /// Name of the refused operation.
        call: &'static str,
        /// Access epoch at the time of the call.
        epoch: AccessEpoch,
    },
    /// A lock on this target is already outstanding.
    AlreadyLocked(Rank),
    /// No outstanding lock on this target.
    LockNotFound(Rank),
    /// Window was created with locks disabled.
    LocksDisabled,
    /// Attach refused on a non-dynamic window.
    NotDynamic,
    /// Dynamic-region table is full.
    AttachLimit(usize),
    /// No attached region covers the given address.
    RegionNotFound(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::SyncOrder { call, epoch } => {
                write!(f, "{} not permitted in {} access epoch", call, epoch)
            }
            Error::AlreadyLocked(rank) => write!(f, "Lock on rank {} already held", rank),
            Error::LockNotFound(rank) => write!(f, "No outstanding lock on rank {}", rank),
            Error::LocksDisabled => write!(f, "Window created with no_locks set"),
            Error::NotDynamic => write!(f, "Window flavor does not support attach"),
            Error::AttachLimit(max) => {
                write!(f, "Cannot attach more than {} regions", max)
            }
            Error::RegionNotFound(base) => {
                write!(f, "No attached region covers address {:#x}", base)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for oswin operations.
pub type Result<T> = std::result::Result<T, Error>;

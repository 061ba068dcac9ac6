//! oswin - Synchronization core for one-sided (RMA) memory windows.
//!
//! A group of peer processes shares a memory window: any member may read,
//! write, or atomically update another member's memory without the target's
//! active participation. Moving the bytes is the fabric's job; this crate
//! owns the part that is actually hard to get right, the concurrent-access
//! semantics:
//!
//! - which synchronization epochs are legal and how they transition,
//! - a distributed shared/exclusive lock built from nothing but remote
//!   atomics on a 64-bit word,
//! - the per-window registry of dynamically attached memory regions,
//! - flush/completion composed across two transport layers (the RDMA
//!   fabric and the command channel to a DPU helper unit).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Window                                 │
//! │  ┌────────────┐ ┌─────────────┐ ┌──────────────────────────┐ │
//! │  │ EpochState │ │ LockRecords │ │ ControlState (replicated │ │
//! │  │  (guards)  │ │  per target │ │  lock words + regions)   │ │
//! │  └────────────┘ └─────────────┘ └──────────────────────────┘ │
//! │         │              │                     │                │
//! │   every public    distributed         dynamic-region          │
//! │   op is gated     lock protocol       registry                │
//! └─────────┼──────────────┼─────────────────────┼───────────────┘
//!           ▼              ▼                     ▼
//!     ┌──────────────────────────┐   ┌──────────────────────────┐
//!     │   Fabric (remote atomics,│   │ HelperChannel (offload   │
//!     │   fence, scoped flush)   │   │ RPC to the DPU helper)   │
//!     └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! Control flow for a passive-target epoch: `lock()` validates the epoch
//! and spins a remote CAS/fetch-add on the target's lock word; RMA
//! operations are issued; `unlock()` flushes both transport layers and
//! only then releases the lock word, so the epoch's effects are globally
//! visible to the next holder.
//!
//! Progress is single-threaded and cooperative: every spin loop in the
//! crate drains transport progress between attempts, because nobody else
//! will.
//!
//! # Usage
//!
//! ```ignore
//! use std::rc::Rc;
//! use oswin::{Environment, LockKind, ModeFlags, Window, WindowConfig};
//!
//! let env = Rc::new(Environment::new());
//! let mut win = Window::create_dynamic(env, fabric, helper, exchange,
//!                                      WindowConfig::default())?;
//!
//! win.attach(buf_addr, buf_len)?;
//! win.lock(LockKind::Exclusive, target, ModeFlags::empty())?;
//! // ... put/get/accumulate toward target ...
//! win.unlock(target)?;
//! win.detach(buf_addr)?;
//! win.free()?;
//! ```
//!
//! # Modules
//!
//! - [`config`]: window configuration (`WindowConfig`)
//! - [`epoch`]: access/exposure epoch state machine
//! - [`lock`]: distributed lock protocol over remote atomics
//! - [`region`]: dynamic-region registry and interval search
//! - [`completion`]: flush composition across fabric and helper
//! - [`state`]: replicated per-process control block
//! - [`transport`]: capability seams (`Fabric`, `HelperChannel`,
//!   `AddressExchange`)
//! - [`window`]: the window handle and its operation surface
//! - [`env`]: process-wide lifecycle (`Environment`)
//! - [`test_utils`]: in-memory fakes for all three capability seams

pub mod completion;
pub mod config;
pub mod env;
pub mod epoch;
pub mod error;
pub mod lock;
pub mod region;
pub mod state;
pub mod test_utils;
pub mod transport;
pub mod window;

/// Rank of a process within a window's group.
pub type Rank = u32;

// Re-export main types
pub use config::WindowConfig;
pub use env::Environment;
pub use epoch::{AccessEpoch, EpochState, ExposureEpoch};
pub use error::{Error, Result};
pub use lock::{LockKind, LockRecord, LOCK_EXCLUSIVE, LOCK_UNLOCKED};
pub use region::{find_region_position, RegionRegistry};
pub use state::{ControlState, RegionSpan, ATTACH_MAX};
pub use transport::{
    AccessFlags, AddressExchange, AtomicOp, Fabric, FlushScope, FlushToken, HelperChannel,
    OffloadCommand, OffloadResponse, RegionHandle, RegisteredRegion,
};
pub use window::{ModeFlags, Window, WindowFlavor};

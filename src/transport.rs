//! Capability seams toward the RDMA fabric, the DPU helper, and the
//! collective layer.
//!
//! The core never talks to hardware directly. Everything it needs from the
//! outside world is expressed as one of three traits:
//!
//! - [`Fabric`]: remote atomics, fences, scoped flushes, cooperative
//!   progress, and memory-region registration on the primary RDMA transport.
//! - [`HelperChannel`]: the synchronous command RPC to the DPU helper unit
//!   plus the nonblocking flush interface of the local host channel.
//! - [`AddressExchange`]: the one collective primitive used to distribute
//!   remote addresses and registration keys at window and region creation.

use bitflags::bitflags;

use crate::error::Result;
use crate::Rank;

/// Atomic operation selector for fetch-and-op and post-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Wrapping 64-bit add. The operand is interpreted as two's complement,
    /// so a negative delta is passed as `(-n as i64) as u64`.
    Add,
    /// Swap: store the operand, return the prior value.
    Swap,
}

/// Completion scope of a fabric flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// All outstanding operations toward one peer's endpoint.
    Endpoint(Rank),
    /// All outstanding operations on the whole worker.
    Worker,
}

bitflags! {
    /// Memory access flags for region registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1 << 0;
        /// Enable remote write access.
        const REMOTE_WRITE = 1 << 1;
        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
        /// Enable remote atomic operation access.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

impl AccessFlags {
    /// Flags for window and control-state memory: full remote access.
    pub fn rma() -> Self {
        AccessFlags::LOCAL_WRITE
            | AccessFlags::REMOTE_WRITE
            | AccessFlags::REMOTE_READ
            | AccessFlags::REMOTE_ATOMIC
    }
}

/// Opaque fabric registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle(pub u64);

/// A memory region registered with the fabric.
#[derive(Debug, Clone)]
pub struct RegisteredRegion {
    /// Registration handle, needed for deregistration.
    pub handle: RegionHandle,
    /// Address peers use to reach this region.
    pub remote_addr: u64,
    /// Packed remote key, distributed to peers via address exchange.
    pub rkey: Vec<u8>,
}

/// Primary RDMA transport capability.
///
/// Atomics against a single remote address must be sequentially consistent
/// with respect to each other, regardless of which peer issues them. Every
/// round-trip may block the calling thread until the reply arrives.
pub trait Fabric {
    /// Atomic compare-and-swap on a remote 64-bit word. Returns the prior
    /// value.
    fn compare_and_swap(&self, target: Rank, addr: u64, expect: u64, desired: u64) -> Result<u64>;

    /// Atomic fetch-and-op on a remote 64-bit word. Returns the prior value.
    fn fetch_and_op(&self, target: Rank, addr: u64, op: AtomicOp, operand: u64) -> Result<u64>;

    /// Fire-and-forget atomic op on a remote 64-bit word. No reply is
    /// expected; completion is observed through a later flush.
    fn post_op(&self, target: Rank, addr: u64, op: AtomicOp, operand: u64) -> Result<()>;

    /// Order all previously-issued operations before all subsequent ones.
    fn fence(&self) -> Result<()>;

    /// Block until all outstanding operations in `scope` are remotely
    /// complete.
    fn flush(&self, scope: FlushScope) -> Result<()>;

    /// Drain completion queues once.
    ///
    /// Single-threaded cooperative progress: any caller spinning on a remote
    /// condition must invoke this between attempts or the condition can
    /// never be satisfied.
    fn progress(&self);

    /// Register a memory region for remote access.
    fn register_region(&self, base: u64, len: u64, access: AccessFlags)
    -> Result<RegisteredRegion>;

    /// Deregister a previously registered region.
    fn deregister_region(&self, handle: RegionHandle) -> Result<()>;
}

/// Command sent to a helper unit over the offload channel.
///
/// The wire framing is owned by the channel implementation; the core only
/// names the operations it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadCommand {
    /// Flush the helper's endpoint toward `origin`.
    EndpointFlush {
        /// World rank of the process requesting the flush.
        origin: Rank,
    },
    /// Flush the helper's host-channel worker on behalf of `origin`.
    WorkerFlush {
        /// World rank of the process requesting the flush.
        origin: Rank,
    },
    /// Flush the helper's proxy worker on behalf of `origin`.
    ProxyWorkerFlush {
        /// World rank of the process requesting the flush.
        origin: Rank,
    },
    /// Register a host memory region with the helper.
    RegisterMemory {
        /// Host virtual base address.
        base: u64,
        /// Region length in bytes.
        len: u64,
    },
    /// Deregister a previously registered region.
    DeregisterMemory {
        /// Registration id returned by `RegisterMemory`.
        reg_id: u64,
    },
    /// Drop every remote-key cache entry the helper holds for `origin`.
    ClearRegistrationCache {
        /// World rank whose cached registrations are dropped.
        origin: Rank,
    },
}

/// Response to an offload command.
///
/// A nonzero status indicates the helper and the host have desynchronized;
/// the core treats that as a fatal protocol violation, not a recoverable
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadResponse {
    /// Command status; zero on success.
    pub status: i32,
    /// Registration id, valid for `RegisterMemory` responses.
    pub reg_id: u64,
}

/// Token for a nonblocking local helper flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushToken(pub u64);

/// Offload channel to the DPU helper unit.
pub trait HelperChannel {
    /// Execute a command on the helper serving world rank `target`,
    /// blocking until the response arrives.
    fn exec(&self, target: Rank, command: OffloadCommand) -> Result<OffloadResponse>;

    /// Start a nonblocking flush of the local host-channel endpoint.
    fn begin_endpoint_flush(&self) -> Result<FlushToken>;

    /// Start a nonblocking flush of the local host-channel worker.
    fn begin_worker_flush(&self) -> Result<FlushToken>;

    /// Test whether a nonblocking flush has completed.
    fn test(&self, token: FlushToken) -> bool;

    /// Drain the host channel's completion queue once.
    fn progress(&self);
}

/// Collective address-exchange capability supplied by the surrounding
/// communication layer.
///
/// Used once per window (and once per dynamically attached region) to
/// distribute remote addresses and registration keys; also supplies the
/// barrier required by fence and window-free semantics.
pub trait AddressExchange {
    /// This process's rank in the window's group.
    fn rank(&self) -> Rank;

    /// Number of processes in the window's group.
    fn size(&self) -> u32;

    /// World rank of a group member, for addressing its helper unit.
    fn world_rank(&self, peer: Rank) -> Rank;

    /// All-to-all exchange: every member contributes `local` and receives
    /// one byte vector per rank, in rank order.
    fn exchange(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> Result<()>;
}

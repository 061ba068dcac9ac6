//! Memory windows and their synchronization surface.
//!
//! A `Window` is one process's handle on a group-shared memory window. It
//! owns the epoch state, the outstanding-lock records, the replicated
//! control block, and (for dynamic windows) the attached-region registry.
//! Every public operation is gated on the epoch state machine; remote side
//! effects go through the [`Fabric`] and [`HelperChannel`] seams.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic;

use bitflags::bitflags;
use log::debug;

use crate::completion;
use crate::config::WindowConfig;
use crate::env::Environment;
use crate::epoch::{AccessEpoch, EpochState, ExposureEpoch};
use crate::error::{Error, Result};
use crate::lock::{self, LockKind, LockRecord};
use crate::region::RegionRegistry;
use crate::state::{ControlState, ACC_LOCK_WORD_OFFSET, LOCK_WORD_OFFSET};
use crate::transport::{
    AccessFlags, AddressExchange, Fabric, FlushScope, HelperChannel, OffloadCommand,
    RegisteredRegion,
};
use crate::Rank;

bitflags! {
    /// Assertion flags a caller may pass to synchronization calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u32 {
        /// No conflicting lock is held or will be requested; skip remote
        /// lock acquisition.
        const NOCHECK = 1 << 0;
        /// No local stores during the epoch.
        const NOSTORE = 1 << 1;
        /// No put or accumulate targets local memory during the epoch.
        const NOPUT = 1 << 2;
        /// The fence does not complete any locally issued operations.
        const NOPRECEDE = 1 << 3;
        /// The fence does not start a new epoch.
        const NOSUCCEED = 1 << 4;
    }
}

/// How the window's memory came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFlavor {
    /// User-provided buffer.
    Create,
    /// Buffer allocated by the window.
    Allocate,
    /// No base memory; regions are attached at runtime.
    Dynamic,
    /// Buffer inside a shared-memory segment mapped by the caller.
    Shared,
}

/// Flavor-specific backing behavior.
///
/// One implementation per window flavor; the window dispatches through
/// this trait instead of a table of per-flavor function pointers.
trait WindowBacking<F: Fabric, H: HelperChannel> {
    fn flavor(&self) -> WindowFlavor;
    fn base(&self) -> u64;
    fn size(&self) -> u64;
    fn registry(&self) -> Option<&RegionRegistry> {
        None
    }
    /// Expose a region through this backing; only the dynamic flavor
    /// supports it.
    fn attach_region(
        &mut self,
        fabric: &F,
        state: &mut ControlState,
        base: u64,
        len: u64,
    ) -> Result<()> {
        let _ = (fabric, state, base, len);
        Err(Error::NotDynamic)
    }
    /// Withdraw a region from this backing; only the dynamic flavor
    /// supports it.
    fn detach_region(&mut self, fabric: &F, state: &mut ControlState, base: u64) -> Result<()> {
        let _ = (fabric, state, base);
        Err(Error::NotDynamic)
    }
    /// Release backing resources at window-free time.
    fn release(
        &mut self,
        fabric: &F,
        helper: &H,
        my_world: Rank,
        state: &mut ControlState,
    ) -> Result<()>;
}

/// Fixed window memory shared by the non-dynamic flavors: the fabric
/// registration and the helper-side registration id.
struct FixedMemory {
    base: u64,
    size: u64,
    region: Option<RegisteredRegion>,
    helper_reg_id: Option<u64>,
}

impl FixedMemory {
    fn register<F: Fabric, H: HelperChannel>(
        fabric: &F,
        helper: &H,
        my_world: Rank,
        base: u64,
        size: u64,
    ) -> Result<Self> {
        if size == 0 {
            return Ok(Self {
                base,
                size,
                region: None,
                helper_reg_id: None,
            });
        }
        let region = fabric.register_region(base, size, AccessFlags::rma())?;
        let reg_id = completion::exec_checked(
            helper,
            my_world,
            OffloadCommand::RegisterMemory { base, len: size },
        )?;
        Ok(Self {
            base,
            size,
            region: Some(region),
            helper_reg_id: Some(reg_id),
        })
    }

    fn release<F: Fabric, H: HelperChannel>(
        &mut self,
        fabric: &F,
        helper: &H,
        my_world: Rank,
    ) -> Result<()> {
        if let Some(reg_id) = self.helper_reg_id.take() {
            completion::exec_checked(
                helper,
                my_world,
                OffloadCommand::DeregisterMemory { reg_id },
            )?;
        }
        if let Some(region) = self.region.take() {
            fabric.deregister_region(region.handle)?;
        }
        Ok(())
    }
}

struct CreateBacking {
    mem: FixedMemory,
}

impl<F: Fabric, H: HelperChannel> WindowBacking<F, H> for CreateBacking {
    fn flavor(&self) -> WindowFlavor {
        WindowFlavor::Create
    }
    fn base(&self) -> u64 {
        self.mem.base
    }
    fn size(&self) -> u64 {
        self.mem.size
    }
    fn release(
        &mut self,
        fabric: &F,
        helper: &H,
        my_world: Rank,
        _state: &mut ControlState,
    ) -> Result<()> {
        self.mem.release(fabric, helper, my_world)
    }
}

struct AllocateBacking {
    // Keeps the allocation alive for the window's lifetime.
    _buf: Vec<u8>,
    mem: FixedMemory,
}

impl<F: Fabric, H: HelperChannel> WindowBacking<F, H> for AllocateBacking {
    fn flavor(&self) -> WindowFlavor {
        WindowFlavor::Allocate
    }
    fn base(&self) -> u64 {
        self.mem.base
    }
    fn size(&self) -> u64 {
        self.mem.size
    }
    fn release(
        &mut self,
        fabric: &F,
        helper: &H,
        my_world: Rank,
        _state: &mut ControlState,
    ) -> Result<()> {
        self.mem.release(fabric, helper, my_world)
    }
}

struct SharedBacking {
    mem: FixedMemory,
}

impl<F: Fabric, H: HelperChannel> WindowBacking<F, H> for SharedBacking {
    fn flavor(&self) -> WindowFlavor {
        WindowFlavor::Shared
    }
    fn base(&self) -> u64 {
        self.mem.base
    }
    fn size(&self) -> u64 {
        self.mem.size
    }
    fn release(
        &mut self,
        fabric: &F,
        helper: &H,
        my_world: Rank,
        _state: &mut ControlState,
    ) -> Result<()> {
        // Segment unmapping stays with the caller that mapped it.
        self.mem.release(fabric, helper, my_world)
    }
}

struct DynamicBacking {
    registry: RegionRegistry,
}

impl<F: Fabric, H: HelperChannel> WindowBacking<F, H> for DynamicBacking {
    fn flavor(&self) -> WindowFlavor {
        WindowFlavor::Dynamic
    }
    fn base(&self) -> u64 {
        0
    }
    fn size(&self) -> u64 {
        0
    }
    fn registry(&self) -> Option<&RegionRegistry> {
        Some(&self.registry)
    }
    fn attach_region(
        &mut self,
        fabric: &F,
        state: &mut ControlState,
        base: u64,
        len: u64,
    ) -> Result<()> {
        self.registry.attach(fabric, state, base, len)
    }
    fn detach_region(&mut self, fabric: &F, state: &mut ControlState, base: u64) -> Result<()> {
        self.registry.detach(fabric, state, base)
    }
    fn release(
        &mut self,
        fabric: &F,
        _helper: &H,
        _my_world: Rank,
        state: &mut ControlState,
    ) -> Result<()> {
        // Freeing the window detaches whatever is still attached.
        self.registry.release_all(fabric, state)
    }
}

/// One process's handle on a shared memory window.
pub struct Window<F: Fabric, H: HelperChannel, X: AddressExchange> {
    env: Rc<Environment>,
    fabric: Rc<F>,
    helper: Rc<H>,
    exchange: Rc<X>,
    config: WindowConfig,
    rank: Rank,
    comm_size: u32,
    /// Group rank to world rank, for addressing helper units.
    world_ranks: Vec<Rank>,
    /// Owner's control block; peers reach it through `state_addrs`.
    state: Box<ControlState>,
    state_region: RegisteredRegion,
    /// Remote control-block address per peer.
    state_addrs: Vec<u64>,
    /// Remote window base address per peer.
    base_addrs: Vec<u64>,
    epoch: EpochState,
    /// Nesting depth of passive locks held by this process.
    lock_count: u32,
    /// At most one outstanding lock per target.
    outstanding_locks: HashMap<Rank, LockRecord>,
    lock_all_nocheck: bool,
    /// Offloaded operations issued toward each peer since creation; read
    /// only at free time to scope helper cleanup.
    offload_ops: Vec<u64>,
    backing: Box<dyn WindowBacking<F, H>>,
    freed: bool,
}

impl<F: Fabric, H: HelperChannel, X: AddressExchange> Window<F, H, X> {
    /// Create a window over a caller-provided buffer.
    pub fn create(
        env: Rc<Environment>,
        fabric: Rc<F>,
        helper: Rc<H>,
        exchange: Rc<X>,
        config: WindowConfig,
        base: u64,
        size: u64,
    ) -> Result<Self> {
        let my_world = exchange.world_rank(exchange.rank());
        let mem = FixedMemory::register(&*fabric, &*helper, my_world, base, size)?;
        Self::with_backing(
            env,
            fabric,
            helper,
            exchange,
            config,
            Box::new(CreateBacking { mem }),
        )
    }

    /// Create a window over memory allocated by the window itself.
    pub fn allocate(
        env: Rc<Environment>,
        fabric: Rc<F>,
        helper: Rc<H>,
        exchange: Rc<X>,
        config: WindowConfig,
        size: u64,
    ) -> Result<Self> {
        let buf = vec![0u8; size as usize];
        let base = buf.as_ptr() as u64;
        let my_world = exchange.world_rank(exchange.rank());
        let mem = FixedMemory::register(&*fabric, &*helper, my_world, base, size)?;
        Self::with_backing(
            env,
            fabric,
            helper,
            exchange,
            config,
            Box::new(AllocateBacking { _buf: buf, mem }),
        )
    }

    /// Create a dynamic window with no base memory; regions are attached
    /// and detached at runtime.
    pub fn create_dynamic(
        env: Rc<Environment>,
        fabric: Rc<F>,
        helper: Rc<H>,
        exchange: Rc<X>,
        config: WindowConfig,
    ) -> Result<Self> {
        let registry = RegionRegistry::new(config.max_attached_regions);
        Self::with_backing(
            env,
            fabric,
            helper,
            exchange,
            config,
            Box::new(DynamicBacking { registry }),
        )
    }

    /// Create a window over a caller-mapped shared-memory segment.
    pub fn allocate_shared(
        env: Rc<Environment>,
        fabric: Rc<F>,
        helper: Rc<H>,
        exchange: Rc<X>,
        config: WindowConfig,
        base: u64,
        size: u64,
    ) -> Result<Self> {
        let my_world = exchange.world_rank(exchange.rank());
        let mem = FixedMemory::register(&*fabric, &*helper, my_world, base, size)?;
        Self::with_backing(
            env,
            fabric,
            helper,
            exchange,
            config,
            Box::new(SharedBacking { mem }),
        )
    }

    fn with_backing(
        env: Rc<Environment>,
        fabric: Rc<F>,
        helper: Rc<H>,
        exchange: Rc<X>,
        config: WindowConfig,
        backing: Box<dyn WindowBacking<F, H>>,
    ) -> Result<Self> {
        env.register_progress();

        let state = Box::new(ControlState::new());
        let state_base = &*state as *const ControlState as u64;
        let state_len = std::mem::size_of::<ControlState>() as u64;
        let state_region = match fabric.register_region(state_base, state_len, AccessFlags::rma())
        {
            Ok(region) => region,
            Err(e) => {
                env.unregister_progress();
                return Err(e);
            }
        };

        // Distribute the control-block and window base addresses.
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&state_region.remote_addr.to_le_bytes());
        payload[8..].copy_from_slice(&backing.base().to_le_bytes());
        let exchanged = match exchange.exchange(&payload) {
            Ok(entries) => entries,
            Err(e) => {
                env.unregister_progress();
                return Err(e);
            }
        };
        let (state_addrs, base_addrs) = match parse_exchange(&exchanged) {
            Ok(parsed) => parsed,
            Err(e) => {
                env.unregister_progress();
                return Err(e);
            }
        };

        let rank = exchange.rank();
        let comm_size = exchange.size();
        let world_ranks = (0..comm_size).map(|p| exchange.world_rank(p)).collect();

        Ok(Self {
            env,
            fabric,
            helper,
            exchange,
            config,
            rank,
            comm_size,
            world_ranks,
            state,
            state_region,
            state_addrs,
            base_addrs,
            epoch: EpochState::new(),
            lock_count: 0,
            outstanding_locks: HashMap::new(),
            lock_all_nocheck: false,
            offload_ops: vec![0; comm_size as usize],
            backing,
            freed: false,
        })
    }

    /// This process's rank in the window's group.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of processes sharing the window.
    #[inline]
    pub fn comm_size(&self) -> u32 {
        self.comm_size
    }

    /// Window flavor.
    #[inline]
    pub fn flavor(&self) -> WindowFlavor {
        self.backing.flavor()
    }

    /// Local window base address (zero for dynamic windows).
    #[inline]
    pub fn base(&self) -> u64 {
        self.backing.base()
    }

    /// Local window size in bytes (zero for dynamic windows).
    #[inline]
    pub fn size(&self) -> u64 {
        self.backing.size()
    }

    /// Current epoch state.
    #[inline]
    pub fn epoch(&self) -> EpochState {
        self.epoch
    }

    /// Number of passive locks currently held by this process.
    #[inline]
    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    /// Window configuration.
    #[inline]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Remote window base address of a peer.
    #[inline]
    pub fn peer_base(&self, peer: Rank) -> u64 {
        self.base_addrs[peer as usize]
    }

    /// Remote control-block address of a peer.
    #[inline]
    pub fn state_addr(&self, peer: Rank) -> u64 {
        self.state_addrs[peer as usize]
    }

    /// Number of regions currently attached (dynamic windows).
    pub fn attached_regions(&self) -> usize {
        self.backing.registry().map_or(0, |r| r.len())
    }

    #[inline]
    fn my_world(&self) -> Rank {
        self.world_ranks[self.rank as usize]
    }

    #[inline]
    fn lock_word_addr(&self, target: Rank) -> u64 {
        self.state_addrs[target as usize] + LOCK_WORD_OFFSET
    }

    #[inline]
    fn acc_lock_addr(&self, target: Rank) -> u64 {
        self.state_addrs[target as usize] + ACC_LOCK_WORD_OFFSET
    }

    /// Begin a passive-target epoch on one peer.
    ///
    /// Legal from no epoch (or a fence epoch), or nested under an existing
    /// passive epoch on a *different* target. Under `NOCHECK` the lock is
    /// recorded without touching the remote word.
    pub fn lock(&mut self, kind: LockKind, target: Rank, flags: ModeFlags) -> Result<()> {
        if self.config.no_locks {
            debug!("attempted to lock with no_locks set");
            return Err(Error::LocksDisabled);
        }

        if self.lock_count == 0 {
            self.epoch.require_idle("lock")?;
        } else {
            debug_assert_eq!(self.epoch.access, AccessEpoch::Passive);
            if self.outstanding_locks.contains_key(&target) {
                return Err(Error::AlreadyLocked(target));
            }
        }

        let original = self.epoch.access;
        self.epoch.access = AccessEpoch::Passive;
        self.lock_count += 1;
        assert!(self.lock_count <= self.comm_size);

        let nocheck = flags.contains(ModeFlags::NOCHECK);
        let acquired = if nocheck {
            Ok(())
        } else {
            let addr = self.lock_word_addr(target);
            match kind {
                LockKind::Exclusive => lock::acquire_exclusive(&*self.fabric, target, addr),
                LockKind::Shared => lock::acquire_shared(&*self.fabric, target, addr),
            }
        };

        match acquired {
            Ok(()) => {
                self.outstanding_locks.insert(
                    target,
                    LockRecord {
                        target,
                        kind,
                        nocheck,
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.epoch.access = original;
                self.lock_count -= 1;
                Err(e)
            }
        }
    }

    /// End the passive-target epoch on one peer.
    ///
    /// All operations issued toward the target during the epoch are
    /// completed on both transport layers before the lock word is
    /// released, so the epoch's effects are globally visible to the next
    /// holder.
    pub fn unlock(&mut self, target: Rank) -> Result<()> {
        self.epoch.require_passive("unlock")?;
        let record = self
            .outstanding_locks
            .remove(&target)
            .ok_or(Error::LockNotFound(target))?;

        let flushed = completion::flush_peer(
            &*self.fabric,
            &*self.helper,
            self.my_world(),
            target,
            self.world_ranks[target as usize],
        );
        if let Err(e) = flushed {
            self.outstanding_locks.insert(target, record);
            return Err(e);
        }

        if !record.nocheck {
            let addr = self.lock_word_addr(target);
            let released = match record.kind {
                LockKind::Exclusive => lock::release_exclusive(&*self.fabric, target, addr),
                LockKind::Shared => lock::release_shared(&*self.fabric, target, addr),
            };
            if let Err(e) = released {
                self.outstanding_locks.insert(target, record);
                return Err(e);
            }
        }

        self.lock_count -= 1;
        if self.lock_count == 0 {
            self.epoch.access = AccessEpoch::None;
        }
        Ok(())
    }

    /// Begin a passive-target epoch covering every peer, taking a shared
    /// lock on each in rank order.
    pub fn lock_all(&mut self, flags: ModeFlags) -> Result<()> {
        if self.config.no_locks {
            debug!("attempted to lock_all with no_locks set");
            return Err(Error::LocksDisabled);
        }
        self.epoch.require_idle("lock_all")?;

        let original = self.epoch.access;
        self.epoch.access = AccessEpoch::PassiveAll;

        if flags.contains(ModeFlags::NOCHECK) {
            self.lock_all_nocheck = true;
            return Ok(());
        }
        self.lock_all_nocheck = false;

        for peer in 0..self.comm_size {
            let addr = self.lock_word_addr(peer);
            if let Err(e) = lock::acquire_shared(&*self.fabric, peer, addr) {
                // Back out the prefix already acquired.
                for held in 0..peer {
                    let _ = lock::release_shared(&*self.fabric, held, self.lock_word_addr(held));
                }
                self.epoch.access = original;
                return Err(e);
            }
        }
        Ok(())
    }

    /// End the passive-target epoch covering every peer.
    pub fn unlock_all(&mut self) -> Result<()> {
        self.epoch.require_passive_all("unlock_all")?;
        assert_eq!(self.lock_count, 0);

        completion::flush_world(&*self.fabric, &*self.helper, self.my_world())?;

        let mut first_err = None;
        if !self.lock_all_nocheck {
            for peer in 0..self.comm_size {
                let addr = self.lock_word_addr(peer);
                if let Err(e) = lock::release_shared(&*self.fabric, peer, addr)
                    && first_err.is_none()
                {
                    first_err = Some(e);
                }
            }
        }

        self.epoch.access = AccessEpoch::None;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Synchronize the private and public copies of the window: a local
    /// memory barrier followed by a fabric fence.
    pub fn sync(&self) -> Result<()> {
        self.epoch.require_any_passive("sync")?;
        atomic::fence(atomic::Ordering::SeqCst);
        if let Err(e) = self.fabric.fence() {
            debug!("fabric fence failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Active-target fence: complete outstanding operations, barrier with
    /// the group, and open (or, under `NOSUCCEED`, close) a fence epoch.
    pub fn fence(&mut self, flags: ModeFlags) -> Result<()> {
        self.epoch.require_idle("fence")?;

        if !flags.contains(ModeFlags::NOPRECEDE) {
            self.fabric.flush(FlushScope::Worker)?;
        }
        self.exchange.barrier()?;

        self.epoch.access = if flags.contains(ModeFlags::NOSUCCEED) {
            AccessEpoch::None
        } else {
            AccessEpoch::Fence
        };
        Ok(())
    }

    /// Complete all outstanding operations toward one peer, on both the
    /// fabric and the offload channel.
    pub fn flush(&self, target: Rank) -> Result<()> {
        self.epoch.require_any_passive("flush")?;
        completion::flush_peer(
            &*self.fabric,
            &*self.helper,
            self.my_world(),
            target,
            self.world_ranks[target as usize],
        )
    }

    /// Complete all outstanding operations toward every peer.
    pub fn flush_all(&self) -> Result<()> {
        self.epoch.require_any_passive("flush_all")?;
        completion::flush_world(&*self.fabric, &*self.helper, self.my_world())
    }

    /// Locally complete outstanding operations toward one peer.
    ///
    /// Currently an alias of [`Window::flush`]: true local-only completion
    /// is unimplemented, so callers get remote completion, which is
    /// strictly stronger.
    pub fn flush_local(&self, target: Rank) -> Result<()> {
        self.flush(target)
    }

    /// Locally complete outstanding operations toward every peer.
    ///
    /// Currently an alias of [`Window::flush_all`]; see
    /// [`Window::flush_local`].
    pub fn flush_local_all(&self) -> Result<()> {
        self.flush_all()
    }

    /// Whether serializing `target` requires the accumulate lock.
    ///
    /// An exclusive window lock on the target already serializes every
    /// competing accumulate, so the extra round-trips are elided.
    pub fn needs_acc_lock(&self, target: Rank) -> bool {
        !matches!(
            self.outstanding_locks.get(&target),
            Some(record) if record.kind == LockKind::Exclusive
        )
    }

    /// Acquire the remote accumulate/state lock on `target` unless an
    /// exclusive window lock already covers it (or `force` is set).
    /// Returns whether the lock was actually taken; pass that to
    /// [`Window::state_unlock`].
    pub fn state_lock(&self, target: Rank, force: bool) -> Result<bool> {
        if force || self.needs_acc_lock(target) {
            lock::acquire_exclusive(&*self.fabric, target, self.acc_lock_addr(target))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Serialization bracket for an accumulate toward `target`.
    ///
    /// Skipped entirely when the window is configured for single-intrinsic
    /// accumulates (the fabric's own atomic provides the serialization);
    /// otherwise elided under an exclusive window lock. Release through
    /// [`Window::state_unlock`] with `flush_if_elided` set.
    pub fn accumulate_lock(&self, target: Rank) -> Result<bool> {
        if self.config.acc_single_intrinsic {
            return Ok(false);
        }
        self.state_lock(target, false)
    }

    /// Release the accumulate/state lock taken by [`Window::state_lock`].
    ///
    /// When the lock was held, still-active operations are fenced before
    /// the word is reset. When it was elided but `flush_if_elided` is set,
    /// an endpoint-scoped flush provides the completion instead.
    pub fn state_unlock(&self, target: Rank, acquired: bool, flush_if_elided: bool) -> Result<()> {
        if acquired {
            lock::release_exclusive_checked(&*self.fabric, target, self.acc_lock_addr(target))
        } else if flush_if_elided {
            self.fabric.flush(FlushScope::Endpoint(target))
        } else {
            Ok(())
        }
    }

    /// Expose `[base, base + len)` for RMA access through this dynamic
    /// window. Re-attaching a covered interval only bumps its refcount.
    pub fn attach(&mut self, base: u64, len: u64) -> Result<()> {
        if self.backing.flavor() != WindowFlavor::Dynamic {
            return Err(Error::NotDynamic);
        }

        let acquired = self.state_lock(self.rank, true)?;
        let fabric = Rc::clone(&self.fabric);
        let result = self
            .backing
            .attach_region(&*fabric, &mut self.state, base, len);
        let unlocked = self.state_unlock(self.rank, acquired, false);
        result.and(unlocked)
    }

    /// Withdraw the region containing `base` from RMA access once its
    /// attach count drops to zero.
    pub fn detach(&mut self, base: u64) -> Result<()> {
        if self.backing.flavor() != WindowFlavor::Dynamic {
            return Err(Error::NotDynamic);
        }

        let acquired = self.state_lock(self.rank, true)?;
        let fabric = Rc::clone(&self.fabric);
        let result = self.backing.detach_region(&*fabric, &mut self.state, base);
        let unlocked = self.state_unlock(self.rank, acquired, false);
        result.and(unlocked)
    }

    /// Record one offloaded operation issued toward `target`.
    ///
    /// Called by the data path whenever it routes an operation through the
    /// helper; consulted only at free time.
    pub fn note_offloaded(&mut self, target: Rank) {
        self.offload_ops[target as usize] += 1;
    }

    /// Offloaded operations recorded toward `target`.
    pub fn offloaded_ops(&self, target: Rank) -> u64 {
        self.offload_ops[target as usize]
    }

    /// Free the window.
    ///
    /// All epochs must be closed. Peers that received offloaded
    /// operations get paired worker-level flushes before any registration
    /// is released, and a registration-cache purge afterwards, so the
    /// helper holds nothing that references memory about to disappear.
    pub fn free(mut self) -> Result<()> {
        assert_eq!(self.lock_count, 0, "window freed with locks outstanding");
        assert!(self.outstanding_locks.is_empty());
        assert_eq!(
            self.epoch.exposure,
            ExposureEpoch::None,
            "window freed with an exposure epoch open"
        );

        self.fabric.flush(FlushScope::Worker)?;
        completion::flush_dirty_peers(
            &*self.helper,
            self.my_world(),
            &self.world_ranks,
            &self.offload_ops,
        )?;

        self.exchange.barrier()?;

        let fabric = Rc::clone(&self.fabric);
        let helper = Rc::clone(&self.helper);
        let my_world = self.my_world();
        self.backing
            .release(&*fabric, &*helper, my_world, &mut self.state)?;
        self.fabric.deregister_region(self.state_region.handle)?;

        completion::clear_registration_caches(
            &*self.helper,
            self.my_world(),
            &self.world_ranks,
            &self.offload_ops,
        )?;

        self.env.unregister_progress();
        self.freed = true;
        Ok(())
    }
}

impl<F: Fabric, H: HelperChannel, X: AddressExchange> Drop for Window<F, H, X> {
    fn drop(&mut self) {
        if !self.freed {
            self.env.unregister_progress();
        }
    }
}

fn parse_exchange(entries: &[Vec<u8>]) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut state_addrs = Vec::with_capacity(entries.len());
    let mut base_addrs = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.len() < 16 {
            return Err(Error::Io(io::Error::other(
                "short address-exchange payload",
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&entry[..8]);
        state_addrs.push(u64::from_le_bytes(word));
        word.copy_from_slice(&entry[8..16]);
        base_addrs.push(u64::from_le_bytes(word));
    }
    Ok((state_addrs, base_addrs))
}

//! Test doubles for the fabric, helper channel, and address exchange.
//!
//! `FakeFabric` keeps the "remote" words of every simulated peer in local
//! memory and records every call in a journal, so tests can assert both
//! values and call ordering (for example that a fence precedes a lock-word
//! reset). All state is interior-mutable; the fakes are single-threaded
//! like the core they stand in for.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;

use crate::error::{Error, Result};
use crate::transport::{
    AccessFlags, AddressExchange, AtomicOp, Fabric, FlushScope, FlushToken, HelperChannel,
    OffloadCommand, OffloadResponse, RegionHandle, RegisteredRegion,
};
use crate::Rank;

/// One recorded fabric call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricCall {
    /// Compare-and-swap round-trip.
    Cas {
        /// Target rank.
        target: Rank,
        /// Remote address.
        addr: u64,
        /// Expected prior value.
        expect: u64,
        /// Desired new value.
        desired: u64,
    },
    /// Fetch-and-op round-trip.
    FetchOp {
        /// Target rank.
        target: Rank,
        /// Remote address.
        addr: u64,
        /// Operation.
        op: AtomicOp,
        /// Operand.
        operand: u64,
    },
    /// Fire-and-forget op.
    PostOp {
        /// Target rank.
        target: Rank,
        /// Remote address.
        addr: u64,
        /// Operation.
        op: AtomicOp,
        /// Operand.
        operand: u64,
    },
    /// Ordering fence.
    Fence,
    /// Scoped flush.
    Flush(FlushScope),
    /// Region registration.
    Register {
        /// Base address.
        base: u64,
        /// Length.
        len: u64,
    },
    /// Region deregistration.
    Deregister(u64),
}

/// In-memory fabric: remote words, registrations, and a call journal.
#[derive(Debug, Default)]
pub struct FakeFabric {
    words: RefCell<HashMap<(Rank, u64), u64>>,
    journal: RefCell<Vec<FabricCall>>,
    regions: RefCell<HashMap<u64, (u64, u64)>>,
    next_handle: Cell<u64>,
    progress_count: Cell<u64>,
    fail_after: Cell<Option<u64>>,
}

impl FakeFabric {
    /// Create an empty fabric; every word reads as zero until written.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a simulated remote word.
    pub fn word(&self, target: Rank, addr: u64) -> u64 {
        *self.words.borrow().get(&(target, addr)).unwrap_or(&0)
    }

    /// Overwrite a simulated remote word.
    pub fn set_word(&self, target: Rank, addr: u64, value: u64) {
        self.words.borrow_mut().insert((target, addr), value);
    }

    /// Snapshot of the call journal.
    pub fn calls(&self) -> Vec<FabricCall> {
        self.journal.borrow().clone()
    }

    /// Forget all recorded calls.
    pub fn clear_journal(&self) {
        self.journal.borrow_mut().clear();
    }

    /// Number of currently registered regions.
    pub fn registered_count(&self) -> usize {
        self.regions.borrow().len()
    }

    /// Times `progress()` was invoked.
    pub fn progress_count(&self) -> u64 {
        self.progress_count.get()
    }

    /// Fail the round-trip issued after `remaining` further successful
    /// ones, then recover. `fail_after(0)` fails the next call.
    pub fn fail_after(&self, remaining: u64) {
        self.fail_after.set(Some(remaining));
    }

    /// Journal position of the first fence.
    pub fn position_of_fence(&self) -> Option<usize> {
        self.journal
            .borrow()
            .iter()
            .position(|c| matches!(c, FabricCall::Fence))
    }

    /// Journal position of the first flush with the given scope.
    pub fn position_of_flush(&self, scope: FlushScope) -> Option<usize> {
        self.journal
            .borrow()
            .iter()
            .position(|c| matches!(c, FabricCall::Flush(s) if *s == scope))
    }

    /// Journal position of the first swap on a word.
    pub fn position_of_swap(&self, target: Rank, addr: u64) -> Option<usize> {
        self.journal.borrow().iter().position(|c| {
            matches!(c, FabricCall::FetchOp { target: t, addr: a, op: AtomicOp::Swap, .. }
                if *t == target && *a == addr)
        })
    }

    /// Journal position of the first post to a word.
    pub fn position_of_post(&self, target: Rank, addr: u64) -> Option<usize> {
        self.journal.borrow().iter().position(|c| {
            matches!(c, FabricCall::PostOp { target: t, addr: a, .. }
                if *t == target && *a == addr)
        })
    }

    fn check_fail(&self) -> Result<()> {
        match self.fail_after.get() {
            Some(0) => {
                self.fail_after.set(None);
                Err(Error::Io(io::Error::other("injected fabric failure")))
            }
            Some(n) => {
                self.fail_after.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn apply(&self, target: Rank, addr: u64, op: AtomicOp, operand: u64) -> u64 {
        let mut words = self.words.borrow_mut();
        let word = words.entry((target, addr)).or_insert(0);
        let prior = *word;
        *word = match op {
            AtomicOp::Add => prior.wrapping_add(operand),
            AtomicOp::Swap => operand,
        };
        prior
    }
}

impl Fabric for FakeFabric {
    fn compare_and_swap(&self, target: Rank, addr: u64, expect: u64, desired: u64) -> Result<u64> {
        self.check_fail()?;
        self.journal.borrow_mut().push(FabricCall::Cas {
            target,
            addr,
            expect,
            desired,
        });
        let mut words = self.words.borrow_mut();
        let word = words.entry((target, addr)).or_insert(0);
        let prior = *word;
        if prior == expect {
            *word = desired;
        }
        Ok(prior)
    }

    fn fetch_and_op(&self, target: Rank, addr: u64, op: AtomicOp, operand: u64) -> Result<u64> {
        self.check_fail()?;
        self.journal.borrow_mut().push(FabricCall::FetchOp {
            target,
            addr,
            op,
            operand,
        });
        Ok(self.apply(target, addr, op, operand))
    }

    fn post_op(&self, target: Rank, addr: u64, op: AtomicOp, operand: u64) -> Result<()> {
        self.check_fail()?;
        self.journal.borrow_mut().push(FabricCall::PostOp {
            target,
            addr,
            op,
            operand,
        });
        self.apply(target, addr, op, operand);
        Ok(())
    }

    fn fence(&self) -> Result<()> {
        self.check_fail()?;
        self.journal.borrow_mut().push(FabricCall::Fence);
        Ok(())
    }

    fn flush(&self, scope: FlushScope) -> Result<()> {
        self.check_fail()?;
        self.journal.borrow_mut().push(FabricCall::Flush(scope));
        Ok(())
    }

    fn progress(&self) {
        self.progress_count.set(self.progress_count.get() + 1);
    }

    fn register_region(
        &self,
        base: u64,
        len: u64,
        _access: AccessFlags,
    ) -> Result<RegisteredRegion> {
        self.check_fail()?;
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        self.regions.borrow_mut().insert(handle, (base, len));
        self.journal
            .borrow_mut()
            .push(FabricCall::Register { base, len });
        Ok(RegisteredRegion {
            handle: RegionHandle(handle),
            remote_addr: base,
            rkey: handle.to_le_bytes().to_vec(),
        })
    }

    fn deregister_region(&self, handle: RegionHandle) -> Result<()> {
        let removed = self.regions.borrow_mut().remove(&handle.0);
        assert!(removed.is_some(), "deregistering unknown region");
        self.journal
            .borrow_mut()
            .push(FabricCall::Deregister(handle.0));
        Ok(())
    }
}

/// In-memory helper channel: records commands, simulates nonblocking local
/// flushes that need a configurable number of progress calls to complete.
#[derive(Debug, Default)]
pub struct FakeHelper {
    commands: RefCell<Vec<(Rank, OffloadCommand)>>,
    pending: RefCell<HashMap<u64, u32>>,
    next_token: Cell<u64>,
    next_reg_id: Cell<u64>,
    flush_delay: Cell<u32>,
    progress_count: Cell<u64>,
    endpoint_flushes: Cell<u64>,
    worker_flushes: Cell<u64>,
}

impl FakeHelper {
    /// Create a helper whose local flushes complete immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `ticks` progress calls before a local flush completes.
    pub fn set_flush_delay(&self, ticks: u32) {
        self.flush_delay.set(ticks);
    }

    /// Snapshot of executed commands, in order, with their target ranks.
    pub fn commands(&self) -> Vec<(Rank, OffloadCommand)> {
        self.commands.borrow().clone()
    }

    /// Times `progress()` was invoked.
    pub fn progress_count(&self) -> u64 {
        self.progress_count.get()
    }

    /// Number of local endpoint flushes begun.
    pub fn endpoint_flushes(&self) -> u64 {
        self.endpoint_flushes.get()
    }

    /// Number of local worker flushes begun.
    pub fn worker_flushes(&self) -> u64 {
        self.worker_flushes.get()
    }

    fn begin_flush(&self) -> FlushToken {
        let token = self.next_token.get() + 1;
        self.next_token.set(token);
        self.pending.borrow_mut().insert(token, self.flush_delay.get());
        FlushToken(token)
    }
}

impl HelperChannel for FakeHelper {
    fn exec(&self, target: Rank, command: OffloadCommand) -> Result<OffloadResponse> {
        let reg_id = match command {
            OffloadCommand::RegisterMemory { .. } => {
                let id = self.next_reg_id.get() + 1;
                self.next_reg_id.set(id);
                id
            }
            _ => 0,
        };
        self.commands.borrow_mut().push((target, command));
        Ok(OffloadResponse { status: 0, reg_id })
    }

    fn begin_endpoint_flush(&self) -> Result<FlushToken> {
        self.endpoint_flushes.set(self.endpoint_flushes.get() + 1);
        Ok(self.begin_flush())
    }

    fn begin_worker_flush(&self) -> Result<FlushToken> {
        self.worker_flushes.set(self.worker_flushes.get() + 1);
        Ok(self.begin_flush())
    }

    fn test(&self, token: FlushToken) -> bool {
        self.pending
            .borrow()
            .get(&token.0)
            .is_none_or(|remaining| *remaining == 0)
    }

    fn progress(&self) {
        self.progress_count.set(self.progress_count.get() + 1);
        for remaining in self.pending.borrow_mut().values_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

/// Single-process address exchange.
///
/// Stands in for the collective layer when only one group member actually
/// exists: every peer's contribution is this process's own bytes. Lock and
/// state words stay distinct across peers because the fabric keys them by
/// `(rank, addr)`.
#[derive(Debug)]
pub struct LocalExchange {
    rank: Rank,
    size: u32,
    world_ranks: Vec<Rank>,
    barriers: Cell<u64>,
}

impl LocalExchange {
    /// Exchange for `rank` of `size`, with identity world-rank mapping.
    pub fn new(rank: Rank, size: u32) -> Self {
        Self {
            rank,
            size,
            world_ranks: (0..size).collect(),
            barriers: Cell::new(0),
        }
    }

    /// Exchange with an explicit group-to-world rank mapping.
    pub fn with_world_ranks(rank: Rank, world_ranks: Vec<Rank>) -> Self {
        Self {
            rank,
            size: world_ranks.len() as u32,
            world_ranks,
            barriers: Cell::new(0),
        }
    }

    /// Number of barriers entered.
    pub fn barrier_count(&self) -> u64 {
        self.barriers.get()
    }
}

impl AddressExchange for LocalExchange {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn world_rank(&self, peer: Rank) -> Rank {
        self.world_ranks[peer as usize]
    }

    fn exchange(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok((0..self.size).map(|_| local.to_vec()).collect())
    }

    fn barrier(&self) -> Result<()> {
        self.barriers.set(self.barriers.get() + 1);
        Ok(())
    }
}

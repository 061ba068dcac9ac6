//! Flush composition across the fabric and the offload channel.
//!
//! "Flush" means: every RMA operation previously issued toward the scope is
//! observably complete at the remote side, on both transport layers. All
//! primitives here are synchronous; waiting is an explicit polling loop
//! that drains helper progress between tests.

use log::debug;

use crate::error::Result;
use crate::transport::{Fabric, FlushScope, FlushToken, HelperChannel, OffloadCommand};
use crate::Rank;

/// Poll a nonblocking helper flush to completion.
///
/// The helper makes no progress on its own; skipping the progress call in
/// this loop would spin forever.
pub(crate) fn drain_helper_flush<H: HelperChannel>(helper: &H, token: FlushToken) -> Result<()> {
    while !helper.test(token) {
        helper.progress();
    }
    Ok(())
}

/// Execute an offload command and assert protocol success.
///
/// A nonzero response status means the helper and host have desynchronized;
/// the core cannot compensate, so this is fatal rather than recoverable.
pub(crate) fn exec_checked<H: HelperChannel>(
    helper: &H,
    target: Rank,
    command: OffloadCommand,
) -> Result<u64> {
    let response = helper.exec(target, command)?;
    assert_eq!(response.status, 0, "offload command failed on rank {}", target);
    Ok(response.reg_id)
}

/// Complete all outstanding operations toward one peer.
///
/// Drains the fabric endpoint (addressed by group rank), then asks the
/// peer's helper (addressed by world rank) to flush its own endpoint on our
/// behalf. When the local and target helper endpoints are co-located, the
/// shared local endpoint is flushed directly as well.
pub fn flush_peer<F: Fabric, H: HelperChannel>(
    fabric: &F,
    helper: &H,
    my_world: Rank,
    target: Rank,
    target_world: Rank,
) -> Result<()> {
    fabric.flush(FlushScope::Endpoint(target))?;

    exec_checked(
        helper,
        target_world,
        OffloadCommand::EndpointFlush { origin: my_world },
    )?;

    if my_world == target_world {
        debug!("flushing co-located helper endpoint");
        let token = helper.begin_endpoint_flush()?;
        drain_helper_flush(helper, token)?;
    }
    Ok(())
}

/// Complete all outstanding operations toward every peer.
///
/// Drains the whole fabric worker, then the local host channel, then asks
/// the local helper to flush its worker.
pub fn flush_world<F: Fabric, H: HelperChannel>(
    fabric: &F,
    helper: &H,
    my_world: Rank,
) -> Result<()> {
    fabric.flush(FlushScope::Worker)?;

    let token = helper.begin_worker_flush()?;
    drain_helper_flush(helper, token)?;

    exec_checked(
        helper,
        my_world,
        OffloadCommand::WorkerFlush { origin: my_world },
    )?;
    Ok(())
}

/// Window-free offload teardown, phase one: for every peer that received
/// offloaded operations, run the paired worker-level flushes so the helper
/// holds no in-flight work referencing this window.
pub(crate) fn flush_dirty_peers<H: HelperChannel>(
    helper: &H,
    my_world: Rank,
    world_ranks: &[Rank],
    offload_ops: &[u64],
) -> Result<()> {
    for (peer, &count) in offload_ops.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let target_world = world_ranks[peer];
        exec_checked(
            helper,
            target_world,
            OffloadCommand::WorkerFlush { origin: my_world },
        )?;
        exec_checked(
            helper,
            target_world,
            OffloadCommand::ProxyWorkerFlush { origin: my_world },
        )?;
    }
    Ok(())
}

/// Window-free offload teardown, phase two: drop the remote-key cache
/// entries the dirty peers' helpers hold for us, so no dangling registration
/// outlives the memory it references.
pub(crate) fn clear_registration_caches<H: HelperChannel>(
    helper: &H,
    my_world: Rank,
    world_ranks: &[Rank],
    offload_ops: &[u64],
) -> Result<()> {
    for (peer, &count) in offload_ops.iter().enumerate() {
        if count == 0 {
            continue;
        }
        exec_checked(
            helper,
            world_ranks[peer],
            OffloadCommand::ClearRegistrationCache { origin: my_world },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHelper;

    #[test]
    fn test_drain_polls_progress() {
        let helper = FakeHelper::new();
        helper.set_flush_delay(5);

        let token = helper.begin_worker_flush().unwrap();
        drain_helper_flush(&helper, token).unwrap();
        assert!(helper.progress_count() >= 5);
    }

    #[test]
    fn test_dirty_peer_selection() {
        let helper = FakeHelper::new();
        let world = [10, 11, 12, 13];
        let ops = [0, 3, 0, 1];

        flush_dirty_peers(&helper, 10, &world, &ops).unwrap();
        clear_registration_caches(&helper, 10, &world, &ops).unwrap();

        let commands = helper.commands();
        // Two paired flushes plus one cache clear per dirty peer.
        assert_eq!(commands.len(), 6);
        assert!(commands.iter().all(|(rank, _)| *rank == 11 || *rank == 13));
    }
}

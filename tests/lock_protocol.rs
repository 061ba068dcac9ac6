//! Randomized protocol tests.
//!
//! Multiple simulated processes drive the lock protocol one atomic step at
//! a time against a single shared lock word, under randomized
//! interleavings; the registry sweep mutates a region table while checking
//! its ordering invariants after every operation.
//!
//! Run with:
//! ```bash
//! cargo test --test lock_protocol
//! ```

mod common;

use common::{lock_word_addr, TestGroup};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use oswin::lock::{
    release_exclusive, release_shared, try_acquire_exclusive, try_acquire_shared, LockKind,
};
use oswin::state::ControlState;
use oswin::test_utils::FakeFabric;
use oswin::{find_region_position, Error, ModeFlags, RegionRegistry, LOCK_EXCLUSIVE};

const WORD_ADDR: u64 = 0x4000;
const TARGET: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Idle,
    Exclusive(u32),
    Shared(u32),
}

/// Exclusive acquisition excludes every concurrent holder, shared or
/// exclusive, across random interleavings of single-attempt steps.
#[test]
fn test_mutual_exclusion_under_interleaving() {
    for seed in 0..64 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let fabric = FakeFabric::new();
        let mut actors = [Holder::Idle; 4];

        for _ in 0..512 {
            let who = rng.random_range(0..actors.len());
            match actors[who] {
                Holder::Idle => {
                    if rng.random::<bool>() {
                        if try_acquire_exclusive(&fabric, TARGET, WORD_ADDR).unwrap() {
                            actors[who] = Holder::Exclusive(rng.random_range(1..4));
                        }
                    } else if try_acquire_shared(&fabric, TARGET, WORD_ADDR).unwrap() {
                        actors[who] = Holder::Shared(rng.random_range(1..4));
                    }
                }
                Holder::Exclusive(0) => {
                    release_exclusive(&fabric, TARGET, WORD_ADDR).unwrap();
                    actors[who] = Holder::Idle;
                }
                Holder::Shared(0) => {
                    release_shared(&fabric, TARGET, WORD_ADDR).unwrap();
                    actors[who] = Holder::Idle;
                }
                Holder::Exclusive(n) => actors[who] = Holder::Exclusive(n - 1),
                Holder::Shared(n) => actors[who] = Holder::Shared(n - 1),
            }

            let exclusive = actors
                .iter()
                .filter(|a| matches!(a, Holder::Exclusive(_)))
                .count();
            let shared = actors
                .iter()
                .filter(|a| matches!(a, Holder::Shared(_)))
                .count();

            assert!(exclusive <= 1, "two exclusive holders (seed {})", seed);
            assert!(
                exclusive == 0 || shared == 0,
                "exclusive and shared held together (seed {})",
                seed
            );
            // The word encodes exactly the current holders.
            assert_eq!(
                fabric.word(TARGET, WORD_ADDR),
                exclusive as u64 * LOCK_EXCLUSIVE + shared as u64,
                "lock word diverged from holders (seed {})",
                seed
            );
        }
    }
}

/// `lock_count` tracks exactly the number of unreleased locks across random
/// legal (and illegal) lock/unlock sequences.
#[test]
fn test_lock_count_matches_outstanding_locks() {
    for seed in 0..32 {
        let mut rng = SmallRng::seed_from_u64(1000 + seed);
        let group = TestGroup::new(0, 8);
        let mut win = group.window(4096);
        let mut held: Vec<u32> = Vec::new();

        for _ in 0..256 {
            let target = rng.random_range(0..8u32);
            let kind = if rng.random::<bool>() {
                LockKind::Shared
            } else {
                LockKind::Exclusive
            };

            if held.contains(&target) {
                if rng.random::<bool>() {
                    // Re-locking a held target must fail without side effects.
                    assert!(matches!(
                        win.lock(kind, target, ModeFlags::empty()),
                        Err(Error::AlreadyLocked(_))
                    ));
                } else {
                    win.unlock(target).unwrap();
                    held.retain(|t| *t != target);
                }
            } else if rng.random::<bool>() {
                win.lock(kind, target, ModeFlags::empty()).unwrap();
                held.push(target);
            } else if !held.is_empty() {
                let victim = held[rng.random_range(0..held.len())];
                win.unlock(victim).unwrap();
                held.retain(|t| *t != victim);
            }

            assert_eq!(win.lock_count() as usize, held.len(), "seed {}", seed);
        }

        for target in held {
            win.unlock(target).unwrap();
        }
        assert_eq!(win.lock_count(), 0);
        assert_eq!(group.fabric.word(0, lock_word_addr(&win, 0)), 0);
    }
}

/// Attach/detach sweeps keep the region table sorted, disjoint, and
/// refcounted, no matter the order of operations.
#[test]
fn test_registry_invariants_under_random_sweep() {
    for seed in 0..32 {
        let mut rng = SmallRng::seed_from_u64(2000 + seed);
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(16);

        // Model: refcount per attached base.
        let mut model: Vec<(u64, u64, u32)> = Vec::new();

        for _ in 0..256 {
            // One fixed interval per slot: re-attaching a slot always hits
            // the containment path, never a partial overlap (which callers
            // are forbidden to create).
            let slot = rng.random_range(0..24u64);
            let base = 0x1_0000 + slot * 0x1000;
            let len = (slot % 4 + 1) * 0x400;

            if rng.random::<f64>() < 0.6 {
                match registry.attach(&fabric, &mut state, base, len) {
                    Ok(()) => {
                        if let Some(entry) = model
                            .iter_mut()
                            .find(|(b, l, _)| *b <= base && base + len <= *b + *l)
                        {
                            entry.2 += 1;
                        } else {
                            model.push((base, len, 1));
                        }
                    }
                    Err(Error::AttachLimit(16)) => assert_eq!(registry.len(), 16),
                    Err(e) => panic!("unexpected attach error: {}", e),
                }
            } else if let Some(index) = (!model.is_empty())
                .then(|| rng.random_range(0..model.len()))
            {
                let (base, _, _) = model[index];
                registry.detach(&fabric, &mut state, base).unwrap();
                model[index].2 -= 1;
                if model[index].2 == 0 {
                    model.remove(index);
                }
            }

            // Spans stay sorted and pairwise disjoint.
            let spans = registry.spans();
            for pair in spans.windows(2) {
                assert!(
                    pair[0].base + pair[0].len <= pair[1].base,
                    "overlap or misorder (seed {})",
                    seed
                );
            }
            assert_eq!(spans.len(), model.len(), "seed {}", seed);
            assert_eq!(registry.len(), state.region_count as usize);
            assert_eq!(fabric.registered_count(), spans.len());

            // Every span is findable at its own base.
            for span in &spans {
                let (contain, _) = find_region_position(&spans, span.base, 1);
                assert!(contain.is_some());
            }
        }

        // Detaching an address outside every region is refused.
        assert!(matches!(
            registry.detach(&fabric, &mut state, 0xdead_0000),
            Err(Error::RegionNotFound(_))
        ));
    }
}

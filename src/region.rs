//! Dynamic-window region registry.
//!
//! An ordered, capacity-bounded table of the memory intervals a process has
//! attached to a dynamic window. Region counts are small, so the table is a
//! sorted array with shift-insert/remove rather than a tree; all mutation
//! happens under an exclusive state lock on the owning rank.

use log::error;

use crate::error::{Error, Result};
use crate::state::{ControlState, RegionSpan};
use crate::transport::{AccessFlags, Fabric, RegionHandle};

/// Locate the region containing `[base, base + len)` in a sorted span list.
///
/// Returns `(containing, insertion)`: the index of a containing region if
/// one exists, and otherwise the index at which a new span with this base
/// keeps the list sorted. Zero-length spans are whole-remaining-space
/// sentinels and contain everything at or above their base.
pub fn find_region_position(
    regions: &[RegionSpan],
    base: u64,
    len: u64,
) -> (Option<usize>, usize) {
    let mut lo = 0usize;
    let mut hi = regions.len();

    while lo < hi {
        let mid = (lo + hi) / 2;
        let candidate = &regions[mid];
        if candidate.base > base {
            hi = mid;
        } else if base + len <= candidate.end() {
            return (Some(mid), mid);
        } else {
            lo = mid + 1;
        }
    }

    (None, lo)
}

/// One attached region: the exposed span, its fabric registration, and the
/// number of attach calls it currently satisfies.
#[derive(Debug)]
struct AttachedRegion {
    span: RegionSpan,
    handle: RegionHandle,
    rkey: Vec<u8>,
    refcnt: u32,
}

/// Per-window table of attached regions.
///
/// Invariants: spans are pairwise disjoint and sorted ascending by base;
/// `refcnt >= 1` for every present entry.
#[derive(Debug)]
pub struct RegionRegistry {
    regions: Vec<AttachedRegion>,
    capacity: usize,
}

impl RegionRegistry {
    /// Create an empty registry bounded at `capacity` regions.
    pub fn new(capacity: usize) -> Self {
        Self {
            regions: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of attached regions.
    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the registry holds no regions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Snapshot of the attached spans, in table order.
    pub fn spans(&self) -> Vec<RegionSpan> {
        self.regions.iter().map(|r| r.span).collect()
    }

    /// Reference count of the region containing `base`, if any.
    pub fn refcnt_at(&self, base: u64) -> Option<u32> {
        let (contain, _) = find_region_position(&self.spans(), base, 1);
        contain.map(|i| self.regions[i].refcnt)
    }

    /// Attach `[base, base + len)`.
    ///
    /// A region already covering the interval has its refcount bumped and
    /// nothing else happens. Otherwise the interval is registered with the
    /// fabric, inserted at its sort position, and mirrored into the control
    /// state. Caller must hold the exclusive state lock on the local rank.
    pub fn attach<F: Fabric>(
        &mut self,
        fabric: &F,
        state: &mut ControlState,
        base: u64,
        len: u64,
    ) -> Result<()> {
        let spans = self.spans();
        let (contain, insert) = find_region_position(&spans, base, len);

        if let Some(index) = contain {
            self.regions[index].refcnt += 1;
            return Ok(());
        }

        if self.regions.len() >= self.capacity {
            error!(
                "dynamic region attach failed: cannot satisfy {} attached regions, max is {}",
                self.regions.len() + 1,
                self.capacity
            );
            return Err(Error::AttachLimit(self.capacity));
        }

        let registered = fabric.register_region(base, len, AccessFlags::rma())?;
        self.regions.insert(
            insert,
            AttachedRegion {
                span: RegionSpan { base, len },
                handle: registered.handle,
                rkey: registered.rkey,
                refcnt: 1,
            },
        );
        state.sync_regions(&self.spans());
        Ok(())
    }

    /// Detach the region containing `base`.
    ///
    /// Detaching an address no region covers is caller error and is refused
    /// explicitly. The registration is dropped and the table compacted only
    /// when the refcount reaches zero. Caller must hold the exclusive state
    /// lock on the local rank.
    pub fn detach<F: Fabric>(
        &mut self,
        fabric: &F,
        state: &mut ControlState,
        base: u64,
    ) -> Result<()> {
        let spans = self.spans();
        let (contain, _) = find_region_position(&spans, base, 1);
        let index = match contain {
            Some(index) => index,
            None => return Err(Error::RegionNotFound(base)),
        };

        self.regions[index].refcnt -= 1;
        if self.regions[index].refcnt == 0 {
            let region = self.regions.remove(index);
            fabric.deregister_region(region.handle)?;
            state.sync_regions(&self.spans());
        }
        Ok(())
    }

    /// Drop every remaining registration at window-free time.
    ///
    /// Window free detaches whatever the application left attached.
    pub fn release_all<F: Fabric>(
        &mut self,
        fabric: &F,
        state: &mut ControlState,
    ) -> Result<()> {
        for region in self.regions.drain(..) {
            assert!(region.refcnt >= 1);
            fabric.deregister_region(region.handle)?;
        }
        state.sync_regions(&[]);
        Ok(())
    }

    /// Packed remote key of the region containing `base`, for address
    /// exchange with peers.
    pub fn rkey_at(&self, base: u64) -> Option<&[u8]> {
        let (contain, _) = find_region_position(&self.spans(), base, 1);
        contain.map(|i| self.regions[i].rkey.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFabric;

    fn span(base: u64, len: u64) -> RegionSpan {
        RegionSpan { base, len }
    }

    #[test]
    fn test_locate_contained_and_insertion() {
        let regions = [span(0, 100), span(200, 50)];

        assert_eq!(find_region_position(&regions, 10, 5), (Some(0), 0));
        assert_eq!(find_region_position(&regions, 210, 5), (Some(1), 1));

        let (contain, insert) = find_region_position(&regions, 150, 10);
        assert_eq!(contain, None);
        assert_eq!(insert, 1);
    }

    #[test]
    fn test_locate_empty_and_bounds() {
        assert_eq!(find_region_position(&[], 10, 5), (None, 0));

        let regions = [span(100, 10)];
        assert_eq!(find_region_position(&regions, 5, 1).1, 0);
        assert_eq!(find_region_position(&regions, 500, 1).1, 1);
    }

    #[test]
    fn test_locate_sentinel_span() {
        // A zero-length span covers everything at or above its base.
        let regions = [span(0, 16), span(4096, 0)];
        assert_eq!(find_region_position(&regions, 1 << 40, 64), (Some(1), 1));
        assert_eq!(find_region_position(&regions, 4096, 1), (Some(1), 1));
        assert_eq!(find_region_position(&regions, 100, 1), (None, 1));
    }

    #[test]
    fn test_attach_keeps_spans_sorted_and_disjoint() {
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(8);

        registry.attach(&fabric, &mut state, 3000, 100).unwrap();
        registry.attach(&fabric, &mut state, 1000, 100).unwrap();
        registry.attach(&fabric, &mut state, 2000, 100).unwrap();

        let spans = registry.spans();
        assert_eq!(spans.len(), 3);
        for pair in spans.windows(2) {
            assert!(pair[0].base + pair[0].len <= pair[1].base);
        }
        assert_eq!(state.region_count, 3);
        assert_eq!(state.region_spans(), spans.as_slice());
    }

    #[test]
    fn test_contained_attach_bumps_refcnt() {
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(8);

        registry.attach(&fabric, &mut state, 1000, 4096).unwrap();
        registry.attach(&fabric, &mut state, 1024, 64).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.refcnt_at(1024), Some(2));
        assert_eq!(fabric.registered_count(), 1);
    }

    #[test]
    fn test_detach_removes_only_at_zero() {
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(8);

        registry.attach(&fabric, &mut state, 1000, 4096).unwrap();
        registry.attach(&fabric, &mut state, 1000, 4096).unwrap();

        registry.detach(&fabric, &mut state, 1000).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(fabric.registered_count(), 1);

        registry.detach(&fabric, &mut state, 1000).unwrap();
        assert!(registry.is_empty());
        assert_eq!(fabric.registered_count(), 0);
        assert_eq!(state.region_count, 0);
    }

    #[test]
    fn test_detach_unattached_is_refused() {
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(8);

        registry.attach(&fabric, &mut state, 1000, 16).unwrap();
        assert!(matches!(
            registry.detach(&fabric, &mut state, 9000),
            Err(Error::RegionNotFound(9000))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let fabric = FakeFabric::new();
        let mut state = ControlState::new();
        let mut registry = RegionRegistry::new(2);

        registry.attach(&fabric, &mut state, 0, 10).unwrap();
        registry.attach(&fabric, &mut state, 100, 10).unwrap();

        let before = registry.spans();
        assert!(matches!(
            registry.attach(&fabric, &mut state, 200, 10),
            Err(Error::AttachLimit(2))
        ));
        assert_eq!(registry.spans(), before);
        assert_eq!(fabric.registered_count(), 2);
    }
}

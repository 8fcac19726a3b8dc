//! The physical memory map: an address-ordered registry of non-overlapping
//! RAM and MMIO regions.
//!
//! Readers (harts resolving an address on every load/store/fetch) take no
//! lock at all: they call [`PhysicalMap::find`], which pins an RCU epoch and
//! binary-searches an immutable, address-sorted snapshot. Writers
//! (`attach`/`remove`, always invoked by the machine orchestrator with every
//! hart paused) serialize on an internal mutex, build a new snapshot, and
//! publish it with a single atomic pointer swap; the old snapshot is freed
//! only once every reader that could have observed it has dropped its pin.

use std::sync::Arc;

use parking_lot::Mutex;
use rvvm_support::{Handle, Rcu, SlotArray};

use crate::error::{MemError, MemResult};
use crate::region::Region;

const PAGE_SIZE: u64 = 4096;

struct Writer {
    slots: SlotArray<Arc<Region>>,
}

/// The guest physical address space.
pub struct PhysicalMap {
    writer: Mutex<Writer>,
    sorted: Rcu<Vec<Arc<Region>>>,
}

impl PhysicalMap {
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(Writer {
                slots: SlotArray::new(),
            }),
            sorted: Rcu::new(Vec::new()),
        }
    }

    /// Attach a region. Fails if `[region.base, region.end())` would
    /// overlap an existing region or wrap the address space. Returns a
    /// handle stable for the region's lifetime, even across later
    /// RCU republications triggered by unrelated attach/remove calls.
    pub fn attach(&self, region: Region) -> MemResult<Handle> {
        let base = region.base;
        let size = region.size;
        let end = base
            .checked_add(size)
            .ok_or(MemError::AddressWrap { addr: base, size })?;

        let mut writer = self.writer.lock();
        for existing in writer.slots.iter() {
            if ranges_overlap(base, end, existing.base, existing.end()) {
                return Err(MemError::Overlap { addr: base, end });
            }
        }

        let region = Arc::new(region);
        let handle = writer.slots.insert(region);
        self.republish(&writer);
        Ok(handle)
    }

    /// Detach the region addressed by `handle`, invoking its `remove`
    /// callback exactly once. Caller must ensure this runs only while every
    /// hart is paused (the machine orchestrator's contract); this type does
    /// not itself pause anything.
    pub fn remove(&self, handle: Handle) -> MemResult<()> {
        let mut writer = self.writer.lock();
        let region = writer.slots.remove(handle).ok_or(MemError::StaleHandle)?;
        if let crate::region::RegionKind::Mmio { device, .. } = &region.kind {
            device.remove();
        }
        self.republish(&writer);
        Ok(())
    }

    fn republish(&self, writer: &Writer) {
        let mut snapshot: Vec<Arc<Region>> = writer.slots.iter().cloned().collect();
        snapshot.sort_by_key(|r| r.base);
        self.sorted.publish(snapshot);
    }

    /// Return the single region that fully contains `[addr, addr+size)`.
    pub fn find(&self, addr: u64, size: u64) -> Option<Arc<Region>> {
        self.sorted.read(|regions| {
            let idx = match regions.binary_search_by(|r| r.base.cmp(&addr)) {
                Ok(i) => i,
                Err(0) => return None,
                Err(i) => i - 1,
            };
            let region = &regions[idx];
            if region.contains_range(addr, size) {
                Some(region.clone())
            } else {
                None
            }
        })
    }

    /// The lowest page-aligned address at or above `hint` such that
    /// `[addr, addr+size)` does not overlap any attached region.
    pub fn zone_auto(&self, hint: u64, size: u64) -> MemResult<u64> {
        let hint = hint.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        self.sorted.read(|regions| {
            let mut candidate = hint;
            loop {
                let end = candidate
                    .checked_add(size)
                    .ok_or(MemError::NoFreeRange { hint, size })?;
                match regions.iter().find(|r| ranges_overlap(candidate, end, r.base, r.end())) {
                    None => return Ok(candidate),
                    Some(overlapping) => {
                        candidate = overlapping.end().div_ceil(PAGE_SIZE) * PAGE_SIZE;
                    }
                }
            }
        })
    }

    /// An immutable snapshot of every currently-attached region, in
    /// address order. Used by the machine orchestrator's event loop to
    /// drive `update` callbacks and has no effect on the RCU discipline:
    /// the returned `Arc`s keep their regions alive independent of any
    /// later republish.
    pub fn snapshot(&self) -> Vec<Arc<Region>> {
        self.sorted.read(|regions| regions.clone())
    }

    /// A host pointer usable for DMA, valid only if `[addr, addr+size)` is
    /// entirely contained in one RAM-backed region.
    pub fn dma_ptr(&self, addr: u64, size: u64) -> Option<DmaPtr> {
        let region = self.find(addr, size)?;
        match &region.kind {
            crate::region::RegionKind::Ram { data } => {
                let offset = (addr - region.base) as usize;
                Some(DmaPtr {
                    _region: region.clone(),
                    data: data.clone(),
                    offset,
                    len: size as usize,
                })
            }
            crate::region::RegionKind::Mmio { .. } => None,
        }
    }
}

impl Default for PhysicalMap {
    fn default() -> Self {
        Self::new()
    }
}

fn ranges_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start < b_end && b_start < a_end
}

/// A handle to a span of RAM suitable for device DMA. Keeps the backing
/// region's `Arc` alive so the buffer cannot be freed out from under an
/// in-flight DMA even if the region is concurrently relocated or removed
/// (removal only runs with harts paused, but a device's own worker thread
/// performing DMA is not a hart).
pub struct DmaPtr {
    _region: Arc<Region>,
    data: Arc<parking_lot::RwLock<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl DmaPtr {
    pub fn read_to(&self, out: &mut [u8]) {
        let guard = self.data.read();
        out.copy_from_slice(&guard[self.offset..self.offset + self.len]);
    }

    pub fn write_from(&self, input: &[u8]) {
        let mut guard = self.data.write();
        guard[self.offset..self.offset + self.len].copy_from_slice(input);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_rejects_overlap() {
        let map = PhysicalMap::new();
        map.attach(Region::ram(0x1000, 0x1000)).unwrap();
        let err = map.attach(Region::ram(0x1800, 0x1000)).unwrap_err();
        assert_eq!(err, MemError::Overlap { addr: 0x1800, end: 0x2800 });
    }

    #[test]
    fn attach_rejects_wrap() {
        let map = PhysicalMap::new();
        let err = map.attach(Region::ram(u64::MAX - 10, 100)).unwrap_err();
        assert!(matches!(err, MemError::AddressWrap { .. }));
    }

    #[test]
    fn find_returns_containing_region_only() {
        let map = PhysicalMap::new();
        map.attach(Region::ram(0x1000, 0x1000)).unwrap();
        assert!(map.find(0x1000, 4).is_some());
        assert!(map.find(0x1ffc, 4).is_some());
        assert!(map.find(0x1ffd, 4).is_none());
        assert!(map.find(0x2000, 4).is_none());
    }

    #[test]
    fn remove_frees_the_slot_and_unpublishes() {
        let map = PhysicalMap::new();
        let handle = map.attach(Region::ram(0x1000, 0x1000)).unwrap();
        assert!(map.find(0x1000, 4).is_some());
        map.remove(handle).unwrap();
        assert!(map.find(0x1000, 4).is_none());
        assert_eq!(map.remove(handle).unwrap_err(), MemError::StaleHandle);
    }

    #[test]
    fn zone_auto_skips_occupied_ranges() {
        let map = PhysicalMap::new();
        map.attach(Region::ram(0x1000, 0x2000)).unwrap();
        let addr = map.zone_auto(0x1000, 0x1000).unwrap();
        assert_eq!(addr, 0x3000);
    }

    #[test]
    fn dma_ptr_roundtrips_into_ram() {
        let map = PhysicalMap::new();
        map.attach(Region::ram(0x8000_0000, 0x1000)).unwrap();
        let dma = map.dma_ptr(0x8000_0010, 16).unwrap();
        dma.write_from(&[1; 16]);
        let mut out = [0u8; 16];
        dma.read_to(&mut out);
        assert_eq!(out, [1; 16]);
    }

    #[test]
    fn dma_ptr_refuses_mmio() {
        use crate::region::MmioDevice;
        struct Dev;
        impl MmioDevice for Dev {
            fn read(&self, _offset: u64, _buf: &mut [u8]) -> bool {
                true
            }
            fn write(&self, _offset: u64, _buf: &[u8]) -> bool {
                true
            }
        }
        let map = PhysicalMap::new();
        map.attach(Region::mmio(0x9000, 0x100, Arc::new(Dev), 1, 4))
            .unwrap();
        assert!(map.dma_ptr(0x9000, 4).is_none());
    }
}

/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

mod contiguous;
mod system;


use bitflags::bitflags;

pub use contiguous::ContiguousHeapModule;
pub use system::SystemHeapModule;

use crate::{
    error::{IonError, IonResult},
    mapping::VmRegion,
    types::{phys_to_pfn, AllocationFlags, HeapFlags, HeapType, Pfn, PAGE_SIZE},
};

bitflags! {
    /// Optional operations a heap implements
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapCapabilities: u32 {
        const MAP_KERNEL = 1 << 0;
        const MAP_USER = 1 << 1;
        const PHYS = 1 << 2;
    }
}

/// A physically contiguous piece of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub phys: u64,
    pub len: usize,
}

/// Memory handed out by a heap.
///
/// `private` is not interpreted by the device, heaps can use it to find
/// their bookkeeping again once the allocation is returned.
#[derive(Debug, Default)]
pub struct HeapAllocation {
    pub extents: Vec<Extent>,
    pub private: u64,
}

impl HeapAllocation {
    pub fn single(phys: u64, len: usize) -> Self {
        Self {
            extents: vec![Extent { phys, len }],
            private: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.extents.iter().map(|e| e.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of the device mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub phys: u64,
    pub len: usize,
    pub dma_address: u64,
}

/// Device mapping table of a buffer: physically addressable extents in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn from_extents(extents: &[Extent]) -> Self {
        Self {
            segments: extents
                .iter()
                .map(|e| Segment {
                    phys: e.phys,
                    len: e.len,
                    dma_address: 0,
                })
                .collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Every page frame of the table, in order
    pub fn pfns(&self) -> impl Iterator<Item = Pfn> + '_ {
        self.segments.iter().flat_map(|s| {
            let first = phys_to_pfn(s.phys);
            (0..(s.len / PAGE_SIZE) as u64).map(move |i| first + i)
        })
    }
}

/// A pluggable allocation backend.
///
/// Heaps are shared between all clients of a device, so every method takes `&self`
/// and implementations synchronize internally. `allocate` may block.
pub trait HeapModule: Send + Sync {
    fn name(&self) -> &str;

    fn heap_type(&self) -> HeapType;

    /// Policy flags of this heap
    fn flags(&self) -> HeapFlags {
        HeapFlags::empty()
    }

    /// Which of the optional operations are implemented
    fn capabilities(&self) -> HeapCapabilities {
        HeapCapabilities::empty()
    }

    /// Allocates at least `len` bytes
    fn allocate(&self, len: usize, align: usize, flags: AllocationFlags) -> IonResult<HeapAllocation>;

    /// Returns an allocation to the heap
    fn free(&self, allocation: HeapAllocation);

    /// Builds the device mapping table of an allocation
    fn map_dma(&self, allocation: &HeapAllocation) -> IonResult<SegmentTable> {
        Ok(SegmentTable::from_extents(&allocation.extents))
    }

    fn unmap_dma(&self, _allocation: &HeapAllocation) {}

    /// Maps the allocation into the kernel address space and returns the virtual address
    fn map_kernel(&self, _allocation: &HeapAllocation) -> IonResult<usize> {
        Err(IonError::NotSupported("map_kernel"))
    }

    fn unmap_kernel(&self, _allocation: &HeapAllocation) {}

    /// Populates a user mapping region with the allocation's pages
    fn map_user(
        &self,
        _allocation: &HeapAllocation,
        _table: &SegmentTable,
        _region: &VmRegion,
    ) -> IonResult<()> {
        Err(IonError::NotSupported("map_user"))
    }

    /// Physical address and length of a physically contiguous allocation
    fn phys(&self, _allocation: &HeapAllocation) -> IonResult<(u64, usize)> {
        Err(IonError::NotSupported("phys"))
    }

    /// Releases cached memory the heap keeps for itself.
    ///
    /// With `nr_to_scan == 0` only the number of reclaimable pages is returned.
    fn shrink(&self, _nr_to_scan: usize) -> usize {
        0
    }
}

/// Inserts every page of `table` into `region`, starting at page 0
pub fn map_user_from_table(table: &SegmentTable, region: &VmRegion) -> IonResult<()> {
    for (offset, pfn) in table.pfns().enumerate().take(region.len_pages()) {
        region.insert_pfn(offset, pfn)?;
    }
    Ok(())
}

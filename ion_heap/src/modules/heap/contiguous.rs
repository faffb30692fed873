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

use std::sync::Arc;

use log::{error, trace};

use super::{map_user_from_table, HeapAllocation, HeapCapabilities, HeapModule, SegmentTable};
use crate::{
    contiguous::{ContiguousAreas, ContiguousRegion},
    error::{IonError, IonResult},
    mapping::VmRegion,
    types::{pfn_to_phys, phys_to_pfn, AllocationFlags, HeapFlags, HeapType},
    util::{get_order, pages_of},
};

/// Heap handing out physically contiguous memory from a [`ContiguousRegion`].
///
/// If created with [`ContiguousHeapModule::with_areas`], requests of at least
/// `large_threshold` pages go through [`ContiguousAreas::alloc_large`].
pub struct ContiguousHeapModule {
    name: String,
    flags: HeapFlags,
    region: Arc<ContiguousRegion>,
    large: Option<(Arc<ContiguousAreas>, usize)>,
}

impl ContiguousHeapModule {
    pub fn new(name: impl Into<String>, region: Arc<ContiguousRegion>) -> Self {
        Self {
            name: name.into(),
            flags: HeapFlags::empty(),
            region,
            large: None,
        }
    }

    pub fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_areas(mut self, areas: Arc<ContiguousAreas>, large_threshold: usize) -> Self {
        self.large = Some((areas, large_threshold));
        self
    }

    pub fn region(&self) -> &Arc<ContiguousRegion> {
        &self.region
    }
}

impl HeapModule for ContiguousHeapModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> HeapType {
        HeapType::Contiguous
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn capabilities(&self) -> HeapCapabilities {
        HeapCapabilities::MAP_KERNEL | HeapCapabilities::MAP_USER | HeapCapabilities::PHYS
    }

    fn allocate(&self, len: usize, align: usize, _flags: AllocationFlags) -> IonResult<HeapAllocation> {
        let count = pages_of(len);
        let order = get_order(align);

        let result = match &self.large {
            Some((areas, threshold)) if count >= *threshold => {
                areas.alloc_large(&self.region, count, order)
            }
            _ => self.region.alloc(count, order),
        };

        let pfn = result.map_err(|err| {
            trace!("{}: contiguous allocation of {} pages failed: {}", self.name, count, err);
            match err {
                IonError::InvalidArgument(_) | IonError::NotActivated | IonError::Busy { .. } => err,
                _ => IonError::OutOfMemory,
            }
        })?;

        Ok(HeapAllocation::single(pfn_to_phys(pfn), len))
    }

    fn free(&self, allocation: HeapAllocation) {
        for extent in allocation.extents {
            if !self.region.release(phys_to_pfn(extent.phys), pages_of(extent.len)) {
                error!(
                    "{}: allocation at {:#x} does not belong to the region",
                    self.name,
                    extent.phys
                );
            }
        }
    }

    fn map_kernel(&self, allocation: &HeapAllocation) -> IonResult<usize> {
        // regions are declared over identity mapped memory
        allocation
            .extents
            .first()
            .map(|e| e.phys as usize)
            .ok_or(IonError::InvalidArgument("empty allocation"))
    }

    fn map_user(
        &self,
        _allocation: &HeapAllocation,
        table: &SegmentTable,
        region: &VmRegion,
    ) -> IonResult<()> {
        map_user_from_table(table, region)
    }

    fn phys(&self, allocation: &HeapAllocation) -> IonResult<(u64, usize)> {
        let extent = allocation
            .extents
            .first()
            .ok_or(IonError::InvalidArgument("empty allocation"))?;
        Ok((extent.phys, allocation.len()))
    }
}

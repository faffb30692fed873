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

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use super::{map_user_from_table, Extent, HeapAllocation, HeapCapabilities, HeapModule, SegmentTable};
use crate::{
    error::{IonError, IonResult},
    mapping::VmRegion,
    types::{AllocationFlags, HeapFlags, HeapType, PAGE_SIZE},
};

/// Heap backed by page aligned host memory.
///
/// Every allocation is one host block, its device mapping table is split
/// into extents of at most `segment_size` bytes.
pub struct SystemHeapModule {
    name: String,
    flags: HeapFlags,
    /// `None` for no limit
    limit: Option<usize>,
    used: AtomicUsize,
    segment_size: usize,
}

impl SystemHeapModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: HeapFlags::empty(),
            limit: None,
            used: AtomicUsize::new(0),
            segment_size: 64 * 1024,
        }
    }

    pub fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Allocations fail once `limit` bytes are in use
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        assert!(segment_size >= PAGE_SIZE && segment_size % PAGE_SIZE == 0);
        self.segment_size = segment_size;
        self
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn reserve(&self, len: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let new_used = used.checked_add(len)?;
                match self.limit {
                    Some(limit) if new_used > limit => None,
                    _ => Some(new_used),
                }
            })
            .is_ok()
    }

    fn layout(len: usize, align: usize) -> Option<Layout> {
        let align = if align.is_power_of_two() { align.max(PAGE_SIZE) } else { PAGE_SIZE };
        Layout::from_size_align(len.checked_next_multiple_of(PAGE_SIZE)?, align).ok()
    }
}

impl HeapModule for SystemHeapModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_type(&self) -> HeapType {
        HeapType::System
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn capabilities(&self) -> HeapCapabilities {
        HeapCapabilities::MAP_KERNEL | HeapCapabilities::MAP_USER
    }

    fn allocate(&self, len: usize, align: usize, _flags: AllocationFlags) -> IonResult<HeapAllocation> {
        let layout = Self::layout(len, align).ok_or(IonError::InvalidArgument("invalid layout"))?;
        if layout.size() == 0 {
            return Err(IonError::InvalidArgument("length cannot be zero"));
        }

        if !self.reserve(layout.size()) {
            trace!("{}: limit reached, cannot allocate {} bytes", self.name, layout.size());
            return Err(IonError::OutOfMemory);
        }

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            self.used.fetch_sub(layout.size(), Ordering::AcqRel);
            return Err(IonError::OutOfMemory);
        }

        let base = ptr as u64;
        let mut extents = Vec::new();
        let mut offset = 0;
        while offset < layout.size() {
            let len = self.segment_size.min(layout.size() - offset);
            extents.push(Extent {
                phys: base + offset as u64,
                len,
            });
            offset += len;
        }

        Ok(HeapAllocation {
            extents,
            private: layout.align() as u64,
        })
    }

    fn free(&self, allocation: HeapAllocation) {
        let len = allocation.len();
        let Some(first) = allocation.extents.first() else {
            return;
        };
        let Some(layout) = Self::layout(len, allocation.private as usize) else {
            return;
        };

        unsafe { dealloc(first.phys as *mut u8, layout) };
        self.used.fetch_sub(layout.size(), Ordering::AcqRel);
    }

    fn map_kernel(&self, allocation: &HeapAllocation) -> IonResult<usize> {
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
}

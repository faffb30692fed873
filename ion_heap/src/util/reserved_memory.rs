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
    ptr::NonNull,
};

use crate::{
    error::{IonError, IonResult},
    types::{phys_to_pfn, Pfn, PAGE_SIZE},
};

/// Page aligned block of host memory standing in for a reserved physical range.
///
/// The block address is used as its physical address, so page frame numbers
/// derived from it can be mapped back with `pfn << PAGE_SHIFT`.
#[derive(Debug)]
pub struct ReservedMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// the block is plain memory owned by this value
unsafe impl Send for ReservedMemory {}
unsafe impl Sync for ReservedMemory {}

impl ReservedMemory {
    /// Reserves `size` bytes aligned to `alignment` (at least one page)
    pub fn reserve(size: usize, alignment: usize) -> IonResult<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(IonError::InvalidArgument("reserved size has to be a multiple of the page size"));
        }
        let layout = Layout::from_size_align(size, alignment.max(PAGE_SIZE))
            .map_err(|_| IonError::InvalidArgument("invalid reservation alignment"))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(IonError::ResourceExhausted { len: size })?;

        Ok(Self { ptr, layout })
    }

    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn base_pfn(&self) -> Pfn {
        phys_to_pfn(self.base())
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for ReservedMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

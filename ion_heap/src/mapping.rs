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
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use log::trace;

use crate::{
    buffer::Buffer,
    error::{IonError, IonResult},
    types::Pfn,
    util::lock,
};

/// A user virtual address range a buffer is mapped into.
///
/// Only records which page frame backs which page, the actual page table
/// belongs to whoever created the region.
#[derive(Debug)]
pub struct VmRegion {
    pages: usize,
    /// pages are inserted on fault instead of up front
    faulting: bool,
    write_combine: bool,
    inserted: Mutex<BTreeMap<usize, Pfn>>,
}

impl VmRegion {
    pub(crate) fn new(pages: usize, faulting: bool, write_combine: bool) -> Self {
        Self {
            pages,
            faulting,
            write_combine,
            inserted: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len_pages(&self) -> usize {
        self.pages
    }

    pub fn is_faulting(&self) -> bool {
        self.faulting
    }

    /// Non cached buffers are mapped write combined
    pub fn is_write_combine(&self) -> bool {
        self.write_combine
    }

    pub fn insert_pfn(&self, offset: usize, pfn: Pfn) -> IonResult<()> {
        if offset >= self.pages {
            return Err(IonError::InvalidArgument("page offset outside of the mapping"));
        }
        lock(&self.inserted).insert(offset, pfn);
        Ok(())
    }

    pub fn pfn_at(&self, offset: usize) -> Option<Pfn> {
        lock(&self.inserted).get(&offset).copied()
    }

    /// Number of pages currently backed
    pub fn resident_pages(&self) -> usize {
        lock(&self.inserted).len()
    }

    /// Drops every inserted page, the next access faults again
    pub(crate) fn zap(&self) {
        lock(&self.inserted).clear();
    }
}

/// A live user mapping of a buffer, unmapped when dropped.
///
/// Keeps the buffer alive like an open mapping keeps its file alive.
pub struct UserMapping {
    buffer: Arc<Buffer>,
    region: Arc<VmRegion>,
}

impl UserMapping {
    pub(crate) fn new(buffer: Arc<Buffer>, region: Arc<VmRegion>) -> Self {
        Self { buffer, region }
    }

    pub fn region(&self) -> &VmRegion {
        &self.region
    }

    /// Handles an access to a page that is not backed yet
    pub fn fault(&self, page: usize) -> IonResult<Pfn> {
        if let Some(pfn) = self.region.pfn_at(page) {
            return Ok(pfn);
        }
        if !self.region.is_faulting() {
            return Err(IonError::InvalidArgument("page offset outside of the mapping"));
        }
        self.buffer.fault(&self.region, page)
    }
}

impl fmt::Debug for UserMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMapping")
            .field("buffer", &self.buffer.id())
            .field("region", &self.region)
            .finish()
    }
}

impl Drop for UserMapping {
    fn drop(&mut self) {
        trace!("closing user mapping of buffer {}", self.buffer.id());
        self.buffer.vm_close(&self.region);
    }
}

#[cfg(test)]
mod test {
    use super::VmRegion;

    #[test]
    fn test_region_insert_and_zap() {
        let region = VmRegion::new(4, true, false);
        region.insert_pfn(0, 100).unwrap();
        region.insert_pfn(3, 103).unwrap();
        region.insert_pfn(4, 104).expect_err("offset is outside of the region");

        assert_eq!(region.resident_pages(), 2);
        assert_eq!(region.pfn_at(3), Some(103));

        region.zap();
        assert_eq!(region.resident_pages(), 0);
        assert_eq!(region.pfn_at(0), None);
    }
}

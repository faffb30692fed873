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

//! Share tokens: capabilities that hand a buffer to another client without
//! copying it, and the descriptor table that turns them into integers.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use log::{debug, trace, warn};

use crate::{
    buffer::Buffer,
    error::{IonError, IonResult},
    mapping::UserMapping,
    modules::heap::SegmentTable,
    types::{Descriptor, DmaDirection, PAGE_SIZE},
    util::{id_allocator::IdAllocator, lock, pages_of},
};

/// Operations an exporter provides for its shared buffers.
///
/// Every method but [`SharedBuffer::size`] and [`SharedBuffer::as_any`] is
/// optional.
pub trait SharedBuffer: Any + Send + Sync {
    fn size(&self) -> usize;

    /// Used to recognize which exporter produced a token
    fn as_any(&self) -> &dyn Any;

    /// Prepares the buffer for a device and returns its mapping table
    fn map_attachment(&self, _direction: DmaDirection) -> IonResult<SegmentTable> {
        Err(IonError::NotSupported("map_attachment"))
    }

    fn mmap(&self, _pages: usize) -> IonResult<UserMapping> {
        Err(IonError::NotSupported("mmap"))
    }

    fn begin_cpu_access(&self) -> IonResult<()> {
        Err(IonError::NotSupported("begin_cpu_access"))
    }

    fn end_cpu_access(&self) -> IonResult<()> {
        Err(IonError::NotSupported("end_cpu_access"))
    }

    /// Kernel address of `page`, only valid during CPU access
    fn kmap(&self, _page: usize) -> IonResult<usize> {
        Err(IonError::NotSupported("kmap"))
    }
}

/// A shared buffer, cloning it does not clone the buffer.
///
/// The exporter releases its buffer once the last clone is dropped.
#[derive(Clone)]
pub struct ShareToken {
    shared: Arc<dyn SharedBuffer>,
}

impl ShareToken {
    /// Wraps a buffer of any exporter
    pub fn from_exporter(shared: Arc<dyn SharedBuffer>) -> Self {
        Self { shared }
    }

    pub(crate) fn from_buffer(buffer: Arc<Buffer>) -> Self {
        Self {
            shared: Arc::new(IonShare { buffer }),
        }
    }

    /// The buffer, if this token was produced by this service
    pub(crate) fn ion_buffer(&self) -> Option<&Arc<Buffer>> {
        self.shared
            .as_any()
            .downcast_ref::<IonShare>()
            .map(|share| &share.buffer)
    }

    pub fn size(&self) -> usize {
        self.shared.size()
    }

    pub fn map_attachment(&self, direction: DmaDirection) -> IonResult<SegmentTable> {
        self.shared.map_attachment(direction)
    }

    pub fn mmap(&self, pages: usize) -> IonResult<UserMapping> {
        self.shared.mmap(pages)
    }

    pub fn begin_cpu_access(&self) -> IonResult<()> {
        self.shared.begin_cpu_access()
    }

    pub fn end_cpu_access(&self) -> IonResult<()> {
        self.shared.end_cpu_access()
    }

    pub fn kmap(&self, page: usize) -> IonResult<usize> {
        self.shared.kmap(page)
    }
}

impl fmt::Debug for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ShareToken");
        match self.ion_buffer() {
            Some(buffer) => debug.field("buffer", &buffer.id()),
            None => debug.field("foreign", &true),
        };
        debug.field("size", &self.size()).finish()
    }
}

/// Holds one reference on the buffer for all clones of a token
struct IonShare {
    buffer: Arc<Buffer>,
}

impl SharedBuffer for IonShare {
    fn size(&self) -> usize {
        self.buffer.size()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn map_attachment(&self, direction: DmaDirection) -> IonResult<SegmentTable> {
        self.buffer.sync_dirty_pages(direction);
        Ok(self.buffer.segment_table())
    }

    fn mmap(&self, pages: usize) -> IonResult<UserMapping> {
        self.buffer.mmap(pages)
    }

    fn begin_cpu_access(&self) -> IonResult<()> {
        self.buffer.kmap_get().map(|_| ())
    }

    fn end_cpu_access(&self) -> IonResult<()> {
        self.buffer.kmap_put()
    }

    fn kmap(&self, page: usize) -> IonResult<usize> {
        if page >= pages_of(self.buffer.size()) {
            return Err(IonError::InvalidArgument("page offset outside of the buffer"));
        }
        let vaddr = self
            .buffer
            .vaddr()
            .ok_or(IonError::InvalidArgument("buffer is not mapped for CPU access"))?;
        Ok(vaddr + page * PAGE_SIZE)
    }
}

impl Drop for IonShare {
    fn drop(&mut self) {
        trace!("released share of buffer {}", self.buffer.id());
    }
}

struct DescriptorState {
    open: BTreeMap<Descriptor, ShareToken>,
    ids: IdAllocator,
}

/// Open descriptors, each one keeps its token alive
pub(crate) struct DescriptorTable {
    state: Mutex<DescriptorState>,
    capacity: usize,
    /// highest descriptor number
    last: u32,
}

impl DescriptorTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_last(capacity, i32::MAX as u32)
    }

    fn with_last(capacity: usize, last: u32) -> Self {
        Self {
            state: Mutex::new(DescriptorState {
                open: BTreeMap::new(),
                ids: IdAllocator::with_last(0, last),
            }),
            capacity,
            last,
        }
    }

    /// On failure the token is dropped, which releases its buffer reference
    pub(crate) fn install(&self, token: ShareToken) -> IonResult<Descriptor> {
        let mut state = lock(&self.state);
        let id = if state.open.len() < self.capacity {
            state.ids.alloc()
        } else {
            None
        };

        let Some(id) = id else {
            warn!("descriptor table is full, {} descriptors open", state.open.len());
            drop(state);
            drop(token);
            return Err(IonError::TooManyDescriptors);
        };

        let descriptor = Descriptor(id as i32);
        state.open.insert(descriptor, token);
        debug!("installed descriptor {}", descriptor);
        Ok(descriptor)
    }

    pub(crate) fn get(&self, descriptor: Descriptor) -> IonResult<ShareToken> {
        lock(&self.state)
            .open
            .get(&descriptor)
            .cloned()
            .ok_or(IonError::BadDescriptor(descriptor))
    }

    pub(crate) fn close(&self, descriptor: Descriptor) -> IonResult<()> {
        let token = {
            let mut state = lock(&self.state);
            let token = state
                .open
                .remove(&descriptor)
                .ok_or(IonError::BadDescriptor(descriptor))?;
            state.ids.free(descriptor.0 as u32);
            token
        };
        // the last token clone may destroy the buffer, not under the table lock
        drop(token);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).open.len()
    }

    /// Closes every descriptor
    pub(crate) fn clear(&self) -> usize {
        let tokens = {
            let mut state = lock(&self.state);
            let tokens = std::mem::take(&mut state.open);
            state.ids = IdAllocator::with_last(0, self.last);
            tokens
        };
        tokens.len()
    }
}

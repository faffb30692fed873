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
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use log::{debug, error, trace, warn};

use crate::{
    error::{IonError, IonResult},
    mapping::{UserMapping, VmRegion},
    modules::{
        cache_sync::CacheSyncModule,
        heap::{HeapAllocation, HeapCapabilities, HeapModule, SegmentTable},
    },
    registered_heap::RegisteredHeap,
    types::{pfn_to_phys, AllocationFlags, BufferId, DmaDirection, HeapId, Pfn, TaskIdentity, PAGE_SIZE},
    util::{lock, pages_of},
};

/// One page of a buffer whose user mappings are faulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageEntry {
    pfn: Pfn,
    /// written through a user mapping since the last device sync
    dirty: bool,
}

#[derive(Debug)]
struct KernelMapping {
    vaddr: usize,
    count: usize,
}

struct BufferState {
    allocation: HeapAllocation,
    table: SegmentTable,
    /// only present if user mappings are faulted in
    pages: Option<Vec<PageEntry>>,
    kmap: Option<KernelMapping>,
    /// handles pointing at this buffer over all clients
    handle_count: usize,
    /// open faulting user mappings
    regions: Vec<Arc<VmRegion>>,
    /// last task that held a handle
    task: TaskIdentity,
    alloc_client: String,
}

/// What a buffer is created from
pub(crate) struct AllocationRequest<'a> {
    pub(crate) len: usize,
    pub(crate) align: usize,
    pub(crate) flags: AllocationFlags,
    /// keep the dma addresses the heap produced
    pub(crate) passthrough: bool,
    pub(crate) owner: &'a str,
}

/// Memory allocated from a heap, shared between handles and share tokens.
///
/// The buffer lives as long as an `Arc` to it exists. Dropping the last one
/// erases it from the device index and returns the memory to its heap,
/// possibly through the heap's deferred free list.
pub struct Buffer {
    id: BufferId,
    heap: Arc<RegisteredHeap>,
    size: usize,
    flags: AllocationFlags,
    index: Arc<BufferIndex>,
    cache: Arc<dyn CacheSyncModule>,
    state: Mutex<BufferState>,
}

impl Buffer {
    /// Allocates from `heap` and registers the buffer in `index`.
    ///
    /// Nothing is left allocated if this fails.
    pub(crate) fn create(
        heap: &Arc<RegisteredHeap>,
        request: &AllocationRequest<'_>,
        index: &Arc<BufferIndex>,
        cache: &Arc<dyn CacheSyncModule>,
    ) -> IonResult<Arc<Buffer>> {
        let module = heap.module();
        let allocation = module.allocate(request.len, request.align, request.flags)?;

        let mut table = match module.map_dma(&allocation) {
            Ok(table) => table,
            Err(err) => {
                module.free(allocation);
                return Err(err);
            }
        };

        let pages = if faults_user_mappings(request.flags) {
            let count = pages_of(request.len);
            let pages: Vec<PageEntry> = table
                .pfns()
                .take(count)
                .map(|pfn| PageEntry { pfn, dirty: false })
                .collect();

            if pages.len() < count {
                error!(
                    "heap {} returned a mapping table of {} pages for a {} page buffer",
                    module.name(),
                    pages.len(),
                    count
                );
                module.unmap_dma(&allocation);
                module.free(allocation);
                return Err(IonError::InvalidArgument("heap returned a short mapping table"));
            }
            Some(pages)
        } else {
            None
        };

        if !request.passthrough {
            // the only dma address space is the physical one
            for segment in table.segments_mut() {
                segment.dma_address = segment.phys;
            }
        }

        let buffer = Arc::new(Buffer {
            id: index.next_id(),
            heap: heap.clone(),
            size: request.len,
            flags: request.flags,
            index: index.clone(),
            cache: cache.clone(),
            state: Mutex::new(BufferState {
                allocation,
                table,
                pages,
                kmap: None,
                handle_count: 0,
                regions: Vec::new(),
                task: TaskIdentity::current(),
                alloc_client: request.owner.to_string(),
            }),
        });
        index.insert(&buffer);

        trace!(
            "created buffer {} of {} bytes on heap {}",
            buffer.id,
            buffer.size,
            module.name()
        );
        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> AllocationFlags {
        self.flags
    }

    pub fn heap_id(&self) -> HeapId {
        self.heap.id()
    }

    pub fn heap_name(&self) -> &str {
        self.heap.module().name()
    }

    pub(crate) fn module(&self) -> &dyn HeapModule {
        self.heap.module()
    }

    pub(crate) fn belongs_to(&self, index: &Arc<BufferIndex>) -> bool {
        Arc::ptr_eq(&self.index, index)
    }

    /// Cached buffers without explicit user sync track dirty pages through faults
    pub fn faults_user_mappings(&self) -> bool {
        faults_user_mappings(self.flags)
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.state).handle_count
    }

    /// Task that last held a handle to this buffer
    pub fn task(&self) -> TaskIdentity {
        lock(&self.state).task.clone()
    }

    /// Display name of the client that allocated the buffer
    pub fn alloc_client(&self) -> String {
        lock(&self.state).alloc_client.clone()
    }

    pub fn segment_table(&self) -> SegmentTable {
        lock(&self.state).table.clone()
    }

    pub fn kmap_count(&self) -> usize {
        lock(&self.state).kmap.as_ref().map(|kmap| kmap.count).unwrap_or(0)
    }

    pub(crate) fn vaddr(&self) -> Option<usize> {
        lock(&self.state).kmap.as_ref().map(|kmap| kmap.vaddr)
    }

    pub fn dirty_pages(&self) -> usize {
        lock(&self.state)
            .pages
            .as_ref()
            .map(|pages| pages.iter().filter(|page| page.dirty).count())
            .unwrap_or(0)
    }

    /// Number of open faulting user mappings
    pub fn user_mappings(&self) -> usize {
        lock(&self.state).regions.len()
    }

    pub(crate) fn add_to_handle(&self) {
        lock(&self.state).handle_count += 1;
    }

    pub(crate) fn remove_from_handle(&self) {
        let mut state = lock(&self.state);
        if state.handle_count == 0 {
            error!("buffer {} removed from more handles than it was added to", self.id);
            return;
        }

        state.handle_count -= 1;
        if state.handle_count == 0 {
            // the buffer is only reachable through share tokens from now on,
            // remember who had it last
            state.task = TaskIdentity::current();
        }
    }

    pub(crate) fn phys(&self) -> IonResult<(u64, usize)> {
        let module = self.module();
        if !module.capabilities().contains(HeapCapabilities::PHYS) {
            error!(
                "phys is not implemented by heap {} ({:?})",
                module.name(),
                module.heap_type()
            );
            return Err(IonError::NotSupported("phys"));
        }
        module.phys(&lock(&self.state).allocation)
    }

    /// Takes a kernel mapping reference, mapping the buffer on the first one
    pub(crate) fn kmap_get(&self) -> IonResult<usize> {
        let mut state = lock(&self.state);
        if let Some(kmap) = state.kmap.as_mut() {
            kmap.count += 1;
            return Ok(kmap.vaddr);
        }

        let vaddr = self.module().map_kernel(&state.allocation).map_err(|err| {
            debug!("mapping buffer {} into the kernel failed: {}", self.id, err);
            err
        })?;
        state.kmap = Some(KernelMapping { vaddr, count: 1 });
        Ok(vaddr)
    }

    /// Drops a kernel mapping reference, unmapping the buffer on the last one
    pub(crate) fn kmap_put(&self) -> IonResult<()> {
        let mut state = lock(&self.state);
        let Some(kmap) = state.kmap.as_mut() else {
            warn!("double unmap of buffer {} detected", self.id);
            return Err(IonError::DoubleRelease("buffer kernel mapping"));
        };

        kmap.count -= 1;
        if kmap.count == 0 {
            self.module().unmap_kernel(&state.allocation);
            state.kmap = None;
        }
        Ok(())
    }

    /// Maps the first `pages` pages of the buffer into a new user region
    pub(crate) fn mmap(self: &Arc<Self>, pages: usize) -> IonResult<UserMapping> {
        let module = self.module();
        if !module.capabilities().contains(HeapCapabilities::MAP_USER) {
            error!("heap {} does not support user mappings", module.name());
            return Err(IonError::NotSupported("map_user"));
        }
        if pages == 0 || pages > pages_of(self.size) {
            return Err(IonError::InvalidArgument("mapping length does not fit the buffer"));
        }

        if self.faults_user_mappings() {
            let region = Arc::new(VmRegion::new(pages, true, false));
            lock(&self.state).regions.push(region.clone());
            debug!("opened faulting user mapping of buffer {}", self.id);
            return Ok(UserMapping::new(self.clone(), region));
        }

        let write_combine = !self.flags.contains(AllocationFlags::CACHED);
        let region = Arc::new(VmRegion::new(pages, false, write_combine));
        {
            let state = lock(&self.state);
            module
                .map_user(&state.allocation, &state.table, &region)
                .map_err(|err| {
                    error!("failure mapping buffer {} to user space: {}", self.id, err);
                    err
                })?;
        }
        Ok(UserMapping::new(self.clone(), region))
    }

    /// Page fault in a faulting user mapping: marks the page dirty and maps it
    pub(crate) fn fault(&self, region: &VmRegion, page: usize) -> IonResult<Pfn> {
        let mut state = lock(&self.state);
        let pages = state
            .pages
            .as_mut()
            .ok_or(IonError::InvalidArgument("buffer does not fault in user mappings"))?;
        let entry = pages
            .get_mut(page)
            .ok_or(IonError::InvalidArgument("page offset outside of the buffer"))?;

        entry.dirty = true;
        let pfn = entry.pfn;
        region.insert_pfn(page, pfn)?;
        Ok(pfn)
    }

    pub(crate) fn vm_close(&self, region: &Arc<VmRegion>) {
        lock(&self.state)
            .regions
            .retain(|open| !Arc::ptr_eq(open, region));
    }

    /// Writes back every dirty page and zaps all faulting user mappings, so
    /// the next CPU access faults and marks its page dirty again.
    ///
    /// Returns the number of synced pages. Does nothing for buffers that do
    /// not fault in user mappings.
    pub(crate) fn sync_dirty_pages(&self, direction: DmaDirection) -> usize {
        if !self.faults_user_mappings() {
            return 0;
        }

        let mut state = lock(&self.state);
        let state = &mut *state;
        let mut synced = 0;
        if let Some(pages) = state.pages.as_mut() {
            for page in pages.iter_mut() {
                if page.dirty {
                    self.cache.sync_for_device(pfn_to_phys(page.pfn), PAGE_SIZE, direction);
                    synced += 1;
                }
                page.dirty = false;
            }
        }
        for region in state.regions.iter() {
            region.zap();
        }

        trace!("synced {} dirty pages of buffer {}", synced, self.id);
        synced
    }

    /// Syncs every segment of the buffer
    pub(crate) fn sync_segments(&self, direction: DmaDirection) {
        let state = lock(&self.state);
        for segment in state.table.segments() {
            self.cache.sync_for_device(segment.phys, segment.len, direction);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.index.remove(self.id);

        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let retired = RetiredBuffer {
            id: self.id,
            size: self.size,
            allocation: mem::take(&mut state.allocation),
            kmap_count: state.kmap.take().map(|kmap| kmap.count).unwrap_or(0),
        };

        self.heap.release(retired);
    }
}

fn faults_user_mappings(flags: AllocationFlags) -> bool {
    flags.contains(AllocationFlags::CACHED) && !flags.contains(AllocationFlags::CACHED_NEEDS_SYNC)
}

/// Heap memory of a buffer nobody references anymore
pub(crate) struct RetiredBuffer {
    id: BufferId,
    size: usize,
    allocation: HeapAllocation,
    kmap_count: usize,
}

impl RetiredBuffer {
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Unmaps and frees the memory
    pub(crate) fn destroy(self, module: &dyn HeapModule) {
        if self.kmap_count > 0 {
            warn!(
                "buffer {} destroyed while mapped into the kernel {} times",
                self.id, self.kmap_count
            );
            module.unmap_kernel(&self.allocation);
        }
        module.unmap_dma(&self.allocation);
        module.free(self.allocation);
        trace!("destroyed buffer {}", self.id);
    }
}

/// Every live buffer of a device by id
#[derive(Default)]
pub(crate) struct BufferIndex {
    buffers: Mutex<BTreeMap<BufferId, Weak<Buffer>>>,
    next_id: AtomicU64,
}

impl BufferIndex {
    fn next_id(&self) -> BufferId {
        BufferId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, buffer: &Arc<Buffer>) {
        let previous = lock(&self.buffers).insert(buffer.id, Arc::downgrade(buffer));
        debug_assert!(previous.is_none(), "buffer {} indexed twice", buffer.id);
    }

    fn remove(&self, id: BufferId) {
        if lock(&self.buffers).remove(&id).is_none() {
            error!("buffer {} was not indexed", id);
        }
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<Arc<Buffer>> {
        lock(&self.buffers).get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn contains(&self, id: BufferId) -> bool {
        lock(&self.buffers).contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Every indexed buffer that is still alive.
    ///
    /// The returned references must not be dropped while the index is locked,
    /// so they are collected first.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Buffer>> {
        let buffers = lock(&self.buffers);
        buffers.values().filter_map(Weak::upgrade).collect()
    }
}

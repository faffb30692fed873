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
    sync::{Arc, RwLock},
    time::Instant,
};

use log::{debug, error, info, trace, warn};
use static_assertions::assert_impl_all;

use crate::{
    buffer::{AllocationRequest, Buffer, BufferIndex},
    client::Client,
    config::IonConfig,
    error::{IonError, IonResult},
    modules::{
        cache_sync::{CacheSyncModule, NoopCacheSyncModule},
        heap::HeapModule,
    },
    registered_heap::RegisteredHeap,
    share::{DescriptorTable, ShareToken},
    types::{AllocationFlags, BufferId, ClientId, Descriptor, DmaDirection, HeapId, HeapType, TaskIdentity, PAGE_SIZE},
    util::{read, write},
};

assert_impl_all!(Device: Send, Sync);
assert_impl_all!(Buffer: Send, Sync);
assert_impl_all!(ShareToken: Send, Sync);

struct ClientRecord {
    name: String,
    serial: u32,
    task: TaskIdentity,
}

struct Registry {
    /// sorted by descending id, which is the order they are tried in
    heaps: Vec<Arc<RegisteredHeap>>,
    clients: BTreeMap<ClientId, ClientRecord>,
    next_client_id: u64,
}

/// A live client as listed by [`Device::clients`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub display_name: String,
    /// task that created the client
    pub task: TaskIdentity,
}

/// A buffer no handle points at anymore, only share tokens keep it alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedBuffer {
    pub id: BufferId,
    pub size: usize,
    pub heap: String,
    /// last task that held a handle to it
    pub task: TaskIdentity,
}

/// The allocation service: registered heaps, clients and every live buffer.
///
/// Created once and shared through an `Arc`, every client keeps the device alive.
pub struct Device {
    config: IonConfig,
    registry: RwLock<Registry>,
    buffers: Arc<BufferIndex>,
    descriptors: DescriptorTable,
    cache: Arc<dyn CacheSyncModule>,
}

impl Device {
    pub fn new(config: IonConfig) -> Arc<Self> {
        Self::with_cache_sync(config, Arc::new(NoopCacheSyncModule))
    }

    pub fn with_cache_sync(config: IonConfig, cache: Arc<dyn CacheSyncModule>) -> Arc<Self> {
        let descriptors = DescriptorTable::new(config.max_descriptors);
        Arc::new(Self {
            config,
            registry: RwLock::new(Registry {
                heaps: Vec::new(),
                clients: BTreeMap::new(),
                next_client_id: 0,
            }),
            buffers: Arc::new(BufferIndex::default()),
            descriptors,
            cache,
        })
    }

    pub fn config(&self) -> &IonConfig {
        &self.config
    }

    /// Registers a heap. Its id is also its priority, higher ids are tried first.
    pub fn add_heap(&self, id: HeapId, module: Arc<dyn HeapModule>) -> IonResult<()> {
        if id.0 >= u32::BITS {
            return Err(IonError::InvalidArgument("heap id does not fit into a heap mask"));
        }

        let mut registry = write(&self.registry);
        if registry.heaps.iter().any(|heap| heap.id() == id) {
            return Err(IonError::InvalidArgument("heap id is already registered"));
        }

        let heap = Arc::new(RegisteredHeap::new(
            id,
            module,
            self.config.deferred_free_worker,
        ));
        info!(
            "registered heap {} ({:?}) with id {}{}",
            heap.module().name(),
            heap.module().heap_type(),
            id,
            if heap.defers_free() { ", deferred free" } else { "" }
        );

        let position = registry
            .heaps
            .iter()
            .position(|other| other.id() < id)
            .unwrap_or(registry.heaps.len());
        registry.heaps.insert(position, heap);
        Ok(())
    }

    /// Ids of all registered heaps in the order they are tried
    pub fn heap_ids(&self) -> Vec<HeapId> {
        read(&self.registry).heaps.iter().map(|heap| heap.id()).collect()
    }

    fn heap(&self, id: HeapId) -> IonResult<Arc<RegisteredHeap>> {
        read(&self.registry)
            .heaps
            .iter()
            .find(|heap| heap.id() == id)
            .cloned()
            .ok_or(IonError::NoSuchHeap { mask: id.mask() })
    }

    /// Creates a client named `name`, its display name gets a serial that
    /// is unique among the live clients of that name.
    pub fn create_client(self: &Arc<Self>, name: &str) -> IonResult<Client> {
        if name.is_empty() {
            error!("client name cannot be empty");
            return Err(IonError::InvalidArgument("client name cannot be empty"));
        }

        let task = TaskIdentity::current();
        let (id, serial) = {
            let mut registry = write(&self.registry);
            let serial = registry
                .clients
                .values()
                .filter(|client| client.name == name)
                .map(|client| client.serial + 1)
                .max()
                .unwrap_or(0);

            let id = ClientId(registry.next_client_id);
            registry.next_client_id += 1;
            registry.clients.insert(
                id,
                ClientRecord {
                    name: name.to_string(),
                    serial,
                    task: task.clone(),
                },
            );
            (id, serial)
        };

        debug!("created client {}-{} for {}", name, serial, task);
        Ok(Client::new(self.clone(), id, name, serial, task))
    }

    pub(crate) fn remove_client(&self, id: ClientId) {
        if write(&self.registry).clients.remove(&id).is_none() {
            error!("client {} was not registered", id);
        }
    }

    /// Every live client, ordered by creation
    pub fn clients(&self) -> Vec<ClientInfo> {
        read(&self.registry)
            .clients
            .iter()
            .map(|(id, client)| ClientInfo {
                id: *id,
                display_name: format!("{}-{}", client.name, client.serial),
                task: client.task.clone(),
            })
            .collect()
    }

    /// Display names of all live clients
    pub fn client_names(&self) -> Vec<String> {
        self.clients()
            .into_iter()
            .map(|client| client.display_name)
            .collect()
    }

    /// Tries every heap selected by `heap_mask` in priority order and
    /// returns the first buffer one of them could allocate.
    pub(crate) fn allocate_buffer(
        &self,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: AllocationFlags,
        owner: &str,
    ) -> IonResult<Arc<Buffer>> {
        trace!(
            "allocate(len {}, align {}, heap_mask {:#x}, flags {:?})",
            len,
            align,
            heap_mask,
            flags
        );

        let passthrough = self
            .config
            .passthrough_heap_id
            .is_some_and(|id| id.mask() == heap_mask);
        let len = if passthrough {
            len
        } else {
            len.checked_next_multiple_of(PAGE_SIZE)
                .ok_or(IonError::InvalidArgument("length overflows when page aligned"))?
        };

        if len == 0 {
            warn!("allocation length cannot be zero");
            return Err(IonError::InvalidArgument("length cannot be zero"));
        }
        if let Some(max) = self.config.max_allocation_size {
            if len > max {
                warn!("allocation of {} bytes is above the limit of {} bytes", len, max);
                return Err(IonError::InvalidArgument("length is above the allocation limit"));
            }
        }
        if align != 0 && !align.is_power_of_two() {
            warn!("allocation alignment {:#x} is not a power of two", align);
            return Err(IonError::InvalidArgument("alignment is not a power of two"));
        }
        if let Some(max) = self.config.max_allocation_size {
            if align > max {
                warn!("allocation alignment {:#x} is above the limit of {} bytes", align, max);
                return Err(IonError::InvalidArgument("alignment is above the allocation limit"));
            }
        }

        let request = AllocationRequest {
            len,
            align,
            flags,
            passthrough,
            owner,
        };

        let start = Instant::now();
        let mut matched = false;
        let mut result = None;
        {
            let registry = read(&self.registry);
            for heap in registry.heaps.iter().filter(|heap| heap.id().mask() & heap_mask != 0) {
                matched = true;
                match self.create_on(heap, &request) {
                    Ok(buffer) => {
                        result = Some(buffer);
                        break;
                    }
                    Err(err) => debug!("heap {} could not allocate {} bytes: {}", heap.module().name(), len, err),
                }
            }
        }

        let buffer = match result {
            Some(buffer) => buffer,
            None if !matched => return Err(IonError::NoSuchHeap { mask: heap_mask }),
            None => return Err(IonError::ResourceExhausted { len }),
        };

        let elapsed = start.elapsed();
        if elapsed > self.config.slow_allocation_threshold {
            warn!(
                "allocation of {} bytes from heap {} took {} ms",
                buffer.size(),
                buffer.heap_name(),
                elapsed.as_millis()
            );
        }
        Ok(buffer)
    }

    /// One heap of the walk. Deferred free heaps are drained and retried once
    /// if the failure may go away with more memory.
    fn create_on(&self, heap: &Arc<RegisteredHeap>, request: &AllocationRequest<'_>) -> IonResult<Arc<Buffer>> {
        match Buffer::create(heap, request, &self.buffers, &self.cache) {
            Err(err) if heap.defers_free() && err.is_transient() => {
                let drained = heap.drain(0);
                debug!(
                    "retrying on heap {} after draining {} deferred bytes ({})",
                    heap.module().name(),
                    drained,
                    err
                );
                Buffer::create(heap, request, &self.buffers, &self.cache)
            }
            result => result,
        }
    }

    /// Turns a share token into a descriptor. If that fails, the token is
    /// released.
    pub fn install_descriptor(&self, token: ShareToken) -> IonResult<Descriptor> {
        self.descriptors.install(token)
    }

    /// The token behind an open descriptor
    pub fn descriptor(&self, descriptor: Descriptor) -> IonResult<ShareToken> {
        self.descriptors.get(descriptor)
    }

    pub fn close_descriptor(&self, descriptor: Descriptor) -> IonResult<()> {
        self.descriptors.close(descriptor)
    }

    pub fn open_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    /// Makes CPU writes to the buffer behind `descriptor` visible to devices.
    ///
    /// Buffers that fault in user mappings only sync their dirty pages and
    /// zap every user mapping, all other buffers sync every segment.
    /// Framebuffer heaps are not synced.
    pub fn sync_for_device(&self, descriptor: Descriptor) -> IonResult<()> {
        let token = self.descriptors.get(descriptor)?;
        let buffer = self.own_buffer(&token).map_err(|err| {
            error!("cannot sync descriptor {}: {}", descriptor, err);
            err
        })?;

        if buffer.module().heap_type() == HeapType::Framebuffer {
            error!(
                "cannot sync buffer {} of framebuffer heap {}",
                buffer.id(),
                buffer.heap_name()
            );
            return Ok(());
        }

        if buffer.faults_user_mappings() {
            buffer.sync_dirty_pages(DmaDirection::Bidirectional);
        } else {
            buffer.sync_segments(DmaDirection::Bidirectional);
        }
        Ok(())
    }

    /// The buffer of a token this device exported
    pub(crate) fn own_buffer<'a>(&self, token: &'a ShareToken) -> IonResult<&'a Arc<Buffer>> {
        match token.ion_buffer() {
            Some(buffer) if buffer.belongs_to(&self.buffers) => Ok(buffer),
            _ => Err(IonError::ForeignToken),
        }
    }

    /// Frees every deferred buffer of a heap, returns the freed bytes
    pub fn drain_deferred(&self, id: HeapId) -> IonResult<usize> {
        Ok(self.heap(id)?.drain(0))
    }

    /// Bytes waiting on the deferred free list of a heap
    pub fn deferred_size(&self, id: HeapId) -> IonResult<usize> {
        Ok(self.heap(id)?.deferred_size())
    }

    /// Buffers waiting on the deferred free list of a heap
    pub fn deferred_buffers(&self, id: HeapId) -> IonResult<usize> {
        Ok(self.heap(id)?.deferred_len())
    }

    /// Memory pressure callback of a heap, see [`HeapModule::shrink`]
    pub fn shrink(&self, id: HeapId, nr_to_scan: usize) -> IonResult<usize> {
        Ok(self.heap(id)?.shrink(nr_to_scan))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn contains_buffer(&self, id: BufferId) -> bool {
        self.buffers.contains(id)
    }

    /// References keeping a buffer alive: one per handle and one per
    /// exported share (shared by all its clones)
    pub fn buffer_ref_count(&self, id: BufferId) -> Option<usize> {
        let buffer = self.buffers.get(id)?;
        Some(Arc::strong_count(&buffer) - 1)
    }

    /// Buffers no handle points at
    pub fn orphaned_buffers(&self) -> Vec<OrphanedBuffer> {
        self.buffers
            .snapshot()
            .iter()
            .filter(|buffer| buffer.handle_count() == 0)
            .map(|buffer| OrphanedBuffer {
                id: buffer.id(),
                size: buffer.size(),
                heap: buffer.heap_name().to_string(),
                task: buffer.task(),
            })
            .collect()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let buffers = self.buffers.snapshot();
        for buffer in buffers.iter() {
            warn!(
                "buffer {} of {} bytes on heap {} is still alive at teardown, last held by {}",
                buffer.id(),
                buffer.size(),
                buffer.heap_name(),
                buffer.task()
            );
        }
        drop(buffers);

        let closed = self.descriptors.clear();
        if closed > 0 {
            warn!("closed {} descriptors at teardown", closed);
        }
    }
}

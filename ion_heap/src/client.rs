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

use log::{debug, error, trace, warn};
use static_assertions::assert_impl_all;

use crate::{
    buffer::Buffer,
    device::Device,
    error::{IonError, IonResult},
    modules::heap::{HeapCapabilities, SegmentTable},
    share::ShareToken,
    types::{AllocationFlags, BufferId, ClientId, Descriptor, HandleId, TaskIdentity},
    util::{id_allocator::IdAllocator, lock, now_ms},
};

assert_impl_all!(Client: Send, Sync);

/// Debug information kept per handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleDebug {
    /// Last time the handle was handed to a caller, in ms since the epoch
    pub user_ts: u64,
    /// Last descriptor the handle was exported to or imported from
    pub descriptor: Option<Descriptor>,
}

/// Reference counts of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRefs {
    /// Keeps the handle alive
    pub ref_count: u32,
    /// References granted to callers outside of the service, all of them
    /// together hold one `ref_count`
    pub user_ref_count: u32,
    pub kmap_count: u32,
}

struct HandleEntry {
    buffer: Arc<Buffer>,
    refs: HandleRefs,
    debug: HandleDebug,
}

struct ClientState {
    handles: BTreeMap<HandleId, HandleEntry>,
    /// same handles as `handles`, keyed by their buffer
    by_buffer: BTreeMap<BufferId, HandleId>,
    ids: IdAllocator,
}

impl ClientState {
    fn entry(&self, id: HandleId) -> IonResult<&HandleEntry> {
        self.handles.get(&id).ok_or(IonError::InvalidHandle(id))
    }

    fn entry_mut(&mut self, id: HandleId) -> IonResult<&mut HandleEntry> {
        self.handles.get_mut(&id).ok_or(IonError::InvalidHandle(id))
    }

    /// Adds a handle with one reference
    fn insert(&mut self, buffer: &Arc<Buffer>) -> IonResult<HandleId> {
        let id = HandleId(self.ids.alloc().ok_or(IonError::Overflow)?);

        if let Some(existing) = self.by_buffer.insert(buffer.id(), id) {
            error!("buffer {} already has handle {} in this client", buffer.id(), existing);
        }
        buffer.add_to_handle();
        self.handles.insert(
            id,
            HandleEntry {
                buffer: buffer.clone(),
                refs: HandleRefs {
                    ref_count: 1,
                    user_ref_count: 0,
                    kmap_count: 0,
                },
                debug: HandleDebug {
                    user_ts: now_ms(),
                    descriptor: None,
                },
            },
        );
        Ok(id)
    }

    fn get(&mut self, id: HandleId) -> IonResult<()> {
        let refs = &mut self.entry_mut(id)?.refs;
        refs.ref_count = refs.ref_count.checked_add(1).ok_or(IonError::Overflow)?;
        Ok(())
    }

    /// Drops one reference. Returns the buffer of the handle if this destroyed it,
    /// it has to be dropped once the client is unlocked.
    #[must_use]
    fn put(&mut self, id: HandleId) -> IonResult<Option<Arc<Buffer>>> {
        let refs = &mut self.entry_mut(id)?.refs;
        refs.ref_count -= 1;
        if refs.ref_count > 0 {
            return Ok(None);
        }
        Ok(self.destroy(id))
    }

    fn user_get(&mut self, id: HandleId) -> IonResult<()> {
        let refs = &mut self.entry_mut(id)?.refs;
        let user_ref_count = refs.user_ref_count.checked_add(1).ok_or(IonError::Overflow)?;
        if refs.user_ref_count == 0 {
            // the first user reference holds a handle reference
            refs.ref_count = refs.ref_count.checked_add(1).ok_or(IonError::Overflow)?;
        }
        refs.user_ref_count = user_ref_count;
        Ok(())
    }

    #[must_use]
    fn user_put(&mut self, id: HandleId) -> IonResult<Option<Arc<Buffer>>> {
        let refs = &mut self.entry_mut(id)?.refs;
        if refs.user_ref_count == 0 {
            warn!("user does not have access to handle {}", id);
            return Err(IonError::DoubleRelease("user reference"));
        }

        refs.user_ref_count -= 1;
        if refs.user_ref_count > 0 {
            return Ok(None);
        }
        self.put(id)
    }

    #[cfg(test)]
    fn preset_refs(&mut self, id: HandleId, ref_count: u32, user_ref_count: u32) -> IonResult<()> {
        let refs = &mut self.entry_mut(id)?.refs;
        refs.ref_count = ref_count;
        refs.user_ref_count = user_ref_count;
        Ok(())
    }

    /// Removes a handle no matter how many references it has left
    fn destroy(&mut self, id: HandleId) -> Option<Arc<Buffer>> {
        let entry = self.handles.remove(&id)?;
        self.by_buffer.remove(&entry.buffer.id());
        self.ids.free(id.0);

        if entry.refs.kmap_count > 0 {
            if let Err(err) = entry.buffer.kmap_put() {
                error!("handle {} was mapped but its buffer was not: {}", id, err);
            }
        }
        entry.buffer.remove_from_handle();

        trace!("destroyed handle {} of buffer {}", id, entry.buffer.id());
        Some(entry.buffer)
    }
}

/// An isolation domain owning handles to buffers.
///
/// Handles are dense ids starting at 1 that are only valid in the client
/// that created them. Dropping the client destroys all of its handles.
pub struct Client {
    device: Arc<Device>,
    id: ClientId,
    name: String,
    display_name: String,
    task: TaskIdentity,
    state: Mutex<ClientState>,
}

impl Client {
    pub(crate) fn new(device: Arc<Device>, id: ClientId, name: &str, serial: u32, task: TaskIdentity) -> Self {
        Self {
            device,
            id,
            name: name.to_string(),
            display_name: format!("{}-{}", name, serial),
            task,
            state: Mutex::new(ClientState {
                handles: BTreeMap::new(),
                by_buffer: BTreeMap::new(),
                ids: IdAllocator::new(1),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name with the serial that tells clients of the same name apart
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn task(&self) -> &TaskIdentity {
        &self.task
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocates a buffer and returns a handle with one reference
    pub fn alloc(&self, len: usize, align: usize, heap_mask: u32, flags: AllocationFlags) -> IonResult<HandleId> {
        self.alloc_handle(len, align, heap_mask, flags, false)
    }

    /// With `grab` the handle starts with two references, so it survives
    /// until the caller is done with it even if it is freed concurrently.
    pub(crate) fn alloc_handle(
        &self,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: AllocationFlags,
        grab: bool,
    ) -> IonResult<HandleId> {
        let buffer = self
            .device
            .allocate_buffer(len, align, heap_mask, flags, &self.display_name)?;

        let mut state = lock(&self.state);
        let id = state.insert(&buffer)?;
        if grab {
            state.get(id)?;
        }

        trace!("client {} allocated buffer {} as handle {}", self.display_name, buffer.id(), id);
        Ok(id)
    }

    /// Drops the reference returned by [`Client::alloc`] or [`Client::import`]
    pub fn free(&self, handle: HandleId) -> IonResult<()> {
        let released = lock(&self.state).put(handle).map_err(|err| {
            error!("invalid handle {} passed to free by client {}", handle, self.display_name);
            err
        })?;
        drop(released);
        Ok(())
    }

    /// Takes another reference on a handle
    pub fn handle_get(&self, handle: HandleId) -> IonResult<()> {
        lock(&self.state).get(handle)
    }

    pub fn handle_put(&self, handle: HandleId) -> IonResult<()> {
        let released = lock(&self.state).put(handle)?;
        drop(released);
        Ok(())
    }

    /// Turns one handle reference the caller holds into a user reference
    pub(crate) fn pass_to_user(&self, handle: HandleId) -> IonResult<()> {
        let mut state = lock(&self.state);
        let result = state.user_get(handle);
        // the handle is not destroyed, the user reference holds one reference now
        // or the caller's reference is still there
        let released = state.put(handle)?;
        drop(state);
        drop(released);
        result
    }

    /// Drops a user reference, rejected if the user holds none
    pub(crate) fn user_free(&self, handle: HandleId) -> IonResult<()> {
        let mut state = lock(&self.state);
        state.get(handle).map_err(|err| {
            error!("invalid handle {} passed to free by client {}", handle, self.display_name);
            err
        })?;

        let result = state.user_put(handle);
        let released = match state.put(handle) {
            Ok(released) => released,
            Err(err) => {
                error!("handle {} vanished while it was referenced: {}", handle, err);
                None
            }
        };
        drop(state);
        drop(released);

        result.map(drop)
    }

    /// Maps the buffer into the kernel and returns its address.
    ///
    /// The first mapping of a handle maps the buffer unless another handle
    /// already did.
    pub fn map_kernel(&self, handle: HandleId) -> IonResult<usize> {
        let mut state = lock(&self.state);
        let entry = state.entry_mut(handle).map_err(|err| {
            error!("invalid handle {} passed to map_kernel", handle);
            err
        })?;

        if !entry
            .buffer
            .module()
            .capabilities()
            .contains(HeapCapabilities::MAP_KERNEL)
        {
            error!("map_kernel is not implemented by heap {}", entry.buffer.heap_name());
            return Err(IonError::NotSupported("map_kernel"));
        }

        if entry.refs.kmap_count > 0 {
            let kmap_count = entry.refs.kmap_count.checked_add(1).ok_or(IonError::Overflow)?;
            let vaddr = entry
                .buffer
                .vaddr()
                .ok_or(IonError::InvalidArgument("buffer lost its kernel mapping"))?;
            entry.refs.kmap_count = kmap_count;
            return Ok(vaddr);
        }

        let vaddr = entry.buffer.kmap_get()?;
        entry.refs.kmap_count = 1;
        Ok(vaddr)
    }

    pub fn unmap_kernel(&self, handle: HandleId) -> IonResult<()> {
        let mut state = lock(&self.state);
        let entry = state.entry_mut(handle).map_err(|err| {
            error!("invalid handle {} passed to unmap_kernel", handle);
            err
        })?;

        if entry.refs.kmap_count == 0 {
            warn!("double unmap of handle {} detected", handle);
            return Err(IonError::DoubleRelease("handle kernel mapping"));
        }

        entry.refs.kmap_count -= 1;
        if entry.refs.kmap_count == 0 {
            entry.buffer.kmap_put()?;
        }
        Ok(())
    }

    /// Physical address and length, only for heaps that support it
    pub fn phys(&self, handle: HandleId) -> IonResult<(u64, usize)> {
        let buffer = self.buffer(handle).map_err(|err| {
            error!("invalid handle {} passed to phys", handle);
            err
        })?;
        buffer.phys()
    }

    pub fn segment_table(&self, handle: HandleId) -> IonResult<SegmentTable> {
        Ok(self.buffer(handle)?.segment_table())
    }

    /// The buffer behind a handle
    pub fn buffer(&self, handle: HandleId) -> IonResult<Arc<Buffer>> {
        Ok(lock(&self.state).entry(handle)?.buffer.clone())
    }

    pub fn handle_refs(&self, handle: HandleId) -> IonResult<HandleRefs> {
        Ok(lock(&self.state).entry(handle)?.refs)
    }

    /// Overwrites the reference counts of a handle
    #[cfg(test)]
    pub(crate) fn preset_handle_refs(&self, handle: HandleId, ref_count: u32, user_ref_count: u32) -> IonResult<()> {
        lock(&self.state).preset_refs(handle, ref_count, user_ref_count)
    }

    pub fn handle_debug(&self, handle: HandleId) -> IonResult<HandleDebug> {
        Ok(lock(&self.state).entry(handle)?.debug)
    }

    /// Handle of a buffer in this client, if there is one
    pub fn handle_for_buffer(&self, buffer: BufferId) -> Option<HandleId> {
        lock(&self.state).by_buffer.get(&buffer).copied()
    }

    pub fn handle_ids(&self) -> Vec<HandleId> {
        lock(&self.state).handles.keys().copied().collect()
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// Exports the buffer of a handle. The token holds a buffer reference
    /// until its last clone is dropped.
    pub fn share(&self, handle: HandleId) -> IonResult<ShareToken> {
        let buffer = self.buffer(handle).map_err(|err| {
            error!("invalid handle {} passed to share", handle);
            err
        })?;
        debug!("client {} shares buffer {}", self.display_name, buffer.id());
        Ok(ShareToken::from_buffer(buffer))
    }

    /// Exports the buffer of a handle as a descriptor
    pub fn share_descriptor(&self, handle: HandleId) -> IonResult<Descriptor> {
        let token = self.share(handle)?;
        let descriptor = self.device.install_descriptor(token)?;

        if let Ok(entry) = lock(&self.state).entry_mut(handle) {
            entry.debug.descriptor = Some(descriptor);
        }
        Ok(descriptor)
    }

    /// Imports the buffer behind a descriptor.
    ///
    /// If this client already has a handle to the buffer, that handle gets
    /// another reference instead of creating a second one.
    pub fn import(&self, descriptor: Descriptor) -> IonResult<HandleId> {
        let token = self.device.descriptor(descriptor)?;
        let handle = self.import_token(&token)?;

        if let Ok(entry) = lock(&self.state).entry_mut(handle) {
            entry.debug.descriptor = Some(descriptor);
        }
        Ok(handle)
    }

    /// Imports a share token, see [`Client::import`]
    pub fn import_token(&self, token: &ShareToken) -> IonResult<HandleId> {
        let buffer = self.device.own_buffer(token).map_err(|err| {
            error!("client {} cannot import a token of another exporter", self.display_name);
            err
        })?;

        let mut state = lock(&self.state);
        let handle = match state.by_buffer.get(&buffer.id()).copied() {
            Some(existing) => {
                state.get(existing)?;
                existing
            }
            None => state.insert(buffer)?,
        };
        state.entry_mut(handle)?.debug.user_ts = now_ms();

        trace!("client {} imported buffer {} as handle {}", self.display_name, buffer.id(), handle);
        Ok(handle)
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("task", &self.task)
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let ids: Vec<HandleId> = state.handles.keys().copied().collect();
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(entry) = state.entry(id) {
                warn!(
                    "destroying handle {} of client {}: buffer {} of {} bytes, {} refs, {} user refs, {} kernel maps",
                    id,
                    self.display_name,
                    entry.buffer.id(),
                    entry.buffer.size(),
                    entry.refs.ref_count,
                    entry.refs.user_ref_count,
                    entry.buffer.kmap_count()
                );
            }
            released.extend(state.destroy(id));
        }
        debug_assert!(state.by_buffer.is_empty());
        drop(released);

        self.device.remove_client(self.id);
        debug!("destroyed client {}", self.display_name);
    }
}

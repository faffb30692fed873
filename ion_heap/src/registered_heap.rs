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
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use log::{debug, warn};

use crate::{
    buffer::RetiredBuffer,
    deferred_free::DeferredFreeList,
    modules::heap::HeapModule,
    types::{HeapFlags, HeapId, PAGE_SIZE},
    util::lock,
};

/// A heap module registered with a device
pub(crate) struct RegisteredHeap {
    id: HeapId,
    module: Arc<dyn HeapModule>,
    /// only for heaps with [`HeapFlags::DEFER_FREE`]
    free_list: Option<Arc<DeferredFreeList>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RegisteredHeap {
    pub(crate) fn new(id: HeapId, module: Arc<dyn HeapModule>, spawn_worker: bool) -> Self {
        let free_list = module
            .flags()
            .contains(HeapFlags::DEFER_FREE)
            .then(|| Arc::new(DeferredFreeList::new(module.clone())));

        let worker = match free_list.as_ref() {
            Some(list) if spawn_worker => match list.spawn_worker() {
                Ok(worker) => Some(worker),
                Err(err) => {
                    warn!(
                        "could not start the deferred free worker of {}, buffers are freed on drain only: {}",
                        module.name(),
                        err
                    );
                    None
                }
            },
            _ => None,
        };

        Self {
            id,
            module,
            free_list,
            worker: Mutex::new(worker),
        }
    }

    pub(crate) fn id(&self) -> HeapId {
        self.id
    }

    pub(crate) fn module(&self) -> &dyn HeapModule {
        self.module.as_ref()
    }

    pub(crate) fn defers_free(&self) -> bool {
        self.free_list.is_some()
    }

    /// Destroys the buffer now or queues it on the free list
    pub(crate) fn release(&self, buffer: RetiredBuffer) {
        match self.free_list.as_ref() {
            Some(list) => list.add(buffer),
            None => buffer.destroy(self.module()),
        }
    }

    /// Frees deferred buffers, see [`DeferredFreeList::drain`]
    pub(crate) fn drain(&self, size: usize) -> usize {
        self.free_list
            .as_ref()
            .map(|list| list.drain(size))
            .unwrap_or(0)
    }

    pub(crate) fn deferred_size(&self) -> usize {
        self.free_list.as_ref().map(|list| list.size()).unwrap_or(0)
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.free_list.as_ref().map(|list| list.len()).unwrap_or(0)
    }

    /// Memory pressure callback.
    ///
    /// With `nr_to_scan == 0` returns how many pages could be reclaimed.
    /// Otherwise frees up to `nr_to_scan` pages, from the free list first,
    /// and returns how many were freed.
    pub(crate) fn shrink(&self, nr_to_scan: usize) -> usize {
        if nr_to_scan == 0 {
            return self.deferred_size() / PAGE_SIZE + self.module.shrink(0);
        }

        let freed = self
            .free_list
            .as_ref()
            .map(|list| list.shrink(nr_to_scan * PAGE_SIZE) / PAGE_SIZE)
            .unwrap_or(0);
        if freed >= nr_to_scan {
            return freed;
        }

        freed + self.module.shrink(nr_to_scan - freed)
    }
}

impl Drop for RegisteredHeap {
    fn drop(&mut self) {
        let Some(list) = self.free_list.as_ref() else {
            return;
        };

        list.shutdown();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                warn!("deferred free worker of {} panicked", self.module.name());
            }
        }

        let drained = list.drain(0);
        debug!("heap {} unregistered, freed {} deferred bytes", self.module.name(), drained);
    }
}

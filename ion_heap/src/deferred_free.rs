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
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use log::{debug, trace};
use try_lock::TryLock;

use crate::{buffer::RetiredBuffer, modules::heap::HeapModule, util::lock};

struct FreeListState {
    buffers: VecDeque<RetiredBuffer>,
    /// bytes waiting to be freed
    size: usize,
    shutdown: bool,
}

/// Buffers of a deferred free heap waiting to be returned to the heap.
///
/// Freed by a background worker, by an explicit drain or by the shrinker.
pub(crate) struct DeferredFreeList {
    module: Arc<dyn HeapModule>,
    state: Mutex<FreeListState>,
    wake: Condvar,
    /// held while the shrinker drains, concurrent shrinkers back off
    shrinking: TryLock<()>,
}

impl DeferredFreeList {
    pub(crate) fn new(module: Arc<dyn HeapModule>) -> Self {
        Self {
            module,
            state: Mutex::new(FreeListState {
                buffers: VecDeque::new(),
                size: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            shrinking: TryLock::new(()),
        }
    }

    pub(crate) fn add(&self, buffer: RetiredBuffer) {
        let mut state = lock(&self.state);
        state.size += buffer.size();
        state.buffers.push_back(buffer);
        self.wake.notify_one();
    }

    pub(crate) fn size(&self) -> usize {
        lock(&self.state).size
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).buffers.len()
    }

    /// Frees buffers until at least `size` bytes were freed or the list is
    /// empty. A `size` of 0 frees everything. Returns the freed bytes.
    pub(crate) fn drain(&self, size: usize) -> usize {
        let mut state = lock(&self.state);
        let target = if size == 0 { state.size } else { size };
        let mut drained = 0;

        while drained < target {
            let Some(buffer) = state.buffers.pop_front() else {
                break;
            };
            state.size -= buffer.size();
            drained += buffer.size();

            // the heap may block, do not hold the list meanwhile
            drop(state);
            buffer.destroy(self.module.as_ref());
            state = lock(&self.state);
        }

        if drained > 0 {
            debug!("drained {} bytes from the free list of {}", drained, self.module.name());
        }
        drained
    }

    /// Drain for the shrinker, never waits for another shrinker
    pub(crate) fn shrink(&self, size: usize) -> usize {
        let Some(_shrinking) = self.shrinking.try_lock() else {
            trace!("free list of {} is already being shrunk", self.module.name());
            return 0;
        };
        self.drain(size)
    }

    /// Starts the background worker freeing every added buffer
    pub(crate) fn spawn_worker(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let list = self.clone();
        thread::Builder::new()
            .name(format!("{}-deferred-free", self.module.name()))
            .spawn(move || list.run_worker())
    }

    fn run_worker(&self) {
        loop {
            let buffer = {
                let mut state = lock(&self.state);
                loop {
                    if let Some(buffer) = state.buffers.pop_front() {
                        state.size -= buffer.size();
                        break buffer;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = self
                        .wake
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            };
            buffer.destroy(self.module.as_ref());
        }
    }

    /// Lets the worker exit once the list is empty
    pub(crate) fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.wake.notify_all();
    }
}

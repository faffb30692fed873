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

pub(crate) mod bit_array;
pub(crate) mod id_allocator;
mod reserved_memory;

use std::{
    sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::types::{PAGE_SHIFT, PAGE_SIZE};

pub use reserved_memory::ReservedMemory;

/// Smallest order so that `PAGE_SIZE << order >= size`
pub(crate) fn get_order(size: usize) -> u32 {
    if size <= PAGE_SIZE {
        return 0;
    }
    let pages = size.div_ceil(PAGE_SIZE);
    usize::BITS - (pages - 1).leading_zeros()
}

/// Milliseconds since the unix epoch, used for debug timestamps
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[inline]
pub(crate) const fn pages_of(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

#[inline]
pub(crate) const fn pages_to_bytes(pages: usize) -> usize {
    pages << PAGE_SHIFT
}

// All counters guarded by these locks are updated in a single step,
// so a panic while holding one never leaves them half written.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

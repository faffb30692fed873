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

use std::time::Duration;

use crate::types::{HeapId, PAGE_SIZE};

/// Allocations above this size are rejected by default
pub const DEFAULT_MAX_ALLOCATION_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct IonConfig {
    /// Requests above this length are rejected as invalid.
    /// `None` disables the check.
    pub max_allocation_size: Option<usize>,

    /// If a request selects exactly this heap, its length is not page rounded
    pub passthrough_heap_id: Option<HeapId>,

    /// Allocations taking longer than this are reported
    pub slow_allocation_threshold: Duration,

    /// Maximum number of simultaneously open descriptors
    pub max_descriptors: usize,

    /// Spawn a background thread per deferred free heap
    pub deferred_free_worker: bool,
}

impl Default for IonConfig {
    fn default() -> Self {
        Self {
            max_allocation_size: Some(DEFAULT_MAX_ALLOCATION_SIZE),
            passthrough_heap_id: None,
            slow_allocation_threshold: Duration::from_millis(100),
            max_descriptors: 1024,
            deferred_free_worker: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContiguousConfig {
    /// How many areas can be declared
    pub max_areas: usize,

    /// Base and size of every area have to be aligned to `PAGE_SIZE << min_alignment_order`
    pub min_alignment_order: u32,

    /// Upper bound of pages reclaimed by a single shrink step
    pub max_shrink_pages: usize,

    /// How often `alloc_large` retries the allocation after shrinking
    pub large_alloc_retries: usize,
}

impl Default for ContiguousConfig {
    fn default() -> Self {
        Self {
            max_areas: 7,
            min_alignment_order: 10,
            max_shrink_pages: 40 * 1024 * 1024 / PAGE_SIZE,
            large_alloc_retries: 3,
        }
    }
}

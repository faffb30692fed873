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

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Largest alignment order of the contiguous allocator, `PAGE_SIZE << MAX_ALIGN_ORDER`
/// still fits a `usize`
pub const MAX_ALIGN_ORDER: u32 = usize::BITS - PAGE_SHIFT - 1;

/// Page frame number
pub type Pfn = u64;

#[inline]
pub const fn pfn_to_phys(pfn: Pfn) -> u64 {
    pfn << PAGE_SHIFT
}

#[inline]
pub const fn phys_to_pfn(phys: u64) -> Pfn {
    phys >> PAGE_SHIFT
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a buffer, unique for the lifetime of a device
    BufferId(u64)
);
id_type!(
    /// Identity of a client, unique for the lifetime of a device
    ClientId(u64)
);
id_type!(
    /// Dense per client handle id, freed ids are reused
    HandleId(u32)
);
id_type!(
    /// Heap identifier, doubles as the heap priority (higher is tried first)
    HeapId(u32)
);
id_type!(
    /// Transferable integer form of a share token
    Descriptor(i32)
);

impl HeapId {
    /// Mask bit selecting this heap
    #[inline]
    pub const fn mask(self) -> u32 {
        1u32 << self.0
    }
}

bitflags! {
    /// Flags passed with an allocation request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u32 {
        /// Mappings of the buffer are cached
        const CACHED = 1 << 0;
        /// Cached mappings are synchronized explicitly by the user,
        /// no fault tracking is done
        const CACHED_NEEDS_SYNC = 1 << 1;
    }
}

bitflags! {
    /// Policy flags declared by a heap at registration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapFlags: u32 {
        /// Buffers of this heap are released through a deferred free list
        const DEFER_FREE = 1 << 0;
    }
}

/// Kind of backing a heap provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    System,
    SystemContig,
    Carveout,
    Chunk,
    Contiguous,
    Framebuffer,
    /// Buffers wrap caller provided virtual addresses, lengths are not page rounded
    VirtualPassthrough,
    Custom(u32),
}

/// Direction of a cache maintenance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    Bidirectional,
    ToDevice,
    FromDevice,
}

/// Name and pid of a task, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub name: String,
    pub pid: u32,
}

impl TaskIdentity {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
        }
    }

    /// Identity of the calling thread's process
    pub fn current() -> Self {
        let name = std::thread::current()
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "unnamed".to_string());

        Self {
            name,
            pid: std::process::id(),
        }
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.pid)
    }
}

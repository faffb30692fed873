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

//! Buffer sharing allocator: heaps, clients holding handles to shared
//! buffers, and a bitmap allocator for physically contiguous regions.

mod buffer;
mod client;
mod config;
mod contiguous;
mod deferred_free;
mod device;
mod error;
mod mapping;
mod registered_heap;
mod session;
mod share;
mod types;
mod util;

#[cfg(test)]
mod test;

pub use buffer::Buffer;
pub use client::{Client, HandleDebug, HandleRefs};
pub use config::{ContiguousConfig, IonConfig, DEFAULT_MAX_ALLOCATION_SIZE};
pub use contiguous::{BitmapReservation, ContiguousAreas, ContiguousRegion};
pub use device::{ClientInfo, Device, OrphanedBuffer};
pub use error::{IonError, IonResult};
pub use mapping::{UserMapping, VmRegion};
pub use session::Session;
pub use share::{ShareToken, SharedBuffer};
pub use types::*;
pub use util::ReservedMemory;
pub mod modules;

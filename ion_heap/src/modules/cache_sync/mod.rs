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


use crate::types::DmaDirection;

/// Cache maintenance for memory handed to a device
pub trait CacheSyncModule: Send + Sync {
    /// Makes CPU writes to `[phys, phys + len)` visible to devices
    fn sync_for_device(&self, phys: u64, len: usize, direction: DmaDirection);
}

/// For hardware coherent systems
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheSyncModule;

impl CacheSyncModule for NoopCacheSyncModule {
    fn sync_for_device(&self, _phys: u64, _len: usize, _direction: DmaDirection) {}
}

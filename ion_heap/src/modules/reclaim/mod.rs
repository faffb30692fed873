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


/// Memory reclaim controls of the surrounding system
pub trait ReclaimModule: Send + Sync {
    /// Number of free pages right now
    fn free_pages(&self) -> usize;

    /// Sum of the low watermarks of all zones a contiguous allocation can
    /// migrate pages into
    fn low_watermark_pages(&self) -> usize;

    /// Reclaims up to `nr_pages` pages and returns how many were freed
    fn shrink_all_memory(&self, nr_pages: usize) -> usize;

    fn swappiness(&self) -> u32;

    fn set_swappiness(&self, swappiness: u32);
}

/// Reclaim module for systems without memory pressure
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReclaimModule;

impl ReclaimModule for NoopReclaimModule {
    fn free_pages(&self) -> usize {
        usize::MAX
    }

    fn low_watermark_pages(&self) -> usize {
        0
    }

    fn shrink_all_memory(&self, _nr_pages: usize) -> usize {
        0
    }

    fn swappiness(&self) -> u32 {
        60
    }

    fn set_swappiness(&self, _swappiness: u32) {}
}

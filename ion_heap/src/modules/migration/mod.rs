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


use crate::types::Pfn;

/// Why a page range could not be taken over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationError {
    /// Some page of the range is in use right now, another range may work
    Busy,
    /// The range cannot be used at all
    Failed,
}

/// Converts ordinary page ranges into ranges reserved for a contiguous
/// allocation and back.
///
/// Calls are serialized by the owner of the contiguous areas, so
/// implementations may assume that only one isolation runs at a time.
pub trait MigrationModule: Send + Sync {
    /// Moves all pages out of `[start, end)` and reserves the range
    fn isolate_range(&self, start: Pfn, end: Pfn) -> Result<(), MigrationError>;

    /// Gives `count` pages starting at `start` back to normal use
    fn release_range(&self, start: Pfn, count: usize);
}

/// Migration module for ranges nobody else uses, isolation always succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMigrationModule;

impl MigrationModule for NoopMigrationModule {
    fn isolate_range(&self, _start: Pfn, _end: Pfn) -> Result<(), MigrationError> {
        Ok(())
    }

    fn release_range(&self, _start: Pfn, _count: usize) {}
}

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

use std::collections::BTreeSet;

/// Hands out the lowest unused id starting at `first`
#[derive(Debug)]
pub(crate) struct IdAllocator {
    first: u32,
    /// highest id that may be handed out
    last: u32,
    /// every id `>= next` is unused
    next: u32,
    /// released ids below `next`
    released: BTreeSet<u32>,
}

impl IdAllocator {
    pub(crate) fn new(first: u32) -> Self {
        Self::with_last(first, u32::MAX)
    }

    /// Only hands out ids in `first..=last`
    pub(crate) fn with_last(first: u32, last: u32) -> Self {
        Self {
            first,
            last,
            next: first,
            released: BTreeSet::new(),
        }
    }

    /// Returns `None` if the id space is exhausted, nothing is taken then
    pub(crate) fn alloc(&mut self) -> Option<u32> {
        if let Some(id) = self.released.pop_first() {
            return Some(id);
        }

        let id = self.next;
        if id > self.last {
            return None;
        }
        self.next = id.checked_add(1)?;
        Some(id)
    }

    pub(crate) fn free(&mut self, id: u32) {
        debug_assert!(id >= self.first && id < self.next, "id {} was never allocated", id);

        if id + 1 == self.next {
            self.next = id;
            // shrink further while the top ids are released
            while self.next > self.first && self.released.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            let inserted = self.released.insert(id);
            debug_assert!(inserted, "id {} freed twice", id);
        }
    }
}

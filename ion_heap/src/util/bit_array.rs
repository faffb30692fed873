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

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed size bit array, every bit starts cleared
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BitArray {
    words: Box<[u64]>,
    len: usize,
}

impl BitArray {
    pub(crate) fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(WORD_BITS)];

        BitArray {
            words: words.into_boxed_slice(),
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        (self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS))) != 0
    }

    pub(crate) fn set(&mut self, value: bool, index: usize) {
        debug_assert!(index < self.len);
        let item = &mut self.words[index / WORD_BITS];
        if value {
            *item |= 1u64 << (index % WORD_BITS);
        } else {
            *item &= !(1u64 << (index % WORD_BITS));
        }
    }

    /// Sets `[start, start + count)`
    pub(crate) fn set_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.len, "bit range out of bounds");
        for i in start..start + count {
            self.set(true, i);
        }
    }

    /// Clears `[start, start + count)`
    pub(crate) fn clear_range(&mut self, start: usize, count: usize) {
        assert!(start + count <= self.len, "bit range out of bounds");
        for i in start..start + count {
            self.set(false, i);
        }
    }

    pub(crate) fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Index of the first bit in `[start, end)` equal to `value`, or `end`
    fn find_next(&self, value: bool, end: usize, start: usize) -> usize {
        let end = end.min(self.len);
        let mut i = start;
        while i < end {
            let word = if value {
                self.words[i / WORD_BITS]
            } else {
                !self.words[i / WORD_BITS]
            };
            // mask off bits below `i`
            let word = word & (u64::MAX << (i % WORD_BITS));
            if word != 0 {
                let found = (i / WORD_BITS) * WORD_BITS + word.trailing_zeros() as usize;
                return found.min(end);
            }
            i = (i / WORD_BITS + 1) * WORD_BITS;
        }
        end
    }

    pub(crate) fn find_next_zero_bit(&self, end: usize, start: usize) -> usize {
        self.find_next(false, end, start)
    }

    pub(crate) fn find_next_bit(&self, end: usize, start: usize) -> usize {
        self.find_next(true, end, start)
    }

    /// Finds the first run of `nr` cleared bits inside `[start, size)`.
    ///
    /// The returned index `i` satisfies `(i + align_offset) & align_mask == 0`.
    /// A return value `>= size` means that no such run exists.
    pub(crate) fn find_next_zero_area_off(
        &self,
        size: usize,
        mut start: usize,
        nr: usize,
        align_mask: usize,
        align_offset: usize,
    ) -> usize {
        loop {
            let mut index = self.find_next_zero_bit(size, start);

            index = ((index + align_offset + align_mask) & !align_mask) - align_offset;
            let end = index + nr;
            if end > size {
                return end.max(size);
            }

            let i = self.find_next_bit(end, index);
            if i < end {
                start = i + 1;
                continue;
            }

            return index;
        }
    }
}

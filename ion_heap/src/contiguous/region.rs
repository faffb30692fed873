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

use std::sync::{atomic::Ordering, Arc, Mutex};

use log::{debug, error, trace, warn};

use super::MigrationContext;
use crate::{
    error::{IonError, IonResult},
    modules::migration::MigrationError,
    types::{pfn_to_phys, Pfn, MAX_ALIGN_ORDER, PAGE_SHIFT},
    util::{bit_array::BitArray, lock, pages_to_bytes},
};

struct RegionState {
    base_pfn: Pfn,
    count: usize,
    /// `None` until the region is activated
    bitmap: Option<BitArray>,
}

/// Bits marked allocated by the first phase of an allocation.
///
/// Has to be handed back to [`ContiguousRegion::rollback`] if the
/// allocation does not go through.
#[must_use]
#[derive(Debug)]
pub struct BitmapReservation {
    bitmap_no: usize,
    bitmap_count: usize,
}

impl BitmapReservation {
    pub fn bitmap_no(&self) -> usize {
        self.bitmap_no
    }

    pub fn bitmap_count(&self) -> usize {
        self.bitmap_count
    }
}

/// A reserved physically contiguous range, handed out by a bitmap allocator.
///
/// One bit covers `1 << order_per_bit` pages.
pub struct ContiguousRegion {
    state: Mutex<RegionState>,
    order_per_bit: u32,
    context: Arc<MigrationContext>,
}

impl std::fmt::Debug for ContiguousRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ContiguousRegion")
            .field("base_pfn", &state.base_pfn)
            .field("count", &state.count)
            .field("order_per_bit", &self.order_per_bit)
            .field("activated", &state.bitmap.is_some())
            .finish()
    }
}

impl ContiguousRegion {
    pub(super) fn new(
        base_pfn: Pfn,
        count: usize,
        order_per_bit: u32,
        context: Arc<MigrationContext>,
    ) -> Self {
        Self {
            state: Mutex::new(RegionState {
                base_pfn,
                count,
                bitmap: None,
            }),
            order_per_bit,
            context,
        }
    }

    pub fn base_pfn(&self) -> Pfn {
        lock(&self.state).base_pfn
    }

    /// Number of pages
    pub fn count(&self) -> usize {
        lock(&self.state).count
    }

    pub fn order_per_bit(&self) -> u32 {
        self.order_per_bit
    }

    pub fn base(&self) -> u64 {
        pfn_to_phys(self.base_pfn())
    }

    pub fn size(&self) -> usize {
        self.count() << PAGE_SHIFT
    }

    pub fn is_activated(&self) -> bool {
        lock(&self.state).bitmap.is_some()
    }

    /// Pages currently marked allocated
    pub fn used_pages(&self) -> usize {
        lock(&self.state)
            .bitmap
            .as_ref()
            .map(|bitmap| bitmap.count_ones() << self.order_per_bit)
            .unwrap_or(0)
    }

    /// Shrinks the region from the front, only possible before activation
    pub fn resize_front(&self, nr_pfn: usize) -> IonResult<()> {
        let mut state = lock(&self.state);
        if state.bitmap.is_some() {
            return Err(IonError::InvalidArgument("region is already activated"));
        }
        if nr_pfn > state.count {
            return Err(IonError::InvalidArgument("cannot cut more pages than the region has"));
        }
        if nr_pfn % (1 << self.order_per_bit) != 0 {
            return Err(IonError::InvalidArgument("resize has to keep the base aligned to a bitmap bit"));
        }
        state.base_pfn += nr_pfn as Pfn;
        state.count -= nr_pfn;
        Ok(())
    }

    /// Allocates the bitmap, after this the geometry is fixed
    pub fn activate(&self) -> IonResult<()> {
        let mut state = lock(&self.state);
        if state.bitmap.is_some() {
            warn!("contiguous region at pfn {:#x} activated twice", state.base_pfn);
            return Ok(());
        }
        if state.count == 0 {
            return Err(IonError::InvalidArgument("region is empty"));
        }

        let maxno = state.count >> self.order_per_bit;
        state.bitmap = Some(BitArray::new(maxno));
        debug!(
            "activated contiguous region at pfn {:#x} with {} pages ({} bits)",
            state.base_pfn, state.count, maxno
        );
        Ok(())
    }

    fn check_align(align_order: u32) -> IonResult<()> {
        if align_order > MAX_ALIGN_ORDER {
            return Err(IonError::InvalidArgument("alignment order is too large"));
        }
        Ok(())
    }

    fn aligned_mask(&self, align_order: u32) -> usize {
        if align_order <= self.order_per_bit {
            return 0;
        }
        (1usize << (align_order - self.order_per_bit)) - 1
    }

    /// Offset of the base pfn from an `align_order` boundary, in bits
    fn aligned_offset(&self, base_pfn: Pfn, align_order: u32) -> usize {
        ((base_pfn & ((1u64 << align_order) - 1)) >> self.order_per_bit) as usize
    }

    fn pages_to_bits(&self, pages: usize) -> usize {
        pages.div_ceil(1 << self.order_per_bit)
    }

    /// First phase of an allocation: finds and marks the first free run of
    /// `count` pages at or after bit `start` whose physical address is
    /// aligned to `PAGE_SIZE << align_order`.
    pub fn reserve(&self, start: usize, count: usize, align_order: u32) -> IonResult<Option<BitmapReservation>> {
        Self::check_align(align_order)?;

        let mut state = lock(&self.state);
        let base_pfn = state.base_pfn;
        let mask = self.aligned_mask(align_order);
        let offset = self.aligned_offset(base_pfn, align_order);
        let bitmap_count = self.pages_to_bits(count);
        let bitmap = state.bitmap.as_mut().ok_or(IonError::NotActivated)?;
        let maxno = bitmap.len();
        if bitmap_count > maxno || start >= maxno {
            return Ok(None);
        }

        let bitmap_no = bitmap.find_next_zero_area_off(maxno, start, bitmap_count, mask, offset);
        if bitmap_no >= maxno {
            return Ok(None);
        }
        bitmap.set_range(bitmap_no, bitmap_count);

        Ok(Some(BitmapReservation {
            bitmap_no,
            bitmap_count,
        }))
    }

    /// Undoes a reservation whose allocation did not go through
    pub fn rollback(&self, reservation: BitmapReservation) {
        let mut state = lock(&self.state);
        if let Some(bitmap) = state.bitmap.as_mut() {
            bitmap.clear_range(reservation.bitmap_no, reservation.bitmap_count);
        }
    }

    fn reservation_pfn(&self, reservation: &BitmapReservation) -> Pfn {
        self.base_pfn() + ((reservation.bitmap_no as Pfn) << self.order_per_bit)
    }

    /// Allocates `count` pages whose physical address is a multiple of
    /// `PAGE_SIZE << align` and returns the first page frame.
    ///
    /// Ranges the migration reports busy are skipped and the search continues
    /// behind them, so this only gives up once the bitmap is exhausted or
    /// migration fails for another reason. There is no timeout. If only busy
    /// ranges stood in the way, the last one of them is reported as
    /// [`IonError::Busy`].
    pub fn alloc(&self, count: usize, align: u32) -> IonResult<Pfn> {
        trace!("contiguous alloc(count {}, align {})", count, align);

        if count == 0 {
            return Err(IonError::InvalidArgument("count cannot be zero"));
        }
        if count > self.count() {
            return Err(IonError::InvalidArgument("count is larger than the region"));
        }
        Self::check_align(align)?;

        let mask = self.aligned_mask(align);
        let mut start = 0;
        let mut last_busy = None;

        loop {
            let Some(reservation) = self.reserve(start, count, align)? else {
                if let Some(pfn) = last_busy {
                    return Err(IonError::Busy { pfn, count });
                }
                return Err(IonError::ResourceExhausted {
                    len: pages_to_bytes(count),
                });
            };
            // the bits are ours now, the region lock is not held during migration
            let pfn = self.reservation_pfn(&reservation);

            let result = {
                let _migration = lock(&self.context.lock);
                self.context
                    .migration
                    .isolate_range(pfn, pfn + count as Pfn)
            };

            match result {
                Ok(()) => {
                    self.context.usage.fetch_add(count, Ordering::AcqRel);
                    trace!("contiguous alloc returned pfn {:#x}", pfn);
                    return Ok(pfn);
                }
                Err(MigrationError::Busy) => {
                    debug!("memory range at pfn {:#x} is busy, retrying", pfn);
                    // try again with a bit different memory target
                    start = reservation.bitmap_no.saturating_add(mask).saturating_add(1);
                    last_busy = Some(pfn);
                    self.rollback(reservation);
                }
                Err(MigrationError::Failed) => {
                    self.rollback(reservation);
                    return Err(IonError::MigrationFailed { pfn, count });
                }
            }
        }
    }

    /// Is there a free run for `alloc(count, align)` right now
    pub fn alloc_range_ok(&self, count: usize, align: u32) -> bool {
        if Self::check_align(align).is_err() {
            return false;
        }
        let state = lock(&self.state);
        let Some(bitmap) = state.bitmap.as_ref() else {
            return false;
        };
        let mask = self.aligned_mask(align);
        let offset = self.aligned_offset(state.base_pfn, align);
        let bitmap_count = self.pages_to_bits(count);
        if bitmap_count > bitmap.len() {
            return false;
        }
        bitmap.find_next_zero_area_off(bitmap.len(), 0, bitmap_count, mask, offset) < bitmap.len()
    }

    /// Releases pages allocated by [`ContiguousRegion::alloc`].
    ///
    /// Returns `false` if the pages do not belong to this region.
    pub fn release(&self, pfn: Pfn, count: usize) -> bool {
        let (base_pfn, region_count) = {
            let state = lock(&self.state);
            (state.base_pfn, state.count)
        };

        if pfn < base_pfn || pfn >= base_pfn + region_count as Pfn {
            return false;
        }
        if count > region_count || pfn + count as Pfn > base_pfn + region_count as Pfn {
            error!(
                "release of pfn {:#x}+{} crosses the end of the region at {:#x}",
                pfn,
                count,
                base_pfn + region_count as Pfn
            );
            return false;
        }

        trace!("contiguous release(pfn {:#x}, count {})", pfn, count);
        self.context.migration.release_range(pfn, count);

        let bitmap_no = ((pfn - base_pfn) >> self.order_per_bit) as usize;
        let bitmap_count = self.pages_to_bits(count);
        {
            let mut state = lock(&self.state);
            if let Some(bitmap) = state.bitmap.as_mut() {
                bitmap.clear_range(bitmap_no, bitmap_count);
            }
        }

        self.context.usage.fetch_sub(count, Ordering::AcqRel);
        true
    }

    #[cfg(test)]
    pub(crate) fn bitmap_snapshot(&self) -> Vec<bool> {
        let state = lock(&self.state);
        let bitmap = state.bitmap.as_ref().expect("region should be activated");
        (0..bitmap.len()).map(|i| bitmap.is_set(i)).collect()
    }
}

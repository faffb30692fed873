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

use std::time::Instant;

use log::{debug, info, trace, warn};

use super::{ContiguousAreas, ContiguousRegion};
use crate::{
    error::{IonError, IonResult},
    modules::reclaim::ReclaimModule,
    types::{Pfn, MAX_ALIGN_ORDER},
};

/// Sets swappiness to 0 and restores the previous value when dropped
struct SwappinessGuard<'a> {
    reclaim: &'a dyn ReclaimModule,
    original: u32,
}

impl<'a> SwappinessGuard<'a> {
    fn new(reclaim: &'a dyn ReclaimModule) -> Self {
        let original = reclaim.swappiness();
        reclaim.set_swappiness(0);
        Self { reclaim, original }
    }
}

impl Drop for SwappinessGuard<'_> {
    fn drop(&mut self) {
        self.reclaim.set_swappiness(self.original);
    }
}

impl ContiguousAreas {
    /// Reclaims memory until at least `pages` pages are free or the retries
    /// run out. Returns the number of reclaimed pages.
    pub fn try_shrink_memory(&self, pages: usize) -> usize {
        let start = Instant::now();
        let max_shrink = self.config.max_shrink_pages.max(1);
        let mut retries = (pages / max_shrink).saturating_add(5);

        let mut free = self.reclaim.free_pages();
        let mut freed = 0;
        while pages > free && retries > 0 {
            retries -= 1;
            // reclaiming a lot at once frees way more than needed
            let chunk = max_shrink.min(pages - free);
            freed += self.reclaim.shrink_all_memory(chunk);
            free = self.reclaim.free_pages();
        }

        info!(
            "shrink reclaimed {} pages, now {} free, took {} us",
            freed,
            free,
            start.elapsed().as_micros()
        );
        freed
    }

    /// Allocates a large run from `region`.
    ///
    /// Frees memory up front so that pages migrated out of the region find a
    /// place without triggering reclaim, then retries the allocation a few
    /// times. Swappiness is 0 for the whole call.
    pub fn alloc_large(&self, region: &ContiguousRegion, count: usize, align: u32) -> IonResult<Pfn> {
        trace!("alloc_large(count {}, align {})", count, align);
        if count == 0 || count > region.count() {
            return Err(IonError::InvalidArgument("count does not fit into the region"));
        }
        if align > MAX_ALIGN_ORDER {
            return Err(IonError::InvalidArgument("alignment order is too large"));
        }

        let _swappiness = SwappinessGuard::new(self.reclaim.as_ref());

        let target = count.saturating_add(self.reclaim.low_watermark_pages());
        self.try_shrink_memory(target);

        let retries = self.config.large_alloc_retries.max(1);
        let mut result = region.alloc(count, align);
        for attempt in 1..retries {
            match &result {
                Ok(_) | Err(IonError::InvalidArgument(_)) | Err(IonError::NotActivated) => break,
                Err(err) => {
                    debug!("large allocation attempt {} failed: {}", attempt, err);
                    result = region.alloc(count, align);
                }
            }
        }

        if let Err(err) = &result {
            warn!("large allocation of {} pages failed: {}", count, err);
        }
        result
    }
}

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

//! Physically contiguous regions carved out at startup and handed out page
//! granular through a bitmap.

mod large;
mod region;

use std::sync::{atomic::AtomicUsize, atomic::Ordering, Arc, Mutex};

use log::{debug, info};

pub use region::{BitmapReservation, ContiguousRegion};

use crate::{
    config::ContiguousConfig,
    error::{IonError, IonResult},
    modules::{migration::MigrationModule, reclaim::ReclaimModule},
    types::{pfn_to_phys, phys_to_pfn, PAGE_SIZE},
    util::{lock, ReservedMemory},
};

/// State every region shares with the others
pub(crate) struct MigrationContext {
    /// Only one range is migrated at a time, over all regions
    pub(crate) lock: Mutex<()>,
    pub(crate) migration: Arc<dyn MigrationModule>,
    /// Pages currently allocated from any region
    pub(crate) usage: AtomicUsize,
}

/// Owner of every declared contiguous region
pub struct ContiguousAreas {
    config: ContiguousConfig,
    regions: Mutex<Vec<Arc<ContiguousRegion>>>,
    context: Arc<MigrationContext>,
    reclaim: Arc<dyn ReclaimModule>,
}

impl ContiguousAreas {
    pub fn new(
        config: ContiguousConfig,
        migration: Arc<dyn MigrationModule>,
        reclaim: Arc<dyn ReclaimModule>,
    ) -> Self {
        Self {
            config,
            regions: Mutex::new(Vec::new()),
            context: Arc::new(MigrationContext {
                lock: Mutex::new(()),
                migration,
                usage: AtomicUsize::new(0),
            }),
            reclaim,
        }
    }

    pub fn config(&self) -> &ContiguousConfig {
        &self.config
    }

    /// Declares a region covering `[base, base + size)`.
    ///
    /// Base and size have to be aligned to `PAGE_SIZE << order`, where
    /// `order` is the larger one of `min_alignment_order` and `order_per_bit`.
    /// The region cannot be used before it is activated.
    pub fn declare(&self, base: u64, size: usize, order_per_bit: u32) -> IonResult<Arc<ContiguousRegion>> {
        let mut regions = lock(&self.regions);
        if regions.len() >= self.config.max_areas {
            return Err(IonError::NoSpace);
        }
        if size == 0 {
            return Err(IonError::InvalidArgument("region size cannot be zero"));
        }

        let order = self.config.min_alignment_order.max(order_per_bit);
        let alignment = PAGE_SIZE << order;
        if base % alignment as u64 != 0 || size % alignment != 0 {
            return Err(IonError::InvalidArgument("region base and size have to be aligned"));
        }

        let base_pfn = phys_to_pfn(base);
        let count = size / PAGE_SIZE;
        let new_end = base_pfn + count as u64;
        let overlaps = regions.iter().any(|region| {
            let start = region.base_pfn();
            let end = start + region.count() as u64;
            base_pfn < end && start < new_end
        });
        if overlaps {
            return Err(IonError::InvalidArgument("region overlaps a declared region"));
        }

        let region = Arc::new(ContiguousRegion::new(
            base_pfn,
            count,
            order_per_bit,
            self.context.clone(),
        ));
        regions.push(region.clone());

        info!(
            "reserved {} MiB at {:#x} for contiguous allocations",
            size / (1024 * 1024),
            base
        );
        Ok(region)
    }

    /// Declares a region over memory reserved from the host
    pub fn declare_reserved(&self, memory: &ReservedMemory, order_per_bit: u32) -> IonResult<Arc<ContiguousRegion>> {
        self.declare(memory.base(), memory.size(), order_per_bit)
    }

    /// Activates every declared region that is not active yet
    pub fn activate_all(&self) -> IonResult<()> {
        let regions = lock(&self.regions).clone();
        for region in regions.iter().filter(|region| !region.is_activated()) {
            region.activate()?;
        }
        debug!("activated {} contiguous regions", regions.len());
        Ok(())
    }

    pub fn regions(&self) -> Vec<Arc<ContiguousRegion>> {
        lock(&self.regions).clone()
    }

    /// Lowest base and highest end physical address over all regions
    pub fn range(&self) -> Option<(u64, u64)> {
        let regions = lock(&self.regions);
        let start = regions.iter().map(|region| region.base()).min()?;
        let end = regions
            .iter()
            .map(|region| pfn_to_phys(region.base_pfn() + region.count() as u64))
            .max()?;
        Some((start, end))
    }

    /// Pages currently allocated from any region
    pub fn usage_pages(&self) -> usize {
        self.context.usage.load(Ordering::Acquire)
    }
}

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

use thiserror::Error;

use crate::types::{Descriptor, HandleId};

/// Result type alias using [`IonError`].
pub type IonResult<T> = std::result::Result<T, IonError>;

/// Every failure the allocation service can report.
///
/// Validation errors are returned before any state is committed. Counters
/// are never modified by a call that fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IonError {
    /// Zero length, length above the configured ceiling, bad alignment, ...
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The heap mask did not select any registered heap.
    #[error("no registered heap matches mask {mask:#x}")]
    NoSuchHeap { mask: u32 },

    /// Every eligible heap failed to allocate.
    #[error("no eligible heap could satisfy a request of {len} bytes")]
    ResourceExhausted { len: usize },

    /// A single heap could not satisfy one allocation attempt.
    #[error("heap is out of memory")]
    OutOfMemory,

    /// The handle id is not live in the client that was asked.
    #[error("invalid handle {0}")]
    InvalidHandle(HandleId),

    /// Unmap or put past zero.
    #[error("double release detected: {0}")]
    DoubleRelease(&'static str),

    /// The share token was not produced by this service.
    #[error("share token was produced by another exporter")]
    ForeignToken,

    /// A reference counter would wrap.
    #[error("reference count overflow")]
    Overflow,

    /// Transient migration failure, the page range is in use.
    #[error("page range {pfn:#x}+{count} is busy")]
    Busy { pfn: u64, count: usize },

    /// Non transient migration failure.
    #[error("page range {pfn:#x}+{count} could not be migrated")]
    MigrationFailed { pfn: u64, count: usize },

    /// The heap does not implement an optional operation.
    #[error("{0} is not supported by this heap")]
    NotSupported(&'static str),

    /// The descriptor is not open.
    #[error("bad descriptor {0}")]
    BadDescriptor(Descriptor),

    /// The descriptor table is full.
    #[error("too many open descriptors")]
    TooManyDescriptors,

    /// A contiguous region was used before it was activated.
    #[error("contiguous region is not activated")]
    NotActivated,

    /// No free slot left in the contiguous area table.
    #[error("not enough slots for contiguous areas")]
    NoSpace,
}

impl IonError {
    /// `true` for errors caused by a transient condition that a retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, IonError::Busy { .. } | IonError::OutOfMemory)
    }
}

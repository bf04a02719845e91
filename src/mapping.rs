//! CPU-visible mapping windows onto pinned device memory.
//!
//! A [`MappingWindow`] is created by [`PinnedRegion::map`] and stays valid
//! until the region is unmapped. The window is a handle, not an owner: the
//! region owns the mapping and tears it down. Copies through a window whose
//! mapping has been torn down fail with [`Error::StaleMapping`].
//!
//! The [`MappingType`] reported by the driver selects the
//! [`FlushDiscipline`] the copy engine applies.
//!
//! [`PinnedRegion::map`]: crate::region::PinnedRegion::map
//! [`Error::StaleMapping`]: crate::Error::StaleMapping

use crate::error::{Error, Result};
use crate::region::RegionId;
use std::fmt;
use std::ptr::NonNull;

/// How the CPU-visible window is backed, as classified by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MappingType {
    /// Not classified (not mapped, or an older driver that does not report it).
    #[default]
    None = 0,
    /// Write-combined: stores are buffered and need a store fence.
    WriteCombined = 1,
    /// Cached and coherent with the device.
    Caching = 2,
    /// Device memory attributes: strictly ordered, no speculation.
    Device = 3,
}

impl MappingType {
    /// All mapping types, in driver enumeration order.
    pub const ALL: [MappingType; 4] = [
        MappingType::None,
        MappingType::WriteCombined,
        MappingType::Caching,
        MappingType::Device,
    ];

    /// Convert the driver's raw enumeration value.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(MappingType::None),
            1 => Ok(MappingType::WriteCombined),
            2 => Ok(MappingType::Caching),
            3 => Ok(MappingType::Device),
            other => Err(Error::InvalidArgument(format!(
                "unknown mapping type {other}"
            ))),
        }
    }

    /// The driver's raw enumeration value.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Stable lowercase name, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            MappingType::None => "none",
            MappingType::WriteCombined => "write_combined",
            MappingType::Caching => "caching",
            MappingType::Device => "device",
        }
    }

    /// Are CPU caches coherent with the device for this mapping?
    #[inline]
    pub fn is_coherent(self) -> bool {
        matches!(self, MappingType::Caching)
    }

    /// The ordering discipline copies through this mapping must follow.
    pub fn discipline(self) -> FlushDiscipline {
        match self {
            MappingType::Caching => FlushDiscipline {
                before_read: Fence::None,
                after_write: Fence::None,
                volatile: false,
            },
            MappingType::WriteCombined => FlushDiscipline {
                before_read: Fence::Load,
                after_write: Fence::Store,
                volatile: false,
            },
            MappingType::Device => FlushDiscipline {
                before_read: Fence::Full,
                after_write: Fence::Full,
                volatile: true,
            },
            // Unclassified: assume the weakest guarantees.
            MappingType::None => FlushDiscipline {
                before_read: Fence::Full,
                after_write: Fence::Full,
                volatile: false,
            },
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingType::None => write!(f, "NONE"),
            MappingType::WriteCombined => write!(f, "WC"),
            MappingType::Caching => write!(f, "CACHING"),
            MappingType::Device => write!(f, "DEVICE"),
        }
    }
}

/// Memory barrier kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fence {
    /// No barrier.
    None,
    /// Orders earlier loads before later loads.
    Load,
    /// Drains write-combining buffers; orders earlier stores.
    Store,
    /// Orders all earlier memory accesses.
    Full,
}

/// Barriers and access width required around a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushDiscipline {
    /// Barrier issued before reading from the window.
    pub before_read: Fence,
    /// Barrier issued after writing to the window.
    pub after_write: Fence,
    /// Whether window accesses must be volatile and naturally aligned.
    pub volatile: bool,
}

/// A CPU-addressable view onto a pinned region.
///
/// Obtained from [`PinnedRegion::map`](crate::region::PinnedRegion::map).
/// The handle is cheap to clone; every clone becomes stale together when the
/// region is unmapped.
#[derive(Clone)]
pub struct MappingWindow {
    pub(crate) region: RegionId,
    pub(crate) generation: u64,
    ptr: NonNull<u8>,
    size: usize,
    mapping_type: MappingType,
}

// SAFETY: The pointer is never dereferenced through the handle itself. The
// copy engine validates the handle against its owning region (which must be
// borrowed for the copy) before touching the memory.
unsafe impl Send for MappingWindow {}
unsafe impl Sync for MappingWindow {}

impl MappingWindow {
    pub(crate) fn new(
        region: RegionId,
        generation: u64,
        ptr: NonNull<u8>,
        size: usize,
        mapping_type: MappingType,
    ) -> Self {
        Self {
            region,
            generation,
            ptr,
            size,
            mapping_type,
        }
    }

    /// Raw pointer to the start of the window.
    ///
    /// Only valid while the owning region remains mapped. Prefer the
    /// [`CopyEngine`](crate::copy::CopyEngine), which applies the required
    /// fences.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if the window has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Mapping type classification.
    #[inline]
    pub fn mapping_type(&self) -> MappingType {
        self.mapping_type
    }

    /// The region this window belongs to.
    #[inline]
    pub fn region_id(&self) -> RegionId {
        self.region
    }
}

impl fmt::Debug for MappingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingWindow")
            .field("region", &self.region)
            .field("generation", &self.generation)
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("mapping_type", &self.mapping_type)
            .finish()
    }
}

//! # gdrcopy
//!
//! Direct CPU access to accelerator device memory.
//!
//! A device address range is pinned with the kernel driver, mapped into the
//! process as a CPU-visible window, and then read or written with ordinary
//! loads and stores, bypassing the accelerator's own copy engines.
//!
//! ## Features
//!
//! - **Explicit lifecycle**: pin → map → copy → unmap → unpin, with every
//!   illegal transition reported instead of silently repaired
//! - **Mapping-aware copies**: fences and access width chosen per mapping
//!   type (cached, write-combined, device)
//! - **RAII cleanup**: dropped regions unmap and unpin themselves
//! - **Pluggable drivers**: `libgdrapi.so` loaded at runtime, or an
//!   in-process emulated device for tests and development
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gdrcopy::prelude::*;
//!
//! let session = Session::open_default()?;
//! let mut region = session.pin_buffer_v2(dev_ptr, 4096, PinFlags::DEFAULT)?;
//! let window = region.map(4096)?;
//!
//! CopyEngine::copy_to_mapping(&mut region, &window, &data)?;
//! CopyEngine::copy_from_mapping(&region, &window, &mut readback)?;
//!
//! region.unmap()?;
//! region.unpin()?;
//! session.close()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod attributes;
pub mod config;
pub mod copy;
pub mod defaults;
pub mod driver;
pub mod error;
pub mod mapping;
pub mod observability;
pub mod region;
pub mod session;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::attributes::{AttrKey, AttrValue, VersionInfo};
    pub use crate::copy::{CopyDirection, CopyEngine};
    pub use crate::error::{Error, Result};
    pub use crate::mapping::{MappingType, MappingWindow};
    pub use crate::region::{PinFlags, PinnedRegion, RegionState};
    pub use crate::session::Session;
}

pub use attributes::{AttrKey, AttrValue, AttributeRegistry, AttributeSnapshot, VersionInfo};
pub use config::Config;
pub use copy::{CopyDescriptor, CopyDirection, CopyEngine};
pub use error::{Error, Result};
pub use mapping::{FlushDiscipline, MappingType, MappingWindow};
pub use region::{PinFlags, PinnedRegion, RegionId, RegionInfo, RegionState};
pub use session::Session;

//! The driver boundary.
//!
//! The kernel driver is the sole authority on whether a device range may be
//! pinned or mapped. This module defines the interface the rest of the crate
//! talks to, and two implementations:
//!
//! - [`GdrApiDriver`]: the user-space `libgdrapi.so` library, loaded at runtime
//! - [`EmulatedDriver`]: a memfd-backed software device for tests and demos
//!
//! # Architecture
//!
//! ```text
//! Session ──open()──▶ Driver ──▶ Box<dyn Connection>
//!                                  │ pin / unpin / map / unmap
//!                                  │ get_info / get_callback_flag
//!                                  │ driver_version / get_attribute
//!                                  ▼
//!                           kernel driver (or memfd)
//! ```

mod emulated;
mod gdrapi;

pub use emulated::{Availability, EmulatedConfig, EmulatedDevice, EmulatedDriver};
pub use gdrapi::GdrApiDriver;

use crate::attributes::{AttrKey, VersionInfo};
use crate::defaults::GPU_PAGE_SIZE;
use crate::error::{Error, Result};
use crate::mapping::MappingType;
use crate::region::PinFlags;
use rustix::fs::Access;
use rustix::io::Errno;
use std::path::Path;
use std::ptr::NonNull;

/// Opaque pin handle returned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinToken(pub u64);

/// Region metadata as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInfo {
    /// Device virtual address of the pinned range.
    pub va: u64,
    /// Bytes currently mapped (0 when unmapped).
    pub mapped_size: u64,
    /// Driver page size used for the pin.
    pub page_size: u32,
    /// Driver timestamp of the pin, in CPU cycles.
    pub tm_cycles: u64,
    /// Calibration for `tm_cycles`.
    pub cycles_per_ms: u32,
    /// Whether a CPU mapping exists.
    pub mapped: bool,
    /// Whether the mapping is write-combined.
    pub wc_mapping: bool,
    /// Mapping type classification.
    pub mapping_type: MappingType,
}

/// A device-memory driver.
///
/// A driver is a factory for connections; it holds whatever process-wide
/// state the driver needs (a loaded library, an emulated device).
pub trait Driver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Version of the user-space library. Valid without a connection.
    fn runtime_version(&self) -> VersionInfo;

    /// Establish a connection to the kernel driver.
    ///
    /// # Errors
    ///
    /// [`Error::DriverUnavailable`] or [`Error::PermissionDenied`].
    fn open(&self) -> Result<Box<dyn Connection>>;
}

/// An open connection to the driver.
///
/// Requests are keyed by pin token. Implementations report rejections as
/// [`Error::Driver`] carrying the native code.
pub trait Connection: Send {
    /// Release the connection.
    fn close(&mut self) -> Result<()>;

    /// Pin a device range (legacy form carrying a P2P token and VA space).
    fn pin_buffer(
        &mut self,
        addr: u64,
        size: u64,
        p2p_token: u64,
        va_space: u32,
    ) -> Result<PinToken>;

    /// Pin a device range with flags.
    fn pin_buffer_v2(&mut self, addr: u64, size: u64, flags: PinFlags) -> Result<PinToken>;

    /// Release a pin.
    fn unpin_buffer(&mut self, token: PinToken) -> Result<()>;

    /// Query region metadata.
    fn get_info(&mut self, token: PinToken) -> Result<RawInfo>;

    /// Whether the region needs an explicit flush/fence around copies.
    fn get_callback_flag(&mut self, token: PinToken) -> Result<bool>;

    /// Create a CPU mapping of the first `size` bytes of a pinned range.
    fn map(&mut self, token: PinToken, size: usize) -> Result<NonNull<u8>>;

    /// Tear down a CPU mapping.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly those of a live mapping previously
    /// returned by [`map`](Connection::map) for `token`, and nothing may
    /// access the mapping afterwards.
    unsafe fn unmap(&mut self, token: PinToken, ptr: NonNull<u8>, size: usize) -> Result<()>;

    /// Kernel driver version.
    fn driver_version(&mut self) -> Result<VersionInfo>;

    /// Query an attribute.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedAttribute`] if the driver does not know the key.
    fn get_attribute(&mut self, key: AttrKey) -> Result<i32>;

    /// Alignment required of pinned device addresses.
    fn pin_granularity(&self) -> u64 {
        GPU_PAGE_SIZE
    }
}

/// Classify a failed connection attempt by probing the driver's device node.
pub(crate) fn classify_open_failure(device_node: &Path) -> Error {
    match rustix::fs::access(device_node, Access::READ_OK | Access::WRITE_OK) {
        Ok(()) => Error::DriverUnavailable {
            reason: format!(
                "{} is accessible but the driver refused the connection",
                device_node.display()
            ),
        },
        Err(Errno::ACCESS) | Err(Errno::PERM) => Error::PermissionDenied {
            reason: format!("no read/write access to {}", device_node.display()),
        },
        Err(Errno::NOENT) => Error::DriverUnavailable {
            reason: format!(
                "{} not found (is the kernel module loaded?)",
                device_node.display()
            ),
        },
        Err(errno) => Error::DriverUnavailable {
            reason: format!("cannot access {}: {}", device_node.display(), errno),
        },
    }
}

/// Build a driver rejection from a negative errno.
#[inline]
pub(crate) fn rejected(op: &'static str, errno: Errno) -> Error {
    Error::Driver {
        op,
        code: -errno.raw_os_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        let err = classify_open_failure(&dir.path().join("gdrdrv"));
        assert!(matches!(err, Error::DriverUnavailable { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_classify_accessible_node() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = classify_open_failure(file.path());
        assert!(matches!(err, Error::DriverUnavailable { .. }));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_rejected_carries_negative_errno() {
        let err = rejected("map", Errno::INVAL);
        assert_eq!(err.code(), Some(-22));
    }
}

//! Binding to the user-space GPUDirect RDMA copy library (`libgdrapi.so`).
//!
//! The library is loaded at runtime with `libloading`, following the search
//! order of [`Config::library_candidates`]. Every entry point is resolved up
//! front; a library missing any of them is rejected.
//!
//! The library's own copy routines are not used: copies go through
//! [`CopyEngine`](crate::copy::CopyEngine) so the flush discipline is the same
//! for every driver.

use super::{Connection, Driver, PinToken, RawInfo, classify_open_failure};
use crate::attributes::{AttrKey, VersionInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mapping::MappingType;
use crate::region::PinFlags;
use libloading::Library;
use std::ffi::{c_int, c_uint, c_ulong, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `gdr_t`
type GdrHandle = *mut c_void;

/// `gdr_mh_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GdrMh {
    h: c_ulong,
}

/// `gdr_info_v2_t`. The two one-bit fields share one `unsigned`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct GdrInfoV2 {
    va: u64,
    mapped_size: u64,
    page_size: u32,
    tm_cycles: u64,
    cycles_per_ms: u32,
    bits: c_uint,
    mapping_type: c_int,
}

const INFO_MAPPED_BIT: c_uint = 1 << 0;
const INFO_WC_MAPPING_BIT: c_uint = 1 << 1;

/// `gdr_attr_t` values not yet known to the library report `-EINVAL`.
const EINVAL: c_int = 22;

type OpenFn = unsafe extern "C" fn() -> GdrHandle;
type CloseFn = unsafe extern "C" fn(GdrHandle) -> c_int;
type PinBufferFn =
    unsafe extern "C" fn(GdrHandle, c_ulong, usize, u64, u32, *mut GdrMh) -> c_int;
type PinBufferV2Fn = unsafe extern "C" fn(GdrHandle, c_ulong, usize, u32, *mut GdrMh) -> c_int;
type UnpinBufferFn = unsafe extern "C" fn(GdrHandle, GdrMh) -> c_int;
type GetCallbackFlagFn = unsafe extern "C" fn(GdrHandle, GdrMh, *mut c_int) -> c_int;
type GetInfoV2Fn = unsafe extern "C" fn(GdrHandle, GdrMh, *mut GdrInfoV2) -> c_int;
type MapFn = unsafe extern "C" fn(GdrHandle, GdrMh, *mut *mut c_void, usize) -> c_int;
type UnmapFn = unsafe extern "C" fn(GdrHandle, GdrMh, *mut c_void, usize) -> c_int;
type RuntimeGetVersionFn = unsafe extern "C" fn(*mut c_int, *mut c_int);
type DriverGetVersionFn = unsafe extern "C" fn(GdrHandle, *mut c_int, *mut c_int) -> c_int;
type GetAttributeFn = unsafe extern "C" fn(GdrHandle, c_int, *mut c_int) -> c_int;

/// Resolved entry points. Function pointers stay valid while `_library` lives.
struct GdrApi {
    path: PathBuf,
    open: OpenFn,
    close: CloseFn,
    pin_buffer: PinBufferFn,
    pin_buffer_v2: PinBufferV2Fn,
    unpin_buffer: UnpinBufferFn,
    get_callback_flag: GetCallbackFlagFn,
    get_info_v2: GetInfoV2Fn,
    map: MapFn,
    unmap: UnmapFn,
    runtime_get_version: RuntimeGetVersionFn,
    driver_get_version: DriverGetVersionFn,
    get_attribute: GetAttributeFn,
    _library: Library,
}

/// Resolve one symbol and copy the function pointer out.
///
/// # Safety
///
/// `T` must match the symbol's real signature.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T> {
    // SAFETY: Caller guarantees the type matches.
    unsafe {
        library.get::<T>(name).map(|s| *s).map_err(|e| {
            Error::Library(format!(
                "missing symbol {}: {}",
                String::from_utf8_lossy(&name[..name.len() - 1]),
                e
            ))
        })
    }
}

impl GdrApi {
    /// # Safety
    ///
    /// Loading runs the library's initializers; the library must be trusted.
    unsafe fn load(path: &Path) -> Result<Self> {
        // SAFETY: Caller trusts the library.
        let library = unsafe { Library::new(path) }.map_err(|e| Error::DriverUnavailable {
            reason: format!("cannot load {}: {}", path.display(), e),
        })?;

        // SAFETY: Signatures follow gdrapi.h.
        unsafe {
            Ok(Self {
                path: path.to_path_buf(),
                open: symbol(&library, b"gdr_open\0")?,
                close: symbol(&library, b"gdr_close\0")?,
                pin_buffer: symbol(&library, b"gdr_pin_buffer\0")?,
                pin_buffer_v2: symbol(&library, b"gdr_pin_buffer_v2\0")?,
                unpin_buffer: symbol(&library, b"gdr_unpin_buffer\0")?,
                get_callback_flag: symbol(&library, b"gdr_get_callback_flag\0")?,
                get_info_v2: symbol(&library, b"gdr_get_info_v2\0")?,
                map: symbol(&library, b"gdr_map\0")?,
                unmap: symbol(&library, b"gdr_unmap\0")?,
                runtime_get_version: symbol(&library, b"gdr_runtime_get_version\0")?,
                driver_get_version: symbol(&library, b"gdr_driver_get_version\0")?,
                get_attribute: symbol(&library, b"gdr_get_attribute\0")?,
                _library: library,
            })
        }
    }
}

/// Map a library return code to a result.
fn check(op: &'static str, ret: c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Driver { op, code: ret })
    }
}

/// Driver backed by `libgdrapi.so`.
pub struct GdrApiDriver {
    api: Arc<GdrApi>,
    device_node: PathBuf,
}

impl GdrApiDriver {
    /// Load the library following the configured search order.
    ///
    /// # Errors
    ///
    /// - [`Error::DriverUnavailable`] if no candidate could be loaded.
    /// - [`Error::Library`] if a library was found but lacks entry points.
    pub fn load(config: &Config) -> Result<Self> {
        let mut last_err = None;
        for candidate in config.library_candidates() {
            // SAFETY: Candidates come from the caller's configuration.
            match unsafe { GdrApi::load(&candidate) } {
                Ok(api) => {
                    info!(path = %candidate.display(), "loaded GPUDirect copy library");
                    return Ok(Self {
                        api: Arc::new(api),
                        device_node: config.device_node.clone(),
                    });
                }
                Err(e @ Error::Library(_)) => return Err(e),
                Err(e) => {
                    debug!(path = %candidate.display(), error = %e, "library candidate rejected");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::DriverUnavailable {
            reason: format!("{} not found", config.library_name),
        }))
    }

    /// Load the library from an explicit path.
    pub fn load_from_path(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        // SAFETY: The caller named the library explicitly.
        let api = unsafe { GdrApi::load(path.as_ref())? };
        Ok(Self {
            api: Arc::new(api),
            device_node: config.device_node.clone(),
        })
    }

    /// Path the library was loaded from.
    pub fn library_path(&self) -> &Path {
        &self.api.path
    }
}

impl std::fmt::Debug for GdrApiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GdrApiDriver")
            .field("library", &self.api.path)
            .field("device_node", &self.device_node)
            .finish()
    }
}

impl Driver for GdrApiDriver {
    fn name(&self) -> &str {
        "gdrapi"
    }

    fn runtime_version(&self) -> VersionInfo {
        let (mut major, mut minor) = (0, 0);
        // SAFETY: Writes two ints through valid pointers.
        unsafe { (self.api.runtime_get_version)(&mut major, &mut minor) };
        reported_runtime_version(major, minor)
    }

    fn open(&self) -> Result<Box<dyn Connection>> {
        // SAFETY: No preconditions.
        let handle = unsafe { (self.api.open)() };
        match NonNull::new(handle) {
            Some(handle) => Ok(Box::new(GdrApiConnection {
                api: Arc::clone(&self.api),
                handle: Some(handle),
            })),
            None => Err(classify_open_failure(&self.device_node)),
        }
    }
}

struct GdrApiConnection {
    api: Arc<GdrApi>,
    /// `None` once closed.
    handle: Option<NonNull<c_void>>,
}

// SAFETY: gdr_t is a process-wide handle; the library serializes access
// internally, and we only use it through `&mut self`.
unsafe impl Send for GdrApiConnection {}

impl GdrApiConnection {
    fn handle(&self) -> Result<GdrHandle> {
        self.handle
            .map(NonNull::as_ptr)
            .ok_or(Error::SessionClosed)
    }
}

impl Connection for GdrApiConnection {
    fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            // SAFETY: handle came from gdr_open and is closed exactly once.
            Some(handle) => check("close", unsafe { (self.api.close)(handle.as_ptr()) }),
            None => Ok(()),
        }
    }

    fn pin_buffer(
        &mut self,
        addr: u64,
        size: u64,
        p2p_token: u64,
        va_space: u32,
    ) -> Result<PinToken> {
        let g = self.handle()?;
        let (addr, size) = c_args(addr, size)?;
        let mut mh = GdrMh::default();
        // SAFETY: g is open; mh is a valid out-pointer.
        check("pin_buffer", unsafe {
            (self.api.pin_buffer)(g, addr, size, p2p_token, va_space, &mut mh)
        })?;
        Ok(PinToken(mh.h as u64))
    }

    fn pin_buffer_v2(&mut self, addr: u64, size: u64, flags: PinFlags) -> Result<PinToken> {
        let g = self.handle()?;
        let (addr, size) = c_args(addr, size)?;
        let mut mh = GdrMh::default();
        // SAFETY: g is open; mh is a valid out-pointer.
        check("pin_buffer_v2", unsafe {
            (self.api.pin_buffer_v2)(g, addr, size, flags.bits(), &mut mh)
        })?;
        Ok(PinToken(mh.h as u64))
    }

    fn unpin_buffer(&mut self, token: PinToken) -> Result<()> {
        let g = self.handle()?;
        // SAFETY: token came from a pin call on this handle.
        check("unpin_buffer", unsafe {
            (self.api.unpin_buffer)(g, mh(token))
        })
    }

    fn get_info(&mut self, token: PinToken) -> Result<RawInfo> {
        let g = self.handle()?;
        let mut info = GdrInfoV2::default();
        // SAFETY: info is a valid out-pointer of the library's layout.
        check("get_info", unsafe {
            (self.api.get_info_v2)(g, mh(token), &mut info)
        })?;
        Ok(RawInfo {
            va: info.va,
            mapped_size: info.mapped_size,
            page_size: info.page_size,
            tm_cycles: info.tm_cycles,
            cycles_per_ms: info.cycles_per_ms,
            mapped: info.bits & INFO_MAPPED_BIT != 0,
            wc_mapping: info.bits & INFO_WC_MAPPING_BIT != 0,
            mapping_type: u32::try_from(info.mapping_type)
                .ok()
                .and_then(|raw| MappingType::from_raw(raw).ok())
                .unwrap_or_default(),
        })
    }

    fn get_callback_flag(&mut self, token: PinToken) -> Result<bool> {
        let g = self.handle()?;
        let mut flag: c_int = 0;
        // SAFETY: flag is a valid out-pointer.
        check("get_callback_flag", unsafe {
            (self.api.get_callback_flag)(g, mh(token), &mut flag)
        })?;
        Ok(flag != 0)
    }

    fn map(&mut self, token: PinToken, size: usize) -> Result<NonNull<u8>> {
        let g = self.handle()?;
        let mut va: *mut c_void = std::ptr::null_mut();
        // SAFETY: va is a valid out-pointer.
        check("map", unsafe { (self.api.map)(g, mh(token), &mut va, size) })?;
        NonNull::new(va.cast::<u8>()).ok_or(Error::Driver { op: "map", code: -14 })
    }

    unsafe fn unmap(&mut self, token: PinToken, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let g = self.handle()?;
        // SAFETY: Caller guarantees ptr/size came from `map` for this token.
        check("unmap", unsafe {
            (self.api.unmap)(g, mh(token), ptr.as_ptr().cast(), size)
        })
    }

    fn driver_version(&mut self) -> Result<VersionInfo> {
        let g = self.handle()?;
        let (mut major, mut minor) = (0, 0);
        // SAFETY: Valid out-pointers.
        check("driver_version", unsafe {
            (self.api.driver_get_version)(g, &mut major, &mut minor)
        })?;
        VersionInfo::from_c(major, minor)
    }

    fn get_attribute(&mut self, key: AttrKey) -> Result<i32> {
        let g = self.handle()?;
        let mut value: c_int = 0;
        // SAFETY: value is a valid out-pointer.
        let ret = unsafe { (self.api.get_attribute)(g, key.as_raw() as c_int, &mut value) };
        match ret {
            0 => Ok(value),
            r if r == EINVAL || r == -EINVAL => Err(Error::UnsupportedAttribute(key.as_raw())),
            code => Err(Error::Driver {
                op: "get_attribute",
                code,
            }),
        }
    }
}

impl Drop for GdrApiConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing driver connection failed");
        }
    }
}

/// Runtime version from the library's `int` pair, `0.0` if it is negative.
fn reported_runtime_version(major: c_int, minor: c_int) -> VersionInfo {
    VersionInfo::from_c(major, minor).unwrap_or_else(|e| {
        warn!(major, minor, error = %e, "library reported an invalid runtime version");
        VersionInfo::default()
    })
}

#[inline]
fn mh(token: PinToken) -> GdrMh {
    GdrMh {
        h: token.0 as c_ulong,
    }
}

fn c_args(addr: u64, size: u64) -> Result<(c_ulong, usize)> {
    let addr = c_ulong::try_from(addr)
        .map_err(|_| Error::InvalidArgument(format!("address {addr:#x} exceeds unsigned long")))?;
    let size = usize::try_from(size)
        .map_err(|_| Error::InvalidArgument(format!("size {size} exceeds size_t")))?;
    Ok((addr, size))
}

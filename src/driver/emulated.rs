//! Software-emulated device for tests, demos, and CI machines without a GPU.
//!
//! The "device memory" is a memfd exposed at a fixed device base address.
//! Pinning validates the range against the device and the pin granularity;
//! mapping `mmap`s the memfd at the region's device offset, so a mapping
//! window and [`EmulatedDevice::read`]/[`EmulatedDevice::write`] (the
//! equivalent of a device-side memcpy) observe the same bytes.
//!
//! The mapping type the driver reports is configurable, which lets every
//! copy discipline run against real memory. Overlapping pins are accepted
//! and alias the same backing pages.
//!
//! # Example
//!
//! ```rust,ignore
//! use gdrcopy::driver::{EmulatedConfig, EmulatedDriver};
//! use gdrcopy::{MappingType, Session};
//!
//! let driver = EmulatedDriver::new(EmulatedConfig::default().with_mapping_type(MappingType::WriteCombined))?;
//! let device = driver.device();
//! let addr = device.allocate(64 * 1024)?;
//! let session = Session::open_with(driver)?;
//! ```

use super::{Connection, Driver, PinToken, RawInfo, rejected};
use crate::attributes::{AttrKey, VersionInfo};
use crate::defaults::{
    EMULATED_DEVICE_BASE, EMULATED_DEVICE_CAPACITY, EMULATED_DRIVER_VERSION, GPU_PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::mapping::MappingType;
use crate::region::PinFlags;
use rustix::fd::OwnedFd;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Whether the emulated kernel driver accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    /// Connections succeed.
    #[default]
    Available,
    /// The driver behaves as if its module were not loaded.
    Missing,
    /// The driver behaves as if the caller lacked access rights.
    PermissionDenied,
}

/// Configuration for an [`EmulatedDriver`].
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    /// Device address of the first byte of device memory.
    pub base: u64,
    /// Device memory size in bytes.
    pub capacity: u64,
    /// Required alignment of pinned addresses.
    pub granularity: u64,
    /// Mapping type reported for every mapping.
    pub mapping_type: MappingType,
    /// Connection behavior.
    pub availability: Availability,
    /// Value of [`AttrKey::UsePersistentMapping`].
    pub persistent_mapping: bool,
    /// Whether [`PinFlags::FORCE_ALTERNATE_TRANSPORT`] is accepted.
    pub force_alternate_transport: bool,
    /// Reported user-space library version.
    pub runtime_version: VersionInfo,
    /// Reported kernel driver version.
    pub driver_version: VersionInfo,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        let (major, minor) = EMULATED_DRIVER_VERSION;
        Self {
            base: EMULATED_DEVICE_BASE,
            capacity: EMULATED_DEVICE_CAPACITY,
            granularity: GPU_PAGE_SIZE,
            mapping_type: MappingType::WriteCombined,
            availability: Availability::Available,
            persistent_mapping: false,
            force_alternate_transport: true,
            runtime_version: VersionInfo::new(major, minor),
            driver_version: VersionInfo::new(major, minor),
        }
    }
}

impl EmulatedConfig {
    /// Set the device memory size.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the reported mapping type.
    pub fn with_mapping_type(mut self, mapping_type: MappingType) -> Self {
        self.mapping_type = mapping_type;
        self
    }

    /// Set connection behavior.
    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    /// Set the pin granularity (must be a multiple of the host page size).
    pub fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set whether the alternate-transport pin flag is supported.
    pub fn with_force_alternate_transport(mut self, supported: bool) -> Self {
        self.force_alternate_transport = supported;
        self
    }

    /// Set the persistent-mapping attribute.
    pub fn with_persistent_mapping(mut self, persistent: bool) -> Self {
        self.persistent_mapping = persistent;
        self
    }
}

/// The emulated device's memory.
///
/// Shared between the driver and its connections; outlives any session, as
/// real device memory outlives the processes that map it.
pub struct EmulatedDevice {
    fd: OwnedFd,
    base: u64,
    capacity: u64,
    granularity: u64,
    /// Bump cursor for [`allocate`](Self::allocate), as an offset from `base`.
    cursor: AtomicU64,
}

impl EmulatedDevice {
    fn new(base: u64, capacity: u64, granularity: u64) -> Result<Self> {
        let page = rustix::param::page_size() as u64;
        if capacity == 0 {
            return Err(Error::InvalidArgument("device capacity must be > 0".into()));
        }
        if granularity == 0 || granularity % page != 0 {
            return Err(Error::InvalidArgument(format!(
                "granularity {granularity} is not a multiple of the host page size {page}"
            )));
        }
        if base % granularity != 0 {
            return Err(Error::InvalidArgument(format!(
                "device base {base:#x} is not aligned to {granularity}"
            )));
        }
        let capacity = capacity
            .checked_next_multiple_of(granularity)
            .filter(|cap| base.checked_add(*cap).is_some())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("device range {base:#x}+{capacity} overflows"))
            })?;

        let fd = rustix::fs::memfd_create("gdrcopy-emulated", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, capacity)?;

        Ok(Self {
            fd,
            base,
            capacity,
            granularity,
            cursor: AtomicU64::new(0),
        })
    }

    /// Device address of the first byte.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of device memory in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Does `[addr, addr + len)` lie entirely within device memory?
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.base + self.capacity,
            None => false,
        }
    }

    /// Reserve `size` bytes of device memory, aligned to the pin granularity.
    ///
    /// Allocations are never freed; this stands in for the device allocator.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument("allocation size must be > 0".into()));
        }
        let out_of_memory =
            || Error::InvalidArgument(format!("device out of memory for {size} bytes"));
        let rounded = size
            .checked_next_multiple_of(self.granularity)
            .ok_or_else(out_of_memory)?;
        let offset = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                cur.checked_add(rounded).filter(|end| *end <= self.capacity)
            })
            .map_err(|_| out_of_memory())?;
        Ok(self.base + offset)
    }

    /// Copy bytes into device memory without going through a mapping.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut offset = self.offset_of(addr, data.len())?;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rustix::io::pwrite(&self.fd, rest, offset)?;
            if n == 0 {
                return Err(Error::System(Errno::IO));
            }
            rest = &rest[n..];
            offset += n as u64;
        }
        Ok(())
    }

    /// Copy bytes out of device memory without going through a mapping.
    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let mut offset = self.offset_of(addr, out.len())?;
        let mut rest = out;
        while !rest.is_empty() {
            let n = rustix::io::pread(&self.fd, &mut *rest, offset)?;
            if n == 0 {
                return Err(Error::System(Errno::IO));
            }
            rest = &mut std::mem::take(&mut rest)[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn offset_of(&self, addr: u64, len: usize) -> Result<u64> {
        if !self.contains(addr, len as u64) {
            return Err(Error::InvalidArgument(format!(
                "range {addr:#x}+{len} is outside device memory"
            )));
        }
        Ok(addr - self.base)
    }
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity)
            .field("granularity", &self.granularity)
            .finish()
    }
}

/// Software driver backed by an [`EmulatedDevice`].
#[derive(Debug)]
pub struct EmulatedDriver {
    config: EmulatedConfig,
    device: Arc<EmulatedDevice>,
}

impl EmulatedDriver {
    /// Create a driver and its device memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or the memfd cannot be
    /// created.
    pub fn new(config: EmulatedConfig) -> Result<Self> {
        let device = EmulatedDevice::new(config.base, config.capacity, config.granularity)?;
        Ok(Self {
            config,
            device: Arc::new(device),
        })
    }

    /// The device memory, for allocation and device-side reads/writes.
    pub fn device(&self) -> Arc<EmulatedDevice> {
        Arc::clone(&self.device)
    }

    /// The driver configuration.
    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }
}

impl Driver for EmulatedDriver {
    fn name(&self) -> &str {
        "emulated"
    }

    fn runtime_version(&self) -> VersionInfo {
        self.config.runtime_version
    }

    fn open(&self) -> Result<Box<dyn Connection>> {
        match self.config.availability {
            Availability::Available => {}
            Availability::Missing => {
                return Err(Error::DriverUnavailable {
                    reason: "emulated driver module is not loaded".into(),
                });
            }
            Availability::PermissionDenied => {
                return Err(Error::PermissionDenied {
                    reason: "emulated driver refused access".into(),
                });
            }
        }
        Ok(Box::new(EmulatedConnection {
            device: Arc::clone(&self.device),
            config: self.config.clone(),
            pins: HashMap::new(),
            next_token: 1,
        }))
    }
}

/// A live CPU mapping of a pin.
struct EmulatedMapping {
    ptr: NonNull<u8>,
    /// Length passed to mmap (rounded to the host page size).
    map_len: usize,
    /// Length requested by the caller.
    size: usize,
}

struct PinEntry {
    addr: u64,
    mapping: Option<EmulatedMapping>,
}

struct EmulatedConnection {
    device: Arc<EmulatedDevice>,
    config: EmulatedConfig,
    pins: HashMap<u64, PinEntry>,
    next_token: u64,
}

// SAFETY: The mapping pointers refer to shared memfd pages owned by this
// connection; they are only created and destroyed through `&mut self`.
unsafe impl Send for EmulatedConnection {}

impl EmulatedConnection {
    fn pin(&mut self, op: &'static str, addr: u64, size: u64) -> Result<PinToken> {
        if size == 0 || addr % self.config.granularity != 0 || !self.device.contains(addr, size)
        {
            return Err(rejected(op, Errno::INVAL));
        }
        let token = self.next_token;
        self.next_token += 1;
        self.pins.insert(
            token,
            PinEntry {
                addr,
                mapping: None,
            },
        );
        debug!(token, addr = addr, size, "emulated pin");
        Ok(PinToken(token))
    }

    fn entry(&mut self, op: &'static str, token: PinToken) -> Result<&mut PinEntry> {
        self.pins
            .get_mut(&token.0)
            .ok_or_else(|| rejected(op, Errno::INVAL))
    }

    fn release_all(&mut self) {
        for (_, entry) in self.pins.drain() {
            if let Some(m) = entry.mapping {
                // SAFETY: The mapping was created by this connection and is
                // no longer reachable once its pin is dropped.
                unsafe {
                    let _ = rustix::mm::munmap(m.ptr.as_ptr().cast(), m.map_len);
                }
            }
        }
    }
}

impl Connection for EmulatedConnection {
    fn close(&mut self) -> Result<()> {
        self.release_all();
        Ok(())
    }

    fn pin_buffer(
        &mut self,
        addr: u64,
        size: u64,
        _p2p_token: u64,
        _va_space: u32,
    ) -> Result<PinToken> {
        self.pin("pin_buffer", addr, size)
    }

    fn pin_buffer_v2(&mut self, addr: u64, size: u64, flags: PinFlags) -> Result<PinToken> {
        if flags.contains(PinFlags::FORCE_ALTERNATE_TRANSPORT)
            && !self.config.force_alternate_transport
        {
            return Err(rejected("pin_buffer_v2", Errno::INVAL));
        }
        self.pin("pin_buffer_v2", addr, size)
    }

    fn unpin_buffer(&mut self, token: PinToken) -> Result<()> {
        let entry = self.entry("unpin_buffer", token)?;
        if entry.mapping.is_some() {
            return Err(rejected("unpin_buffer", Errno::BUSY));
        }
        self.pins.remove(&token.0);
        Ok(())
    }

    fn get_info(&mut self, token: PinToken) -> Result<RawInfo> {
        let mapping_type = self.config.mapping_type;
        let page_size = u32::try_from(self.config.granularity).unwrap_or(u32::MAX);
        let entry = self.entry("get_info", token)?;
        let (mapped, mapped_size) = match &entry.mapping {
            Some(m) => (true, m.size as u64),
            None => (false, 0),
        };
        Ok(RawInfo {
            va: entry.addr,
            mapped_size,
            page_size,
            tm_cycles: 0,
            cycles_per_ms: 0,
            mapped,
            wc_mapping: mapped && mapping_type == MappingType::WriteCombined,
            mapping_type: if mapped { mapping_type } else { MappingType::None },
        })
    }

    fn get_callback_flag(&mut self, token: PinToken) -> Result<bool> {
        self.entry("get_callback_flag", token)?;
        Ok(!self.config.mapping_type.is_coherent())
    }

    fn map(&mut self, token: PinToken, size: usize) -> Result<NonNull<u8>> {
        let page = rustix::param::page_size();
        let device = Arc::clone(&self.device);
        let entry = self.entry("map", token)?;
        if entry.mapping.is_some() || size == 0 {
            return Err(rejected("map", Errno::INVAL));
        }
        let offset = entry.addr - device.base;
        let map_len = size.div_ceil(page) * page;
        if offset + map_len as u64 > device.capacity {
            return Err(rejected("map", Errno::INVAL));
        }

        // SAFETY: Fresh shared mapping of the memfd; the range was checked
        // against the file size above.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &device.fd,
                offset,
            )
            .map_err(|e| rejected("map", e))?
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| rejected("map", Errno::FAULT))?;

        entry.mapping = Some(EmulatedMapping { ptr, map_len, size });
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, token: PinToken, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let entry = self.entry("unmap", token)?;
        let mapping = match &entry.mapping {
            Some(m) if m.ptr == ptr && m.size == size => m,
            _ => return Err(rejected("unmap", Errno::INVAL)),
        };
        // SAFETY: ptr/map_len describe a live mapping created by `map`.
        unsafe {
            rustix::mm::munmap(mapping.ptr.as_ptr().cast(), mapping.map_len)
                .map_err(|e| rejected("unmap", e))?;
        }
        entry.mapping = None;
        Ok(())
    }

    fn driver_version(&mut self) -> Result<VersionInfo> {
        Ok(self.config.driver_version)
    }

    fn get_attribute(&mut self, key: AttrKey) -> Result<i32> {
        Ok(match key {
            AttrKey::UsePersistentMapping => self.config.persistent_mapping as i32,
            AttrKey::SupportPinFlagForceAlternateTransport => {
                self.config.force_alternate_transport as i32
            }
        })
    }

    fn pin_granularity(&self) -> u64 {
        self.config.granularity
    }
}

impl Drop for EmulatedConnection {
    fn drop(&mut self) {
        self.release_all();
    }
}

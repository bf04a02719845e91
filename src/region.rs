//! Pinned device regions and their lifecycle state machine.
//!
//! ```text
//!            pin / repin              map(size)
//! UNPINNED ─────────────▶ PINNED ─────────────▶ MAPPED
//!     ▲                     │  ▲                  │
//!     └────── unpin() ──────┘  └──── unmap() ─────┘
//! ```
//!
//! Every transition is only legal from its documented predecessor state;
//! anything else fails with [`Error::InvalidState`] and leaves the region
//! untouched. In particular `unpin()` never tears down an active mapping on
//! the caller's behalf.
//!
//! Dropping a region releases whatever it still holds (unmap, then unpin),
//! so device resources are returned on every exit path, including `?`.

use crate::copy::{CopyDirection, CopyEngine};
use crate::driver::{PinToken, RawInfo};
use crate::error::{Error, Result};
use crate::mapping::{MappingType, MappingWindow};
use crate::observability::{record_map, record_pin, record_unmap, record_unpin};
use crate::session::{Session, SessionInner};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Span, debug, warn};

/// Global counter for generating unique region IDs.
static REGION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`PinnedRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    fn next() -> Self {
        Self(REGION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Pin flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PinFlags(u32);

impl PinFlags {
    /// Let the driver choose the transport path.
    pub const DEFAULT: PinFlags = PinFlags(0);
    /// Force the alternate (PCIe) transport path even when a faster
    /// interconnect is available.
    pub const FORCE_ALTERNATE_TRANSPORT: PinFlags = PinFlags(1);

    const ALL_BITS: u32 = 1;

    /// Validate raw flag bits.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(Error::InvalidArgument(format!("unknown pin flags {bits:#x}")));
        }
        Ok(Self(bits))
    }

    /// The raw flag bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set.
    #[inline]
    pub fn contains(self, other: PinFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Lifecycle state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// Not registered with the driver.
    Unpinned,
    /// Registered with the driver; no CPU mapping.
    Pinned,
    /// Registered and mapped into the CPU address space.
    Mapped,
}

impl RegionState {
    /// Lowercase name, used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            RegionState::Unpinned => "unpinned",
            RegionState::Pinned => "pinned",
            RegionState::Mapped => "mapped",
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Region metadata as currently known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Base device address.
    pub va: u64,
    /// Pinned length in bytes.
    pub len: u64,
    /// Bytes currently mapped (0 when unmapped).
    pub mapped_size: u64,
    /// Driver page size.
    pub page_size: u32,
    /// Whether a CPU mapping exists.
    pub mapped: bool,
    /// Whether the mapping is write-combined.
    pub wc_mapping: bool,
    /// Mapping type classification.
    pub mapping_type: MappingType,
    /// Driver timestamp of the pin, in CPU cycles.
    pub tm_cycles: u64,
    /// Calibration for `tm_cycles`.
    pub cycles_per_ms: u32,
}

impl RegionInfo {
    fn from_raw(raw: RawInfo, len: u64) -> Self {
        Self {
            va: raw.va,
            len,
            mapped_size: raw.mapped_size,
            page_size: raw.page_size,
            mapped: raw.mapped,
            wc_mapping: raw.wc_mapping,
            mapping_type: raw.mapping_type,
            tm_cycles: raw.tm_cycles,
            cycles_per_ms: raw.cycles_per_ms,
        }
    }
}

/// Which driver entry point pins the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinRequest {
    Legacy { p2p_token: u64, va_space: u32 },
    V2 { flags: PinFlags },
}

/// A device address range registered with the driver for direct CPU access.
///
/// Created by [`PinnedRegion::pin`] or [`PinnedRegion::pin_v2`] (or the
/// matching [`Session`] methods). A region keeps its session's connection
/// alive, and must be unpinned before the session can close.
pub struct PinnedRegion {
    session: Arc<SessionInner>,
    id: RegionId,
    epoch: u64,
    addr: u64,
    size: u64,
    request: PinRequest,
    token: Option<PinToken>,
    window: Option<MappingWindow>,
    /// Generation of the last mapping; bumps on every map.
    generation: u64,
}

impl PinnedRegion {
    /// Pin `[addr, addr + size)` using the legacy entry point.
    ///
    /// `p2p_token` and `va_space` are passed through to the driver, which
    /// ignores them on current versions; pass `0`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for a zero size, a null or misaligned
    ///   address, an overflowing range, or a `va_space` wider than 32 bits.
    /// - [`Error::Driver`] if the driver rejects the pin.
    /// - [`Error::SessionClosed`] if the session is not open.
    pub fn pin(
        session: &Session,
        addr: u64,
        size: u64,
        p2p_token: u64,
        va_space: u64,
    ) -> Result<Self> {
        let va_space = u32::try_from(va_space)
            .map_err(|_| Error::InvalidArgument(format!("va_space {va_space} exceeds 32 bits")))?;
        Self::pin_with(
            session,
            addr,
            size,
            PinRequest::Legacy {
                p2p_token,
                va_space,
            },
        )
    }

    /// Pin `[addr, addr + size)` with `flags`.
    ///
    /// # Errors
    ///
    /// As [`pin`](Self::pin).
    pub fn pin_v2(session: &Session, addr: u64, size: u64, flags: PinFlags) -> Result<Self> {
        Self::pin_with(session, addr, size, PinRequest::V2 { flags })
    }

    fn pin_with(session: &Session, addr: u64, size: u64, request: PinRequest) -> Result<Self> {
        let inner = Arc::clone(session.inner());
        let epoch = inner.lock().current_epoch().ok_or(Error::SessionClosed)?;
        let mut region = Self {
            session: inner,
            id: RegionId::next(),
            epoch,
            addr,
            size,
            request,
            token: None,
            window: None,
            generation: 0,
        };
        region.pin_inner()?;
        Ok(region)
    }

    /// Pin the same range again after [`unpin`](Self::unpin).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the region is already pinned, plus the
    /// errors of [`pin`](Self::pin).
    pub fn repin(&mut self) -> Result<()> {
        self.pin_inner()
    }

    fn pin_inner(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut state = session.lock();
        let conn = state.connection(Some(self.epoch))?;

        if self.token.is_some() {
            return Err(self.invalid_state("pin"));
        }
        if self.size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }
        if self.addr == 0 {
            return Err(Error::InvalidArgument("device address is null".into()));
        }
        if self.addr.checked_add(self.size).is_none() {
            return Err(Error::InvalidArgument(format!(
                "range {:#x}+{} overflows",
                self.addr, self.size
            )));
        }
        let granularity = conn.pin_granularity();
        if granularity != 0 && self.addr % granularity != 0 {
            return Err(Error::InvalidArgument(format!(
                "device address {:#x} is not aligned to {} bytes",
                self.addr, granularity
            )));
        }

        let _span = session
            .config()
            .tracing
            .region("pin", self.addr, self.size)
            .entered();
        let token = match self.request {
            PinRequest::Legacy {
                p2p_token,
                va_space,
            } => conn.pin_buffer(self.addr, self.size, p2p_token, va_space)?,
            PinRequest::V2 { flags } => conn.pin_buffer_v2(self.addr, self.size, flags)?,
        };

        self.token = Some(token);
        state.register(self.id);
        record_pin();
        debug!(
            region = self.id.as_u64(),
            addr = self.addr,
            size = self.size,
            token = token.0,
            "pinned"
        );
        Ok(())
    }

    /// Release the pin.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if a mapping is active (unmap first) or the
    ///   region is already unpinned.
    /// - [`Error::Driver`] if the driver rejects the request; the region
    ///   stays pinned.
    /// - [`Error::SessionClosed`] if the session was closed.
    pub fn unpin(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut state = session.lock();
        let conn = state.connection(Some(self.epoch))?;

        let token = match (self.token, &self.window) {
            (Some(token), None) => token,
            _ => return Err(self.invalid_state("unpin")),
        };

        let _span = session
            .config()
            .tracing
            .region("unpin", self.addr, self.size)
            .entered();
        conn.unpin_buffer(token)?;

        self.token = None;
        state.release(self.id);
        record_unpin();
        debug!(region = self.id.as_u64(), addr = self.addr, "unpinned");
        Ok(())
    }

    /// Region metadata.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if unpinned.
    pub fn get_info(&self) -> Result<RegionInfo> {
        let mut state = self.session.lock();
        let conn = state.connection(Some(self.epoch))?;
        let token = self.token.ok_or_else(|| self.invalid_state("get_info"))?;
        let raw = conn.get_info(token)?;
        Ok(RegionInfo::from_raw(raw, self.size))
    }

    /// Whether the driver requires an explicit flush/fence around copies.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless mapped.
    pub fn get_callback_flag(&self) -> Result<bool> {
        let mut state = self.session.lock();
        let conn = state.connection(Some(self.epoch))?;
        match (self.token, &self.window) {
            (Some(token), Some(_)) => conn.get_callback_flag(token),
            _ => Err(self.invalid_state("get_callback_flag")),
        }
    }

    /// Map the first `size` bytes of the region into the CPU address space.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] unless currently pinned and not mapped.
    /// - [`Error::SizeMismatch`] if `size` exceeds the region length.
    /// - [`Error::InvalidArgument`] if `size` is zero.
    /// - [`Error::Driver`] if the mapping call fails.
    pub fn map(&mut self, size: usize) -> Result<MappingWindow> {
        let session = Arc::clone(&self.session);
        let mut state = session.lock();
        let conn = state.connection(Some(self.epoch))?;

        let token = match (self.token, &self.window) {
            (Some(token), None) => token,
            _ => return Err(self.invalid_state("map")),
        };
        if size as u64 > self.size {
            return Err(Error::SizeMismatch {
                requested: size as u64,
                capacity: self.size,
            });
        }
        if size == 0 {
            return Err(Error::InvalidArgument("map size must be greater than 0".into()));
        }

        let _span = session
            .config()
            .tracing
            .region("map", self.addr, size as u64)
            .entered();
        let ptr = conn.map(token, size)?;
        let mapping_type = match conn.get_info(token) {
            Ok(info) => info.mapping_type,
            Err(e) => {
                // SAFETY: ptr/size were just returned by map for this token.
                if let Err(undo) = unsafe { conn.unmap(token, ptr, size) } {
                    warn!(region = self.id.as_u64(), error = %undo, "undoing failed map");
                }
                return Err(e);
            }
        };

        self.generation += 1;
        let window = MappingWindow::new(self.id, self.generation, ptr, size, mapping_type);
        self.window = Some(window.clone());
        record_map(mapping_type);
        debug!(
            region = self.id.as_u64(),
            size,
            mapping_type = mapping_type.as_str(),
            "mapped"
        );
        Ok(window)
    }

    /// Tear down the CPU mapping. Every [`MappingWindow`] handle for it
    /// becomes stale.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if not mapped.
    /// - [`Error::Driver`] if the driver rejects the request; the mapping
    ///   stays in place.
    pub fn unmap(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut state = session.lock();
        let conn = state.connection(Some(self.epoch))?;

        let (token, window) = match (self.token, &self.window) {
            (Some(token), Some(window)) => (token, window),
            _ => return Err(self.invalid_state("unmap")),
        };
        let ptr = std::ptr::NonNull::new(window.as_ptr())
            .ok_or_else(|| Error::InvalidArgument("window pointer is null".into()))?;

        let _span = session
            .config()
            .tracing
            .region("unmap", self.addr, window.len() as u64)
            .entered();
        // SAFETY: The window records exactly what map returned; `&mut self`
        // guarantees no copy is in flight.
        unsafe { conn.unmap(token, ptr, window.len())? };

        self.window = None;
        record_unmap();
        debug!(region = self.id.as_u64(), "unmapped");
        Ok(())
    }

    /// Copy `src` to the start of the current mapping.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if not mapped, plus the errors of
    /// [`CopyEngine::copy_to_mapping`].
    pub fn copy_to_mapping(&mut self, src: &[u8]) -> Result<()> {
        let window = self.current_window("copy_to_mapping")?;
        CopyEngine::copy_to_mapping(self, &window, src)
    }

    /// Fill `dst` from the start of the current mapping.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if not mapped, plus the errors of
    /// [`CopyEngine::copy_from_mapping`].
    pub fn copy_from_mapping(&self, dst: &mut [u8]) -> Result<()> {
        let window = self.current_window("copy_from_mapping")?;
        CopyEngine::copy_from_mapping(self, &window, dst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegionState {
        match (self.token, &self.window) {
            (None, _) => RegionState::Unpinned,
            (Some(_), None) => RegionState::Pinned,
            (Some(_), Some(_)) => RegionState::Mapped,
        }
    }

    /// Whether the region is pinned (mapped or not).
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.token.is_some()
    }

    /// Whether a mapping is active.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.window.is_some()
    }

    /// The active mapping window, if any.
    pub fn window(&self) -> Option<&MappingWindow> {
        self.window.as_ref()
    }

    /// Process-unique identifier.
    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Base device address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.addr
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Flags the region is pinned with ([`PinFlags::DEFAULT`] for the legacy form).
    pub fn flags(&self) -> PinFlags {
        match self.request {
            PinRequest::Legacy { .. } => PinFlags::DEFAULT,
            PinRequest::V2 { flags } => flags,
        }
    }

    /// The driver's pin token, while pinned.
    pub fn token(&self) -> Option<PinToken> {
        self.token
    }

    /// Check that `window` is the live mapping of this region.
    pub(crate) fn validate_window(&self, window: &MappingWindow) -> Result<&MappingWindow> {
        if window.region != self.id {
            return Err(Error::InvalidArgument(format!(
                "window belongs to region {}, not {}",
                window.region.as_u64(),
                self.id.as_u64()
            )));
        }
        match &self.window {
            Some(current) if current.generation == window.generation => Ok(current),
            _ => Err(Error::StaleMapping),
        }
    }

    fn current_window(&self, op: &'static str) -> Result<MappingWindow> {
        self.window.clone().ok_or_else(|| self.invalid_state(op))
    }

    fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            op,
            state: self.state().as_str(),
        }
    }

    pub(crate) fn copy_span(
        &self,
        direction: CopyDirection,
        len: usize,
        mapping_type: MappingType,
    ) -> Span {
        self.session.config().tracing.copy(direction, len, mapping_type)
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if self.window.is_some() {
            if let Err(e) = self.unmap() {
                warn!(region = self.id.as_u64(), error = %e, "unmap on drop failed");
                // The driver releases the mapping with the connection.
                self.window = None;
            }
        }
        if self.token.is_some() {
            if let Err(e) = self.unpin() {
                warn!(region = self.id.as_u64(), error = %e, "unpin on drop failed");
                self.token = None;
                self.session.lock().release(self.id);
            }
        }
    }
}

impl fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("flags", &self.flags())
            .field("state", &self.state())
            .finish()
    }
}

//! Fenced copies between host buffers and mapping windows.
//!
//! [`CopyEngine`] is stateless: each call validates the window against its
//! region, checks bounds before touching a single byte, then moves the data
//! under the [`FlushDiscipline`](crate::mapping::FlushDiscipline) of the
//! window's mapping type.
//!
//! | Mapping type     | Before read | Access            | After write |
//! |------------------|-------------|-------------------|-------------|
//! | `Caching`        | none        | plain copy        | none        |
//! | `WriteCombined`  | load fence  | plain copy        | store fence |
//! | `Device`         | full fence  | volatile words    | full fence  |
//! | `None`           | full fence  | plain copy        | full fence  |
//!
//! Copies are synchronous: when a write returns, its bytes are visible to
//! the device.
//!
//! # Example
//!
//! ```rust,ignore
//! use gdrcopy::CopyEngine;
//!
//! let window = region.map(4096)?;
//! CopyEngine::copy_to_mapping(&mut region, &window, &data)?;
//! CopyEngine::copy_from_mapping(&region, &window, &mut readback)?;
//! ```

use crate::error::{Error, Result};
use crate::mapping::{Fence, MappingType, MappingWindow};
use crate::observability::{record_copy, record_copy_error};
use crate::region::PinnedRegion;
use std::fmt;
use std::mem::size_of;
use std::time::Instant;

/// Direction of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    /// Host buffer into the mapping window.
    HostToDevice,
    /// Mapping window into a host buffer.
    DeviceToHost,
}

impl CopyDirection {
    /// Short label, used for metrics and spans.
    pub fn as_str(self) -> &'static str {
        match self {
            CopyDirection::HostToDevice => "h2d",
            CopyDirection::DeviceToHost => "d2h",
        }
    }
}

impl fmt::Display for CopyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One copy request: direction plus the window range it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDescriptor {
    /// Direction of the transfer.
    pub direction: CopyDirection,
    /// Byte offset into the window.
    pub offset: usize,
    /// Number of bytes.
    pub len: usize,
}

impl CopyDescriptor {
    /// Create a descriptor.
    pub fn new(direction: CopyDirection, offset: usize, len: usize) -> Self {
        Self {
            direction,
            offset,
            len,
        }
    }

    /// Check that the range fits in a window of `window_len` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `offset + len` exceeds `window_len`.
    pub fn validate(&self, window_len: usize) -> Result<()> {
        match self.offset.checked_add(self.len) {
            Some(end) if end <= window_len => Ok(()),
            _ => Err(Error::SizeMismatch {
                requested: (self.offset as u64).saturating_add(self.len as u64),
                capacity: window_len as u64,
            }),
        }
    }
}

/// Copies between host memory and mapping windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyEngine;

impl CopyEngine {
    /// Copy `src` to the start of `window`.
    ///
    /// # Errors
    ///
    /// - [`Error::StaleMapping`] if `window` was unmapped.
    /// - [`Error::InvalidArgument`] if `window` belongs to another region.
    /// - [`Error::SizeMismatch`] if `src` is longer than the window.
    pub fn copy_to_mapping(
        region: &mut PinnedRegion,
        window: &MappingWindow,
        src: &[u8],
    ) -> Result<()> {
        Self::copy_to_mapping_at(region, window, 0, src)
    }

    /// Copy `src` into `window` starting at `offset`.
    ///
    /// # Errors
    ///
    /// As [`copy_to_mapping`](Self::copy_to_mapping), with the bound being
    /// `offset + src.len()`.
    pub fn copy_to_mapping_at(
        region: &mut PinnedRegion,
        window: &MappingWindow,
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        let desc = CopyDescriptor::new(CopyDirection::HostToDevice, offset, src.len());
        let live = Self::prepare(region, window, &desc)?;
        let span = region.copy_span(desc.direction, desc.len, live.mapping_type());
        let _enter = span.enter();
        let start = Instant::now();
        // SAFETY: The window is the region's live mapping, `&mut region`
        // excludes transitions and other writers, and the range was checked
        // against the mapped size.
        unsafe { write_window(live.as_ptr().add(offset), src, live.mapping_type()) };
        record_copy(desc.direction, live.mapping_type(), src.len(), start.elapsed());
        Ok(())
    }

    /// Fill `dst` from the start of `window`.
    ///
    /// # Errors
    ///
    /// - [`Error::StaleMapping`] if `window` was unmapped.
    /// - [`Error::InvalidArgument`] if `window` belongs to another region.
    /// - [`Error::SizeMismatch`] if `dst` is longer than the window.
    pub fn copy_from_mapping(
        region: &PinnedRegion,
        window: &MappingWindow,
        dst: &mut [u8],
    ) -> Result<()> {
        Self::copy_from_mapping_at(region, window, 0, dst)
    }

    /// Fill `dst` from `window` starting at `offset`.
    ///
    /// # Errors
    ///
    /// As [`copy_from_mapping`](Self::copy_from_mapping), with the bound
    /// being `offset + dst.len()`.
    pub fn copy_from_mapping_at(
        region: &PinnedRegion,
        window: &MappingWindow,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        let desc = CopyDescriptor::new(CopyDirection::DeviceToHost, offset, dst.len());
        let live = Self::prepare(region, window, &desc)?;
        let span = region.copy_span(desc.direction, desc.len, live.mapping_type());
        let _enter = span.enter();
        let start = Instant::now();
        // SAFETY: The window is the region's live mapping and the borrow of
        // `region` excludes unmapping; the range was checked.
        unsafe { read_window(dst, live.as_ptr().add(offset), live.mapping_type()) };
        record_copy(desc.direction, live.mapping_type(), dst.len(), start.elapsed());
        Ok(())
    }

    /// Copy `size` bytes from `host_ptr` to the start of `window`.
    ///
    /// # Safety
    ///
    /// `host_ptr` must be valid for reads of `size` bytes and must not
    /// overlap the window.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a null `host_ptr`, plus the errors of
    /// [`copy_to_mapping`](Self::copy_to_mapping).
    pub unsafe fn copy_to_mapping_raw(
        region: &mut PinnedRegion,
        window: &MappingWindow,
        host_ptr: *const u8,
        size: usize,
    ) -> Result<()> {
        if host_ptr.is_null() {
            return Err(Error::InvalidArgument("host pointer is null".into()));
        }
        // SAFETY: Upheld by the caller.
        let src = unsafe { std::slice::from_raw_parts(host_ptr, size) };
        Self::copy_to_mapping(region, window, src)
    }

    /// Copy `size` bytes from the start of `window` to `host_ptr`.
    ///
    /// # Safety
    ///
    /// `host_ptr` must be valid for writes of `size` bytes, must not be
    /// aliased for the duration of the call, and must not overlap the window.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a null `host_ptr`, plus the errors of
    /// [`copy_from_mapping`](Self::copy_from_mapping).
    pub unsafe fn copy_from_mapping_raw(
        region: &PinnedRegion,
        window: &MappingWindow,
        host_ptr: *mut u8,
        size: usize,
    ) -> Result<()> {
        if host_ptr.is_null() {
            return Err(Error::InvalidArgument("host pointer is null".into()));
        }
        // SAFETY: Upheld by the caller.
        let dst = unsafe { std::slice::from_raw_parts_mut(host_ptr, size) };
        Self::copy_from_mapping(region, window, dst)
    }

    /// Validate the handle and bounds. Nothing is copied on failure.
    fn prepare<'r>(
        region: &'r PinnedRegion,
        window: &MappingWindow,
        desc: &CopyDescriptor,
    ) -> Result<&'r MappingWindow> {
        let checked = region
            .validate_window(window)
            .and_then(|live| desc.validate(live.len()).map(|()| live));
        if checked.is_err() {
            record_copy_error(desc.direction);
        }
        checked
    }
}

/// Issue a memory barrier.
#[inline]
fn fence(kind: Fence) {
    match kind {
        Fence::None => {}
        #[cfg(target_arch = "x86_64")]
        // SAFETY: SSE2 is part of the x86_64 baseline.
        Fence::Load => unsafe { std::arch::x86_64::_mm_lfence() },
        #[cfg(target_arch = "x86_64")]
        Fence::Store => unsafe { std::arch::x86_64::_mm_sfence() },
        #[cfg(target_arch = "x86_64")]
        Fence::Full => unsafe { std::arch::x86_64::_mm_mfence() },
        #[cfg(not(target_arch = "x86_64"))]
        Fence::Load => std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire),
        #[cfg(not(target_arch = "x86_64"))]
        Fence::Store => std::sync::atomic::fence(std::sync::atomic::Ordering::Release),
        #[cfg(not(target_arch = "x86_64"))]
        Fence::Full => std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst),
    }
}

/// Write `src` to `dst` under the discipline of `mapping_type`.
///
/// # Safety
///
/// `dst` must be valid for writes of `src.len()` bytes and not overlap `src`.
unsafe fn write_window(dst: *mut u8, src: &[u8], mapping_type: MappingType) {
    let discipline = mapping_type.discipline();
    if discipline.volatile {
        // SAFETY: Forwarded from the caller.
        unsafe { volatile_write(dst, src) };
    } else {
        // SAFETY: Forwarded from the caller.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }
    fence(discipline.after_write);
}

/// Fill `dst` from `src` under the discipline of `mapping_type`.
///
/// # Safety
///
/// `src` must be valid for reads of `dst.len()` bytes and not overlap `dst`.
unsafe fn read_window(dst: &mut [u8], src: *const u8, mapping_type: MappingType) {
    let discipline = mapping_type.discipline();
    fence(discipline.before_read);
    if discipline.volatile {
        // SAFETY: Forwarded from the caller.
        unsafe { volatile_read(dst, src) };
    } else {
        // SAFETY: Forwarded from the caller.
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }
}

const WORD: usize = size_of::<usize>();

/// Number of leading bytes before `ptr` reaches word alignment, capped at `len`.
#[inline]
fn head_len(ptr: *const u8, len: usize) -> usize {
    ptr.align_offset(WORD).min(len)
}

/// Volatile copy into device memory: byte accesses up to the first aligned
/// word, aligned word stores, then trailing bytes.
///
/// # Safety
///
/// `dst` must be valid for writes of `src.len()` bytes.
unsafe fn volatile_write(dst: *mut u8, src: &[u8]) {
    let head = head_len(dst, src.len());
    let (head_src, rest) = src.split_at(head);
    for (i, &b) in head_src.iter().enumerate() {
        // SAFETY: i < head <= src.len().
        unsafe { dst.add(i).write_volatile(b) };
    }
    let words = rest.len() / WORD;
    // SAFETY: dst + head is word aligned and in bounds.
    let word_dst = unsafe { dst.add(head) }.cast::<usize>();
    for w in 0..words {
        // SAFETY: Host bytes may be unaligned; the device side is aligned.
        unsafe {
            let v = rest.as_ptr().add(w * WORD).cast::<usize>().read_unaligned();
            word_dst.add(w).write_volatile(v);
        }
    }
    let done = head + words * WORD;
    for (i, &b) in src[done..].iter().enumerate() {
        // SAFETY: done + i < src.len().
        unsafe { dst.add(done + i).write_volatile(b) };
    }
}

/// Volatile copy out of device memory, mirroring [`volatile_write`].
///
/// # Safety
///
/// `src` must be valid for reads of `dst.len()` bytes.
unsafe fn volatile_read(dst: &mut [u8], src: *const u8) {
    let len = dst.len();
    let head = head_len(src, len);
    for (i, b) in dst[..head].iter_mut().enumerate() {
        // SAFETY: i < head <= len.
        *b = unsafe { src.add(i).read_volatile() };
    }
    let words = (len - head) / WORD;
    // SAFETY: src + head is word aligned and in bounds.
    let word_src = unsafe { src.add(head) }.cast::<usize>();
    for w in 0..words {
        // SAFETY: Device side aligned; host side written unaligned.
        unsafe {
            let v = word_src.add(w).read_volatile();
            dst.as_mut_ptr().add(head + w * WORD).cast::<usize>().write_unaligned(v);
        }
    }
    let done = head + words * WORD;
    for (i, b) in dst[done..].iter_mut().enumerate() {
        // SAFETY: done + i < len.
        *b = unsafe { src.add(done + i).read_volatile() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_descriptor_bounds() {
        let d = CopyDescriptor::new(CopyDirection::HostToDevice, 0, 4096);
        assert!(d.validate(4096).is_ok());
        assert!(matches!(
            d.validate(4095),
            Err(Error::SizeMismatch {
                requested: 4096,
                capacity: 4095
            })
        ));

        let d = CopyDescriptor::new(CopyDirection::DeviceToHost, 4000, 97);
        assert!(matches!(d.validate(4096), Err(Error::SizeMismatch { .. })));

        let d = CopyDescriptor::new(CopyDirection::DeviceToHost, usize::MAX, 2);
        assert!(matches!(
            d.validate(4096),
            Err(Error::SizeMismatch {
                requested: _,
                capacity: 4096
            })
        ));

        let d = CopyDescriptor::new(CopyDirection::DeviceToHost, 4096, 0);
        assert!(d.validate(4096).is_ok());
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(CopyDirection::HostToDevice.as_str(), "h2d");
        assert_eq!(CopyDirection::DeviceToHost.to_string(), "d2h");
    }

    #[test]
    fn test_window_round_trip_every_type() {
        // Unaligned offsets and lengths exercise the head/word/tail split.
        for ty in MappingType::ALL {
            for (offset, len) in [(0, 1), (1, 7), (3, 64), (5, 1000), (0, 4096)] {
                let mut device = vec![0u64; 4096 / 8 + 2];
                let base = device.as_mut_ptr().cast::<u8>();
                let src = pattern(len);
                let mut dst = vec![0u8; len];
                unsafe {
                    write_window(base.add(offset), &src, ty);
                    read_window(&mut dst, base.add(offset), ty);
                }
                assert_eq!(src, dst, "type {ty} offset {offset} len {len}");
            }
        }
    }

    #[test]
    fn test_volatile_write_leaves_neighbours() {
        let mut device = [0xAAu8; 64];
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        unsafe { volatile_write(device.as_mut_ptr().add(3), &src) };
        assert_eq!(&device[..3], &[0xAA; 3]);
        assert_eq!(&device[3..14], &src);
        assert!(device[14..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_fences_do_not_panic() {
        for f in [Fence::None, Fence::Load, Fence::Store, Fence::Full] {
            fence(f);
        }
    }
}

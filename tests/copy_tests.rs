//! Integration tests for copies through mapping windows.

use gdrcopy::driver::{EmulatedConfig, EmulatedDevice, EmulatedDriver};
use gdrcopy::{CopyEngine, Error, MappingType, PinnedRegion, RegionState, Session};
use std::sync::Arc;

struct Fixture {
    session: Session,
    device: Arc<EmulatedDevice>,
}

impl Fixture {
    fn new(mapping_type: MappingType) -> Self {
        let driver =
            EmulatedDriver::new(EmulatedConfig::default().with_mapping_type(mapping_type))
                .unwrap();
        let device = driver.device();
        Self {
            session: Session::open_with(driver).unwrap(),
            device,
        }
    }

    fn pin(&self, size: u64) -> PinnedRegion {
        let addr = self.device.allocate(size).unwrap();
        self.session.pin(addr, size).unwrap()
    }
}

fn incrementing(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

// ============================================================================
// Round Trips
// ============================================================================

/// The 4096-byte incrementing-pattern scenario, end to end.
#[test]
fn test_incrementing_pattern_scenario() {
    let fx = Fixture::new(MappingType::WriteCombined);
    let mut region = fx.pin(4096);
    let window = region.map(4096).unwrap();

    let pattern = incrementing(4096);
    CopyEngine::copy_to_mapping(&mut region, &window, &pattern).unwrap();
    let mut readback = vec![0u8; 4096];
    CopyEngine::copy_from_mapping(&region, &window, &mut readback).unwrap();
    assert_eq!(pattern, readback);

    region.unmap().unwrap();
    region.unpin().unwrap();
    assert_eq!(region.state(), RegionState::Unpinned);
}

/// Every size from 1 byte up to the full window round-trips, for every
/// mapping type.
#[test]
fn test_round_trip_all_sizes_all_types() {
    for ty in MappingType::ALL {
        let fx = Fixture::new(ty);
        let mut region = fx.pin(4096);
        let window = region.map(4096).unwrap();
        assert_eq!(window.mapping_type(), ty);

        for n in 1..=4096usize {
            let src: Vec<u8> = (0..n).map(|i| (i.wrapping_mul(31) ^ n) as u8).collect();
            CopyEngine::copy_to_mapping(&mut region, &window, &src).unwrap();
            let mut dst = vec![0u8; n];
            CopyEngine::copy_from_mapping(&region, &window, &mut dst).unwrap();
            assert_eq!(src, dst, "mapping type {ty}, size {n}");
        }
    }
}

/// Window writes land in device memory and device writes show through.
#[test]
fn test_window_is_device_memory() {
    for ty in MappingType::ALL {
        let fx = Fixture::new(ty);
        let mut region = fx.pin(4096);
        let addr = region.address();
        let window = region.map(4096).unwrap();

        CopyEngine::copy_to_mapping_at(&mut region, &window, 100, b"to device").unwrap();
        let mut seen = [0u8; 9];
        fx.device.read(addr + 100, &mut seen).unwrap();
        assert_eq!(&seen, b"to device");

        fx.device.write(addr + 2000, b"from device").unwrap();
        let mut out = [0u8; 11];
        CopyEngine::copy_from_mapping_at(&region, &window, 2000, &mut out).unwrap();
        assert_eq!(&out, b"from device");
    }
}

/// Region conveniences copy through the current window.
#[test]
fn test_region_copy_helpers() {
    let fx = Fixture::new(MappingType::Caching);
    let mut region = fx.pin(4096);
    assert!(matches!(
        region.copy_to_mapping(b"early"),
        Err(Error::InvalidState {
            op: "copy_to_mapping",
            ..
        })
    ));

    region.map(4096).unwrap();
    region.copy_to_mapping(b"hello").unwrap();
    let mut out = [0u8; 5];
    region.copy_from_mapping(&mut out).unwrap();
    assert_eq!(&out, b"hello");

    region.unmap().unwrap();
    assert!(matches!(
        region.copy_from_mapping(&mut out),
        Err(Error::InvalidState { .. })
    ));
}

/// Raw pointer forms match the slice forms and reject null.
#[test]
fn test_raw_pointer_copies() {
    let fx = Fixture::new(MappingType::Device);
    let mut region = fx.pin(4096);
    let window = region.map(4096).unwrap();

    let src = incrementing(300);
    let mut dst = vec![0u8; 300];
    unsafe {
        CopyEngine::copy_to_mapping_raw(&mut region, &window, src.as_ptr(), src.len()).unwrap();
        CopyEngine::copy_from_mapping_raw(&region, &window, dst.as_mut_ptr(), dst.len()).unwrap();
    }
    assert_eq!(src, dst);

    let err = unsafe {
        CopyEngine::copy_to_mapping_raw(&mut region, &window, std::ptr::null(), 8)
    };
    assert!(matches!(err, Err(Error::InvalidArgument(_))));
}

// ============================================================================
// Rejected Copies
// ============================================================================

/// Copying one byte more than the window is rejected and writes nothing.
#[test]
fn test_oversized_copy_leaves_device_unchanged() {
    for ty in MappingType::ALL {
        let fx = Fixture::new(ty);
        let mut region = fx.pin(4096);
        let addr = region.address();
        let window = region.map(4096).unwrap();

        let before = incrementing(4096);
        fx.device.write(addr, &before).unwrap();

        let too_big = vec![0xFFu8; 4097];
        assert!(matches!(
            CopyEngine::copy_to_mapping(&mut region, &window, &too_big),
            Err(Error::SizeMismatch {
                requested: 4097,
                capacity: 4096
            })
        ));

        let mut after = vec![0u8; 4096];
        fx.device.read(addr, &mut after).unwrap();
        assert_eq!(before, after, "mapping type {ty}");
    }
}

/// Oversized reads fail before touching the host buffer.
#[test]
fn test_oversized_read_leaves_host_unchanged() {
    let fx = Fixture::new(MappingType::WriteCombined);
    let mut region = fx.pin(4096);
    let window = region.map(1024).unwrap();

    let mut host = vec![0x11u8; 1025];
    assert!(matches!(
        CopyEngine::copy_from_mapping(&region, &window, &mut host),
        Err(Error::SizeMismatch { .. })
    ));
    assert!(host.iter().all(|&b| b == 0x11));

    let mut tail = [0u8; 8];
    assert!(matches!(
        CopyEngine::copy_from_mapping_at(&region, &window, 1020, &mut tail),
        Err(Error::SizeMismatch { .. })
    ));
}

/// A window used after unmap is stale, even once the region is remapped.
#[test]
fn test_stale_window() {
    let fx = Fixture::new(MappingType::WriteCombined);
    let mut region = fx.pin(4096);
    let old = region.map(4096).unwrap();
    region.unmap().unwrap();

    assert!(matches!(
        CopyEngine::copy_to_mapping(&mut region, &old, b"x"),
        Err(Error::StaleMapping)
    ));

    let fresh = region.map(4096).unwrap();
    let mut out = [0u8; 1];
    assert!(matches!(
        CopyEngine::copy_from_mapping(&region, &old, &mut out),
        Err(Error::StaleMapping)
    ));
    CopyEngine::copy_from_mapping(&region, &fresh, &mut out).unwrap();
}

/// A window cannot be used with a region it does not belong to.
#[test]
fn test_window_from_other_region() {
    let fx = Fixture::new(MappingType::Caching);
    let mut a = fx.pin(4096);
    let mut b = fx.pin(4096);
    let wa = a.map(4096).unwrap();
    b.map(4096).unwrap();

    assert!(matches!(
        CopyEngine::copy_to_mapping(&mut b, &wa, b"x"),
        Err(Error::InvalidArgument(_))
    ));
}

/// Empty copies succeed without moving anything.
#[test]
fn test_empty_copy() {
    let fx = Fixture::new(MappingType::Device);
    let mut region = fx.pin(4096);
    let window = region.map(4096).unwrap();
    CopyEngine::copy_to_mapping(&mut region, &window, &[]).unwrap();
    CopyEngine::copy_from_mapping_at(&region, &window, 4096, &mut []).unwrap();
}

//! Integration tests for the pin → map → unmap → unpin lifecycle.
//!
//! These run against the emulated driver, so they exercise the real state
//! machine and real CPU mappings without an accelerator.

use gdrcopy::driver::{EmulatedConfig, EmulatedDriver};
use gdrcopy::{CopyEngine, Error, MappingType, PinFlags, RegionState, Session};

fn open() -> (Session, u64) {
    let driver = EmulatedDriver::new(EmulatedConfig::default()).unwrap();
    let base = driver.device().base();
    (Session::open_with(driver).unwrap(), base)
}

// ============================================================================
// Pin / Unpin
// ============================================================================

/// Pin then unpin, repeated on the same range, never fails.
#[test]
fn test_pin_unpin_repeatable() {
    let (session, base) = open();
    for _ in 0..32 {
        let mut region = session.pin_buffer_v2(base, 4096, PinFlags::DEFAULT).unwrap();
        assert_eq!(region.state(), RegionState::Pinned);
        region.unpin().unwrap();
        assert_eq!(region.state(), RegionState::Unpinned);
    }
    assert_eq!(session.live_regions(), 0);
    session.close().unwrap();
}

/// Unpin twice is an invalid transition, not a driver error.
#[test]
fn test_double_unpin_is_invalid_state() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    region.unpin().unwrap();
    assert!(matches!(
        region.unpin(),
        Err(Error::InvalidState {
            op: "unpin",
            state: "unpinned"
        })
    ));
}

/// Legacy pin path behaves like the flagged one.
#[test]
fn test_legacy_pin() {
    let (session, base) = open();
    let mut region = session.pin_buffer(base, 8192, 0, 0).unwrap();
    let info = region.get_info().unwrap();
    assert_eq!(info.va, base);
    assert_eq!(info.len, 8192);
    region.unpin().unwrap();
}

/// A range outside device memory is rejected by the driver with its code.
#[test]
fn test_driver_rejects_unknown_range() {
    let (session, base) = open();
    let capacity = 16 * 1024 * 1024;
    let err = session.pin(base + capacity, 4096).unwrap_err();
    assert!(matches!(err, Error::Driver { code: -22, .. }));
    assert_eq!(err.code(), Some(-22));
    assert_eq!(session.live_regions(), 0);
}

/// Forcing the alternate transport fails on drivers that do not support it.
#[test]
fn test_force_flag_unsupported() {
    let driver = EmulatedDriver::new(
        EmulatedConfig::default().with_force_alternate_transport(false),
    )
    .unwrap();
    let base = driver.device().base();
    let session = Session::open_with(driver).unwrap();

    assert!(matches!(
        session.pin_buffer_v2(base, 4096, PinFlags::FORCE_ALTERNATE_TRANSPORT),
        Err(Error::Driver { .. })
    ));
    assert!(session.pin_buffer_v2(base, 4096, PinFlags::DEFAULT).is_ok());
}

/// Overlapping pins are accepted and see the same memory.
#[test]
fn test_overlapping_pins_alias() {
    let (session, base) = open();
    let mut a = session.pin(base, 8192).unwrap();
    let mut b = session.pin(base, 4096).unwrap();
    let wa = a.map(8192).unwrap();
    let wb = b.map(4096).unwrap();

    CopyEngine::copy_to_mapping(&mut a, &wa, &[0x5A; 16]).unwrap();
    let mut out = [0u8; 16];
    CopyEngine::copy_from_mapping(&b, &wb, &mut out).unwrap();
    assert_eq!(out, [0x5A; 16]);
}

// ============================================================================
// Map / Unmap
// ============================================================================

/// Map before pin always fails with an invalid-state error.
#[test]
fn test_map_before_pin() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    region.unpin().unwrap();
    assert!(matches!(
        region.map(4096),
        Err(Error::InvalidState {
            op: "map",
            state: "unpinned"
        })
    ));
}

/// Mapping more than the pinned length is a size mismatch.
#[test]
fn test_map_too_large() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    assert!(matches!(
        region.map(4097),
        Err(Error::SizeMismatch {
            requested: 4097,
            capacity: 4096
        })
    ));
    assert_eq!(region.state(), RegionState::Pinned);
    // A smaller window is fine.
    let window = region.map(100).unwrap();
    assert_eq!(window.len(), 100);
}

/// Unpin while mapped is refused and the mapping stays usable.
#[test]
fn test_unpin_while_mapped() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    let window = region.map(4096).unwrap();

    assert!(matches!(
        region.unpin(),
        Err(Error::InvalidState {
            op: "unpin",
            state: "mapped"
        })
    ));
    assert_eq!(region.state(), RegionState::Mapped);

    CopyEngine::copy_to_mapping(&mut region, &window, b"still mapped").unwrap();
    region.unmap().unwrap();
    region.unpin().unwrap();
}

/// Unmap without a mapping is an invalid transition.
#[test]
fn test_unmap_when_pinned() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    assert!(matches!(
        region.unmap(),
        Err(Error::InvalidState {
            op: "unmap",
            state: "pinned"
        })
    ));
}

/// The mapping type reported by the driver is carried by the window.
#[test]
fn test_window_reports_mapping_type() {
    for ty in [
        MappingType::WriteCombined,
        MappingType::Caching,
        MappingType::Device,
    ] {
        let driver =
            EmulatedDriver::new(EmulatedConfig::default().with_mapping_type(ty)).unwrap();
        let base = driver.device().base();
        let session = Session::open_with(driver).unwrap();
        let mut region = session.pin(base, 4096).unwrap();
        let window = region.map(4096).unwrap();
        assert_eq!(window.mapping_type(), ty);
        let info = region.get_info().unwrap();
        assert_eq!(info.mapping_type, ty);
        assert_eq!(info.wc_mapping, ty == MappingType::WriteCombined);
        assert_eq!(region.get_callback_flag().unwrap(), !ty.is_coherent());
    }
}

/// Remapping after unmap yields a fresh window.
#[test]
fn test_remap_cycle() {
    let (session, base) = open();
    let mut region = session.pin(base, 4096).unwrap();
    for i in 0..8u8 {
        let window = region.map(4096).unwrap();
        CopyEngine::copy_to_mapping(&mut region, &window, &[i; 32]).unwrap();
        let mut out = [0u8; 32];
        CopyEngine::copy_from_mapping(&region, &window, &mut out).unwrap();
        assert_eq!(out, [i; 32]);
        region.unmap().unwrap();
    }
    region.unpin().unwrap();
}

// ============================================================================
// Drop
// ============================================================================

/// Dropping mapped and pinned regions releases them, so close succeeds.
#[test]
fn test_drop_releases_everything() {
    let (session, base) = open();
    {
        let mut mapped = session.pin(base, 4096).unwrap();
        mapped.map(4096).unwrap();
        let _pinned = session.pin(base + 65536, 4096).unwrap();
        assert_eq!(session.live_regions(), 2);
    }
    assert_eq!(session.live_regions(), 0);
    session.close().unwrap();
}

/// Early returns through `?` still release the region.
#[test]
fn test_drop_on_error_path() {
    fn failing(session: &Session, base: u64) -> gdrcopy::Result<()> {
        let mut region = session.pin(base, 4096)?;
        region.map(8192)?;
        Ok(())
    }

    let (session, base) = open();
    assert!(matches!(
        failing(&session, base),
        Err(Error::SizeMismatch { .. })
    ));
    assert_eq!(session.live_regions(), 0);
}

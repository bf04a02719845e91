//! Integration tests for sessions and attribute queries.

use gdrcopy::driver::{Availability, EmulatedConfig, EmulatedDriver};
use gdrcopy::{AttrKey, Config, Error, PinFlags, Session, VersionInfo};

fn emulated(config: EmulatedConfig) -> (EmulatedDriver, u64) {
    let driver = EmulatedDriver::new(config).unwrap();
    let base = driver.device().base();
    (driver, base)
}

// ============================================================================
// Open / Close
// ============================================================================

/// Closing with a live region is a leak; unpinning it lets close succeed.
#[test]
fn test_close_with_live_region() {
    let (driver, base) = emulated(EmulatedConfig::default());
    let session = Session::open_with(driver).unwrap();
    let mut region = session.pin(base, 4096).unwrap();

    assert!(matches!(
        session.close(),
        Err(Error::ResourceLeak { live_regions: 1 })
    ));
    assert!(session.is_open());

    region.unpin().unwrap();
    session.close().unwrap();
    assert!(!session.is_open());
}

/// A region from a closed epoch reports the closed session, even after reopen.
#[test]
fn test_region_outlives_epoch() {
    let (driver, base) = emulated(EmulatedConfig::default());
    let session = Session::open_with(driver).unwrap();
    let mut region = session.pin(base, 4096).unwrap();
    region.unpin().unwrap();
    session.close().unwrap();

    assert!(matches!(region.repin(), Err(Error::SessionClosed)));
    assert!(matches!(region.get_info(), Err(Error::SessionClosed)));

    session.open().unwrap();
    assert!(matches!(region.repin(), Err(Error::SessionClosed)));

    // New regions work in the new epoch.
    let mut fresh = session.pin(base, 4096).unwrap();
    fresh.unpin().unwrap();
}

/// Pinning on a closed session fails without touching the driver.
#[test]
fn test_pin_on_closed_session() {
    let (driver, base) = emulated(EmulatedConfig::default());
    let session = Session::new(driver);
    assert!(matches!(session.pin(base, 4096), Err(Error::SessionClosed)));
    assert!(matches!(session.pin_granularity(), Err(Error::SessionClosed)));
}

/// Missing and inaccessible drivers map to distinct errors.
#[test]
fn test_unavailable_driver() {
    let (missing, _) = emulated(EmulatedConfig::default().with_availability(Availability::Missing));
    let err = Session::open_with(missing).unwrap_err();
    assert!(matches!(err, Error::DriverUnavailable { .. }));

    let (denied, _) =
        emulated(EmulatedConfig::default().with_availability(Availability::PermissionDenied));
    let err = Session::open_with(denied).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
}

/// The configured default flags are used by `Session::pin`.
#[test]
fn test_default_pin_flags_from_config() {
    let (driver, base) = emulated(EmulatedConfig::default());
    let config = Config::default().with_default_pin_flags(PinFlags::FORCE_ALTERNATE_TRANSPORT);
    let session = Session::with_config(driver, config);
    session.open().unwrap();

    let region = session.pin(base, 4096).unwrap();
    assert_eq!(region.flags(), PinFlags::FORCE_ALTERNATE_TRANSPORT);
}

/// Sessions and their regions can be used from other threads.
#[test]
fn test_session_is_send_sync() {
    let (driver, base) = emulated(EmulatedConfig::default());
    let session = std::sync::Arc::new(Session::open_with(driver).unwrap());

    let handles: Vec<_> = (0..4u64)
        .map(|i| {
            let session = std::sync::Arc::clone(&session);
            std::thread::spawn(move || {
                let mut region = session.pin(base + i * 65536, 4096).unwrap();
                let window = region.map(4096).unwrap();
                region.copy_to_mapping(&[i as u8; 64]).unwrap();
                let mut out = [0u8; 64];
                gdrcopy::CopyEngine::copy_from_mapping(&region, &window, &mut out).unwrap();
                assert_eq!(out, [i as u8; 64]);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(session.live_regions(), 0);
    session.close().unwrap();
}

// ============================================================================
// Attributes
// ============================================================================

/// Attribute values come from the driver.
#[test]
fn test_attributes() {
    let (driver, _) = emulated(
        EmulatedConfig::default()
            .with_persistent_mapping(true)
            .with_force_alternate_transport(false),
    );
    let session = Session::open_with(driver).unwrap();

    assert!(
        session
            .get_attribute(AttrKey::UsePersistentMapping)
            .unwrap()
            .as_bool()
    );
    assert!(
        !session
            .get_attribute(AttrKey::SupportPinFlagForceAlternateTransport)
            .unwrap()
            .as_bool()
    );

    let attrs = session.attributes();
    assert!(matches!(
        attrs.get_raw(99),
        Err(Error::UnsupportedAttribute(99))
    ));

    let snapshot = attrs.snapshot().unwrap();
    assert_eq!(snapshot.driver_version, VersionInfo::new(2, 5));
    assert_eq!(
        snapshot.get(AttrKey::UsePersistentMapping).map(|v| v.as_i32()),
        Some(1)
    );
}

/// Versions are reported, the runtime one even without a connection.
#[test]
fn test_versions() {
    let (driver, _) = emulated(EmulatedConfig::default());
    let session = Session::new(driver);
    assert_eq!(session.get_version().to_string(), "2.5");
    assert!(matches!(
        session.get_driver_version(),
        Err(Error::SessionClosed)
    ));

    session.open().unwrap();
    assert_eq!(session.get_driver_version().unwrap(), VersionInfo::new(2, 5));
}

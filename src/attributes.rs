//! Read-only driver and runtime attribute queries.
//!
//! Attributes are a closed enumeration ([`AttrKey`]) resolved against the
//! open session's driver. Unknown raw keys, and keys the driver does not
//! recognize, fail with [`Error::UnsupportedAttribute`].

use crate::error::{Error, Result};
use crate::session::Session;
use std::fmt;

/// Attribute keys understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum AttrKey {
    /// Whether the driver keeps persistent mappings across pins.
    UsePersistentMapping = 1,
    /// Whether [`PinFlags::FORCE_ALTERNATE_TRANSPORT`] is supported.
    ///
    /// [`PinFlags::FORCE_ALTERNATE_TRANSPORT`]: crate::region::PinFlags::FORCE_ALTERNATE_TRANSPORT
    SupportPinFlagForceAlternateTransport = 2,
}

impl AttrKey {
    /// All known keys.
    pub const ALL: [AttrKey; 2] = [
        AttrKey::UsePersistentMapping,
        AttrKey::SupportPinFlagForceAlternateTransport,
    ];

    /// Resolve a raw key.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(AttrKey::UsePersistentMapping),
            2 => Ok(AttrKey::SupportPinFlagForceAlternateTransport),
            other => Err(Error::UnsupportedAttribute(other)),
        }
    }

    /// The driver's raw key value.
    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrKey::UsePersistentMapping => write!(f, "USE_PERSISTENT_MAPPING"),
            AttrKey::SupportPinFlagForceAlternateTransport => {
                write!(f, "SUPPORT_PIN_FLAG_FORCE_PCIE")
            }
        }
    }
}

/// Value of a driver attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrValue(pub i32);

impl AttrValue {
    /// The raw integer value.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Interpret the value as a capability flag.
    #[inline]
    pub fn as_bool(self) -> bool {
        self.0 != 0
    }
}

/// A `major.minor` version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VersionInfo {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl VersionInfo {
    /// Create a version pair.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Convert the `int` pair reported over the C ABI.
    pub fn from_c(major: i32, minor: i32) -> Result<Self> {
        match (u32::try_from(major), u32::try_from(minor)) {
            (Ok(major), Ok(minor)) => Ok(Self { major, minor }),
            _ => Err(Error::InvalidArgument(format!(
                "negative version {major}.{minor}"
            ))),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Point-in-time capture of every supported attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSnapshot {
    /// User-space library version.
    pub runtime_version: VersionInfo,
    /// Kernel driver version.
    pub driver_version: VersionInfo,
    /// Values of keys the driver supports.
    pub values: Vec<(AttrKey, AttrValue)>,
}

impl AttributeSnapshot {
    /// Look up a captured value.
    pub fn get(&self, key: AttrKey) -> Option<AttrValue> {
        self.values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

/// Attribute lookups scoped to an open session.
///
/// Queries have no side effects and do not interact with any region state.
#[derive(Debug, Clone, Copy)]
pub struct AttributeRegistry<'a> {
    session: &'a Session,
}

impl<'a> AttributeRegistry<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Query one attribute.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the session is not open.
    /// - [`Error::UnsupportedAttribute`] if the driver does not recognize the key.
    pub fn get(&self, key: AttrKey) -> Result<AttrValue> {
        let mut state = self.session.inner().lock();
        let conn = state.connection(None)?;
        conn.get_attribute(key).map(AttrValue)
    }

    /// Query one attribute by its raw key.
    pub fn get_raw(&self, raw: u32) -> Result<AttrValue> {
        self.get(AttrKey::from_raw(raw)?)
    }

    /// Kernel driver version.
    pub fn driver_version(&self) -> Result<VersionInfo> {
        let mut state = self.session.inner().lock();
        state.connection(None)?.driver_version()
    }

    /// User-space library version. Does not require the session to be open.
    pub fn runtime_version(&self) -> VersionInfo {
        self.session.inner().driver().runtime_version()
    }

    /// Capture the versions and every attribute the driver supports.
    ///
    /// Keys the driver reports as unsupported are left out.
    pub fn snapshot(&self) -> Result<AttributeSnapshot> {
        let driver_version = self.driver_version()?;
        let mut values = Vec::with_capacity(AttrKey::ALL.len());
        for key in AttrKey::ALL {
            match self.get(key) {
                Ok(value) => values.push((key, value)),
                Err(Error::UnsupportedAttribute(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(AttributeSnapshot {
            runtime_version: self.runtime_version(),
            driver_version,
            values,
        })
    }
}

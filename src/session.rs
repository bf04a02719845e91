//! Driver sessions.
//!
//! A [`Session`] is an explicit context object owning the connection to the
//! device-memory driver. Every region is pinned through a session and keeps
//! the session's connection alive; the session refuses to close while any
//! region is still pinned so that leaks surface at the caller.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──open()──▶ open ──close()──▶ closed ──open()──▶ open (new epoch)
//!                      │  ▲
//!             pin ─────┘  └──── unpin (all regions)
//! ```
//!
//! Regions remember the epoch they were pinned in. Once the session closes,
//! operations on them fail with [`Error::SessionClosed`], even after a
//! re-open.

use crate::attributes::{AttrKey, AttrValue, AttributeRegistry, VersionInfo};
use crate::config::Config;
use crate::driver::{Connection, Driver, GdrApiDriver};
use crate::error::{Error, Result};
use crate::observability::{record_pinned_regions, span_session};
use crate::region::{PinFlags, PinnedRegion, RegionId};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Mutable session state, guarded by the session mutex.
pub(crate) struct SessionState {
    conn: Option<Box<dyn Connection>>,
    /// Incremented on every successful open.
    epoch: u64,
    /// Regions currently pinned through this session.
    live: BTreeSet<RegionId>,
}

impl SessionState {
    /// The open connection.
    ///
    /// With `Some(epoch)`, also requires that the session has not been
    /// closed since that epoch began.
    pub(crate) fn connection(&mut self, epoch: Option<u64>) -> Result<&mut dyn Connection> {
        if epoch.is_some_and(|e| e != self.epoch) {
            return Err(Error::SessionClosed);
        }
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::SessionClosed),
        }
    }

    /// Current epoch, if open.
    pub(crate) fn current_epoch(&self) -> Option<u64> {
        self.conn.is_some().then_some(self.epoch)
    }

    pub(crate) fn register(&mut self, id: RegionId) {
        self.live.insert(id);
        record_pinned_regions(self.live.len());
    }

    pub(crate) fn release(&mut self, id: RegionId) {
        self.live.remove(&id);
        record_pinned_regions(self.live.len());
    }
}

pub(crate) struct SessionInner {
    driver: Box<dyn Driver>,
    config: Config,
    state: Mutex<SessionState>,
}

impl SessionInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Last handle gone: every region has already released itself.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut conn) = state.conn.take() {
            if let Err(e) = conn.close() {
                warn!(driver = self.driver.name(), error = %e, "closing driver connection failed");
            }
        }
    }
}

/// A connection to the device-memory driver.
///
/// # Example
///
/// ```rust,ignore
/// use gdrcopy::{PinFlags, Session};
///
/// let session = Session::open_default()?;
/// let mut region = session.pin_buffer_v2(dev_ptr, len, PinFlags::DEFAULT)?;
/// let window = region.map(len as usize)?;
/// region.copy_to_mapping(&data)?;
/// region.unmap()?;
/// region.unpin()?;
/// session.close()?;
/// ```
///
/// # Thread Safety
///
/// `Session` is `Send + Sync`; its bookkeeping is behind a mutex. Region
/// transitions take `&mut PinnedRegion`, so sharing one region across
/// threads requires the caller's own synchronization.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a closed session over `driver` with the default configuration.
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::with_config(driver, Config::default())
    }

    /// Create a closed session over `driver`.
    pub fn with_config(driver: impl Driver + 'static, config: Config) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                driver: Box::new(driver),
                config,
                state: Mutex::new(SessionState {
                    conn: None,
                    epoch: 0,
                    live: BTreeSet::new(),
                }),
            }),
        }
    }

    /// Create and open a session over `driver`.
    pub fn open_with(driver: impl Driver + 'static) -> Result<Self> {
        let session = Self::new(driver);
        session.open()?;
        Ok(session)
    }

    /// Load `libgdrapi.so` using [`Config::from_env`] and open a session.
    pub fn open_default() -> Result<Self> {
        let config = Config::from_env();
        let driver = GdrApiDriver::load(&config)?;
        let session = Self::with_config(driver, config);
        session.open()?;
        Ok(session)
    }

    /// Establish the driver connection.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyOpen`] if the session is already open.
    /// - [`Error::DriverUnavailable`] / [`Error::PermissionDenied`] from the driver.
    pub fn open(&self) -> Result<()> {
        let _span = span_session(self.inner.driver.name()).entered();
        let mut state = self.inner.lock();
        if state.conn.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let conn = self.inner.driver.open()?;
        state.conn = Some(conn);
        state.epoch += 1;
        debug!(driver = self.inner.driver.name(), epoch = state.epoch, "session opened");
        Ok(())
    }

    /// Release the driver connection.
    ///
    /// Regions derived from this session become unusable
    /// ([`Error::SessionClosed`]).
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceLeak`] if any region is still pinned. The session
    ///   stays open and usable.
    /// - [`Error::SessionClosed`] if the session is not open.
    /// - [`Error::Driver`] if the driver fails to close; the connection is
    ///   dropped regardless.
    pub fn close(&self) -> Result<()> {
        let _span = span_session(self.inner.driver.name()).entered();
        let mut state = self.inner.lock();
        if state.conn.is_none() {
            return Err(Error::SessionClosed);
        }
        if !state.live.is_empty() {
            return Err(Error::ResourceLeak {
                live_regions: state.live.len(),
            });
        }
        let mut conn = state.conn.take().ok_or(Error::SessionClosed)?;
        debug!(driver = self.inner.driver.name(), epoch = state.epoch, "session closed");
        conn.close()
    }

    /// Whether the driver connection is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().conn.is_some()
    }

    /// Number of regions currently pinned through this session.
    pub fn live_regions(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Session configuration.
    pub fn config(&self) -> &Config {
        self.inner.config()
    }

    /// Name of the underlying driver.
    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Alignment required of pinned device addresses.
    pub fn pin_granularity(&self) -> Result<u64> {
        let mut state = self.inner.lock();
        Ok(state.connection(None)?.pin_granularity())
    }

    /// Pin a device range (legacy form). See [`PinnedRegion::pin`].
    pub fn pin_buffer(
        &self,
        addr: u64,
        size: u64,
        p2p_token: u64,
        va_space: u64,
    ) -> Result<PinnedRegion> {
        PinnedRegion::pin(self, addr, size, p2p_token, va_space)
    }

    /// Pin a device range with flags. See [`PinnedRegion::pin_v2`].
    pub fn pin_buffer_v2(&self, addr: u64, size: u64, flags: PinFlags) -> Result<PinnedRegion> {
        PinnedRegion::pin_v2(self, addr, size, flags)
    }

    /// Pin a device range with the configured default flags.
    pub fn pin(&self, addr: u64, size: u64) -> Result<PinnedRegion> {
        PinnedRegion::pin_v2(self, addr, size, self.inner.config.default_pin_flags)
    }

    /// Attribute and version queries.
    pub fn attributes(&self) -> AttributeRegistry<'_> {
        AttributeRegistry::new(self)
    }

    /// Query one driver attribute.
    pub fn get_attribute(&self, key: AttrKey) -> Result<AttrValue> {
        self.attributes().get(key)
    }

    /// User-space library version.
    pub fn get_version(&self) -> VersionInfo {
        self.attributes().runtime_version()
    }

    /// Kernel driver version.
    pub fn get_driver_version(&self) -> Result<VersionInfo> {
        self.attributes().driver_version()
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Session")
            .field("driver", &self.inner.driver.name())
            .field("open", &state.conn.is_some())
            .field("epoch", &state.epoch)
            .field("live_regions", &state.live.len())
            .finish()
    }
}

//! Session configuration.
//!
//! ```rust,ignore
//! use gdrcopy::Config;
//!
//! // GDRCOPY_LIBRARY_PATH, then the system loader, then the search paths
//! let config = Config::from_env().with_device_node("/dev/gdrdrv");
//! ```

use crate::defaults::{
    DEFAULT_DEVICE_NODE, DEFAULT_LIBRARY_NAME, DEFAULT_SEARCH_PATHS, LIBRARY_PATH_ENV,
};
use crate::observability::TracingConfig;
use crate::region::PinFlags;
use std::ffi::OsString;
use std::path::PathBuf;

/// Configuration for driver discovery and session behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the driver library. Tried first.
    pub library_path: Option<PathBuf>,
    /// File name of the driver library.
    pub library_name: String,
    /// Directories tried after the system loader.
    pub search_paths: Vec<PathBuf>,
    /// Device node probed to explain a failed connection.
    pub device_node: PathBuf,
    /// Flags used by [`Session::pin`](crate::Session::pin).
    pub default_pin_flags: PinFlags,
    /// Span configuration.
    pub tracing: TracingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library_path: None,
            library_name: DEFAULT_LIBRARY_NAME.to_string(),
            search_paths: DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            device_node: PathBuf::from(DEFAULT_DEVICE_NODE),
            default_pin_flags: PinFlags::DEFAULT,
            tracing: TracingConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration, with `GDRCOPY_LIBRARY_PATH` applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Default configuration, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(LIBRARY_PATH_ENV).filter(|v| !v.is_empty()) {
            config.library_path = Some(PathBuf::from(dir));
        }
        config
    }

    /// Set the directory containing the driver library.
    pub fn with_library_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_path = Some(dir.into());
        self
    }

    /// Set the driver library file name.
    pub fn with_library_name(mut self, name: impl Into<String>) -> Self {
        self.library_name = name.into();
        self
    }

    /// Replace the fallback search paths.
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Append a fallback search path.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Set the device node.
    pub fn with_device_node(mut self, node: impl Into<PathBuf>) -> Self {
        self.device_node = node.into();
        self
    }

    /// Set the flags used by [`Session::pin`](crate::Session::pin).
    pub fn with_default_pin_flags(mut self, flags: PinFlags) -> Self {
        self.default_pin_flags = flags;
        self
    }

    /// Set span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Library locations to try, in order.
    ///
    /// 1. `library_path/library_name`
    /// 2. `library_name` alone (resolved by the system loader)
    /// 3. each existing `search_path/library_name`
    pub fn library_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(self.search_paths.len() + 2);
        if let Some(dir) = &self.library_path {
            candidates.push(dir.join(&self.library_name));
        }
        candidates.push(PathBuf::from(&self.library_name));
        candidates.extend(
            self.search_paths
                .iter()
                .map(|dir| dir.join(&self.library_name))
                .filter(|path| path.exists()),
        );
        candidates
    }
}

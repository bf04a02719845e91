//! Tracing integration for structured logging and spans.

use crate::copy::CopyDirection;
use crate::mapping::MappingType;
use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span for each region lifecycle operation.
    pub region_spans: bool,
    /// Whether to create a span for each copy.
    pub copy_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            region_spans: true,
            copy_spans: false, // Copies are hot; opt in
        }
    }
}

impl TracingConfig {
    /// Create a config with all spans enabled.
    pub fn all() -> Self {
        Self {
            region_spans: true,
            copy_spans: true,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            region_spans: false,
            copy_spans: false,
        }
    }

    /// Span for a region operation, or a disabled span if region spans are off.
    pub fn region(&self, op: &'static str, addr: u64, size: u64) -> Span {
        if self.region_spans {
            span_region(op, addr, size)
        } else {
            Span::none()
        }
    }

    /// Span for a copy, or a disabled span if copy spans are off.
    pub fn copy(&self, direction: CopyDirection, len: usize, mapping_type: MappingType) -> Span {
        if self.copy_spans {
            span_copy(direction, len, mapping_type)
        } else {
            Span::none()
        }
    }
}

/// Create a span for a session.
#[inline]
pub fn span_session(driver: &str) -> Span {
    span!(Level::INFO, "session", driver = %driver)
}

/// Create a span for a region lifecycle operation.
///
/// # Example
///
/// ```rust,ignore
/// let span = span_region("pin", addr, size);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_region(op: &'static str, addr: u64, size: u64) -> Span {
    span!(Level::DEBUG, "region", op = op, addr = addr, size = size)
}

/// Create a span for a single copy.
#[inline]
pub fn span_copy(direction: CopyDirection, len: usize, mapping_type: MappingType) -> Span {
    span!(
        Level::TRACE,
        "copy",
        direction = direction.as_str(),
        len = len,
        mapping_type = mapping_type.as_str()
    )
}

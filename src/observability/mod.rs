//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `gdrcopy_pins_total` | Counter | Successful pin requests |
//! | `gdrcopy_unpins_total` | Counter | Successful unpin requests |
//! | `gdrcopy_maps_total` | Counter | Successful map requests |
//! | `gdrcopy_unmaps_total` | Counter | Successful unmap requests |
//! | `gdrcopy_bytes_copied` | Counter | Bytes moved, by direction |
//! | `gdrcopy_copy_errors` | Counter | Rejected copies, by direction |
//! | `gdrcopy_copy_time_ns` | Histogram | Copy latency including fences |
//! | `gdrcopy_pinned_regions` | Gauge | Regions currently pinned |
//!
//! Nothing is exported unless the application installs a `metrics` recorder.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gdrcopy::observability::init_metrics;
//!
//! init_metrics();
//! // install a prometheus/statsd recorder to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_copy, record_copy_error, record_map, record_pin, record_pinned_regions,
    record_unmap, record_unpin,
};
pub use tracing_support::{TracingConfig, span_copy, span_region, span_session};

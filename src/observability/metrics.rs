//! Metrics collection using metrics-rs.

use crate::copy::CopyDirection;
use crate::mapping::MappingType;
use metrics::{Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const PINS_TOTAL: &str = "gdrcopy_pins_total";
const UNPINS_TOTAL: &str = "gdrcopy_unpins_total";
const MAPS_TOTAL: &str = "gdrcopy_maps_total";
const UNMAPS_TOTAL: &str = "gdrcopy_unmaps_total";
const BYTES_COPIED: &str = "gdrcopy_bytes_copied";
const COPY_ERRORS: &str = "gdrcopy_copy_errors";
const COPY_TIME_NS: &str = "gdrcopy_copy_time_ns";
const PINNED_REGIONS: &str = "gdrcopy_pinned_regions";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(PINS_TOTAL, Unit::Count, "Device regions pinned");
    metrics::describe_counter!(UNPINS_TOTAL, Unit::Count, "Device regions unpinned");
    metrics::describe_counter!(MAPS_TOTAL, Unit::Count, "Mapping windows created");
    metrics::describe_counter!(UNMAPS_TOTAL, Unit::Count, "Mapping windows torn down");
    metrics::describe_counter!(
        BYTES_COPIED,
        Unit::Bytes,
        "Bytes moved between host buffers and mapping windows"
    );
    metrics::describe_counter!(COPY_ERRORS, Unit::Count, "Copies rejected before transfer");
    metrics::describe_histogram!(
        COPY_TIME_NS,
        Unit::Nanoseconds,
        "Time to complete one copy including fences"
    );
    metrics::describe_gauge!(PINNED_REGIONS, Unit::Count, "Regions currently pinned");
}

/// Record a successful pin.
#[inline]
pub fn record_pin() {
    counter!(PINS_TOTAL).increment(1);
}

/// Record a successful unpin.
#[inline]
pub fn record_unpin() {
    counter!(UNPINS_TOTAL).increment(1);
}

/// Record a successful map.
#[inline]
pub fn record_map(mapping_type: MappingType) {
    counter!(MAPS_TOTAL, "mapping_type" => mapping_type.as_str()).increment(1);
}

/// Record a successful unmap.
#[inline]
pub fn record_unmap() {
    counter!(UNMAPS_TOTAL).increment(1);
}

/// Record a completed copy.
#[inline]
pub fn record_copy(
    direction: CopyDirection,
    mapping_type: MappingType,
    bytes: usize,
    duration: Duration,
) {
    counter!(BYTES_COPIED, "direction" => direction.as_str()).increment(bytes as u64);
    histogram!(
        COPY_TIME_NS,
        "direction" => direction.as_str(),
        "mapping_type" => mapping_type.as_str()
    )
    .record(duration.as_nanos() as f64);
}

/// Record a copy rejected before any byte moved.
#[inline]
pub fn record_copy_error(direction: CopyDirection) {
    counter!(COPY_ERRORS, "direction" => direction.as_str()).increment(1);
}

/// Record the number of regions pinned on a session.
#[inline]
pub fn record_pinned_regions(count: usize) {
    gauge!(PINNED_REGIONS).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS_INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: every call is a no-op.
        record_pin();
        record_map(MappingType::WriteCombined);
        record_copy(
            CopyDirection::HostToDevice,
            MappingType::Caching,
            4096,
            Duration::from_micros(3),
        );
        record_copy_error(CopyDirection::DeviceToHost);
        record_pinned_regions(0);
    }
}

//! Default configuration constants.
//!
//! GPU page geometry matches the GPUDirect RDMA kernel driver: device memory
//! is pinned and mapped in 64 KiB GPU pages, independent of the host page
//! size.

// =============================================================================
// GPU Page Geometry
// =============================================================================

/// log2 of the GPU page size.
pub const GPU_PAGE_SHIFT: u32 = 16;

/// GPU page size (64 KiB).
pub const GPU_PAGE_SIZE: u64 = 1 << GPU_PAGE_SHIFT;

/// Offset bits within a GPU page.
pub const GPU_PAGE_OFFSET: u64 = GPU_PAGE_SIZE - 1;

/// Mask selecting the GPU page base of an address.
pub const GPU_PAGE_MASK: u64 = !GPU_PAGE_OFFSET;

// =============================================================================
// Driver Discovery
// =============================================================================

/// File name of the user-space driver library.
pub const DEFAULT_LIBRARY_NAME: &str = "libgdrapi.so";

/// Environment variable naming a directory that contains the driver library.
pub const LIBRARY_PATH_ENV: &str = "GDRCOPY_LIBRARY_PATH";

/// Device node exposed by the kernel module.
pub const DEFAULT_DEVICE_NODE: &str = "/dev/gdrdrv";

/// Directories searched for the driver library after the system loader.
pub const DEFAULT_SEARCH_PATHS: &[&str] = &[
    "/usr/lib",
    "/usr/local/lib",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
];

// =============================================================================
// Emulated Device
// =============================================================================

/// Base device address of the emulated device's memory.
pub const EMULATED_DEVICE_BASE: u64 = 0x7f00_0000_0000;

/// Default capacity of the emulated device (16 MiB).
pub const EMULATED_DEVICE_CAPACITY: u64 = 16 * 1024 * 1024;

/// Version reported by the emulated kernel driver.
pub const EMULATED_DRIVER_VERSION: (u32, u32) = (2, 5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_page_size() {
        assert_eq!(GPU_PAGE_SIZE, 65_536);
        assert_eq!(GPU_PAGE_MASK, 0xffff_ffff_ffff_0000);
    }

    #[test]
    fn test_emulated_base_is_gpu_page_aligned() {
        assert_eq!(EMULATED_DEVICE_BASE & GPU_PAGE_OFFSET, 0);
    }
}

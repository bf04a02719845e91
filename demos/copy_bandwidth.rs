//! Measure host/device copy bandwidth through a mapping window.
//!
//! Run with: cargo run --release --example copy_bandwidth
//!
//! Compares default pinning with the forced alternate transport for
//! several buffer sizes. Uses the emulated device unless a device pointer
//! (at least 8 MiB) is given as the first argument.

use gdrcopy::driver::{EmulatedConfig, EmulatedDriver};
use gdrcopy::observability::init_metrics;
use gdrcopy::prelude::*;
use std::time::Instant;

const SIZES_KB: [usize; 5] = [4, 64, 512, 2048, 8192];
const ITERATIONS: u32 = 10;

/// Returns (device→host, host→device) in GB/s.
fn measure(session: &Session, addr: u64, size: usize, flags: PinFlags) -> Result<(f64, f64)> {
    let mut region = session.pin_buffer_v2(addr, size as u64, flags)?;
    let window = region.map(size)?;
    let mut host = vec![1u8; size];

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        CopyEngine::copy_from_mapping(&region, &window, &mut host)?;
    }
    let d2h = start.elapsed() / ITERATIONS;

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        CopyEngine::copy_to_mapping(&mut region, &window, &host)?;
    }
    let h2d = start.elapsed() / ITERATIONS;

    region.unmap()?;
    region.unpin()?;

    let gbps = |d: std::time::Duration| size as f64 / d.as_secs_f64() / 1e9;
    Ok((gbps(d2h), gbps(h2d)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("gdrcopy=info,warn")
        .init();
    init_metrics();

    let max = SIZES_KB[SIZES_KB.len() - 1] * 1024;
    let (session, addr) = match std::env::args().nth(1) {
        Some(arg) => {
            let addr = u64::from_str_radix(arg.trim_start_matches("0x"), 16)
                .map_err(|e| Error::InvalidArgument(format!("bad device address {arg}: {e}")))?;
            (Session::open_default()?, addr)
        }
        None => {
            let driver = EmulatedDriver::new(EmulatedConfig::default())?;
            let addr = driver.device().allocate(max as u64)?;
            (Session::open_with(driver)?, addr)
        }
    };

    let force_supported = session
        .get_attribute(AttrKey::SupportPinFlagForceAlternateTransport)
        .map(|v| v.as_bool())
        .unwrap_or(false);

    println!("gdrcopy copy bandwidth ({})", session.driver_name());
    println!("{:>9} | {:>8} | {:>10} | {:>10}", "size", "flags", "D2H GB/s", "H2D GB/s");
    println!("{}", "-".repeat(47));

    for kb in SIZES_KB {
        let size = kb * 1024;
        let mut variants = vec![("default", PinFlags::DEFAULT)];
        if force_supported {
            variants.push(("force", PinFlags::FORCE_ALTERNATE_TRANSPORT));
        }
        for (label, flags) in variants {
            let (d2h, h2d) = measure(&session, addr, size, flags)?;
            println!("{:>6} KB | {:>8} | {:>10.2} | {:>10.2}", kb, label, d2h, h2d);
        }
    }

    session.close()?;
    Ok(())
}

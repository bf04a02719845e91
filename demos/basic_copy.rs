//! Pin, map, and copy a buffer of floats through a mapping window.
//!
//! Run with: cargo run --example basic_copy
//!
//! With a device pointer as the first argument, the real driver is used:
//! cargo run --example basic_copy -- 0x7f1234560000

use gdrcopy::driver::{EmulatedConfig, EmulatedDriver};
use gdrcopy::prelude::*;

const COUNT: usize = 1000;

fn parse_addr(arg: &str) -> Result<u64> {
    let digits = arg.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::InvalidArgument(format!("bad device address {arg}: {e}")))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("gdrcopy=debug,info")
        .init();

    let bytes = COUNT * size_of::<f32>();
    let (session, addr) = match std::env::args().nth(1) {
        Some(arg) => (Session::open_default()?, parse_addr(&arg)?),
        None => {
            let driver = EmulatedDriver::new(EmulatedConfig::default())?;
            let device = driver.device();
            let addr = device.allocate(bytes as u64)?;
            // Seed device memory the way an accelerator kernel would.
            let seed: Vec<u8> = (0..COUNT)
                .flat_map(|i| (i as f32).to_le_bytes())
                .collect();
            device.write(addr, &seed)?;
            (Session::open_with(driver)?, addr)
        }
    };

    println!("gdrcopy runtime version: {}", session.get_version());
    println!("driver version: {}", session.get_driver_version()?);
    println!("device buffer at {addr:#x}, {bytes} bytes");

    let mut region = session.pin_buffer_v2(addr, bytes as u64, PinFlags::DEFAULT)?;
    println!("pinned: {:?}", region.get_info()?);

    let window = region.map(bytes)?;
    println!(
        "mapped at {:p} ({})",
        window.as_ptr(),
        window.mapping_type()
    );

    let mut host = vec![0u8; bytes];
    CopyEngine::copy_from_mapping(&region, &window, &mut host)?;
    let mut values: Vec<f32> = host
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    println!("read from device: {:?}...", &values[..10]);

    for v in &mut values {
        *v += 100.0;
    }
    let host: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    CopyEngine::copy_to_mapping(&mut region, &window, &host)?;

    let mut check = vec![0u8; bytes];
    region.copy_from_mapping(&mut check)?;
    assert_eq!(host, check);
    println!("wrote back {} modified values", COUNT);

    region.unmap()?;
    region.unpin()?;
    session.close()?;
    Ok(())
}

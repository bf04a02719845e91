//! Copy throughput through mapping windows, per mapping type.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use gdrcopy::driver::{EmulatedConfig, EmulatedDriver};
use gdrcopy::{CopyEngine, MappingType, Session};

const SIZES: [usize; 4] = [64, 4096, 65536, 1024 * 1024];

fn session(mapping_type: MappingType) -> (Session, u64) {
    let driver = EmulatedDriver::new(EmulatedConfig::default().with_mapping_type(mapping_type))
        .unwrap();
    let base = driver.device().base();
    (Session::open_with(driver).unwrap(), base)
}

fn bench_host_to_device(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_to_mapping");

    for ty in [
        MappingType::Caching,
        MappingType::WriteCombined,
        MappingType::Device,
    ] {
        let (session, base) = session(ty);
        let max = SIZES[SIZES.len() - 1];
        let mut region = session.pin(base, max as u64).unwrap();
        let window = region.map(max).unwrap();

        for size in SIZES {
            let src = vec![0xA5u8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(ty.as_str(), size), &src, |b, src| {
                b.iter(|| CopyEngine::copy_to_mapping(&mut region, &window, src).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_device_to_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_from_mapping");

    for ty in [
        MappingType::Caching,
        MappingType::WriteCombined,
        MappingType::Device,
    ] {
        let (session, base) = session(ty);
        let max = SIZES[SIZES.len() - 1];
        let mut region = session.pin(base, max as u64).unwrap();
        let window = region.map(max).unwrap();

        for size in SIZES {
            let mut dst = vec![0u8; size];
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_function(BenchmarkId::new(ty.as_str(), size), |b| {
                b.iter(|| {
                    CopyEngine::copy_from_mapping(&region, &window, &mut dst).unwrap();
                    std::hint::black_box(&dst);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_host_to_device, bench_device_to_host);
criterion_main!(benches);

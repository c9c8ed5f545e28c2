//! Throughput benchmarks
//!
//! Benchmarks for measuring:
//! - Sequential pread/pwrite through the driver (memory backend)
//! - Object digest performance
//!
//! Run with: cargo bench --bench throughput -p keel-driver

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use keel_core::crypto::object_digest;
use keel_core::{DriverConfig, HostKey, OpenFlags, DEFAULT_PORT};
use keel_driver::{MemoryBackend, RemoteDriver};

const OBJECT_SIZE: usize = 4 * 1024 * 1024;

fn setup(rt: &Runtime) -> (RemoteDriver, HostKey) {
    let backend = MemoryBackend::new().with_credentials_required(false);
    let data: Vec<u8> = (0..OBJECT_SIZE).map(|i| (i % 251) as u8).collect();
    backend.insert_object("/bench/object", &data);

    let driver = RemoteDriver::new(Arc::new(backend), &DriverConfig::default());
    let host = HostKey::new("bench.example.org", DEFAULT_PORT);
    // Connect once outside the measured loop
    rt.block_on(driver.stat(&host, "/bench/object")).expect("stat");
    (driver, host)
}

/// Sequential reads of the whole object at different request sizes
fn bench_sequential_read(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (driver, host) = setup(&rt);
    let mut group = c.benchmark_group("pread");

    for (name, chunk) in [("64KB", 64 * 1024), ("256KB", 256 * 1024), ("1MB", 1024 * 1024)] {
        group.throughput(Throughput::Bytes(OBJECT_SIZE as u64));
        group.bench_with_input(BenchmarkId::new("chunk", name), &chunk, |b, &chunk| {
            b.iter(|| {
                rt.block_on(async {
                    let mut file = driver
                        .open(&host, "/bench/object", OpenFlags::READ_ONLY, 0)
                        .await
                        .expect("open");
                    let mut buf = vec![0u8; chunk];
                    let mut offset = 0u64;
                    loop {
                        let n = driver.pread(&mut file, &mut buf, offset).await.expect("read");
                        if n == 0 {
                            break;
                        }
                        offset += n as u64;
                    }
                    driver.close(file).await.expect("close");
                    black_box(offset)
                })
            })
        });
    }

    group.finish();
}

/// Sequential writes into a fresh object
fn bench_sequential_write(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (driver, host) = setup(&rt);
    let mut group = c.benchmark_group("pwrite");
    let chunk = vec![0x5au8; 256 * 1024];

    group.throughput(Throughput::Bytes(OBJECT_SIZE as u64));
    group.bench_function("256KB", |b| {
        b.iter(|| {
            rt.block_on(async {
                let flags = OpenFlags::WRITE_ONLY.with(libc::O_CREAT | libc::O_TRUNC);
                let mut file = driver
                    .open(&host, "/bench/written", flags, 0o644)
                    .await
                    .expect("open");
                let mut offset = 0u64;
                while (offset as usize) < OBJECT_SIZE {
                    offset += driver.pwrite(&mut file, &chunk, offset).await.expect("write") as u64;
                }
                driver.close(file).await.expect("close");
                black_box(offset)
            })
        })
    });

    group.finish();
}

/// Object digest at different sizes
fn bench_object_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("object_digest");

    for (name, size) in [("64KB", 64 * 1024), ("1MB", 1024 * 1024), ("4MB", OBJECT_SIZE)] {
        let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("size", name), &data, |b, data| {
            b.iter(|| object_digest(black_box(data)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_read,
    bench_sequential_write,
    bench_object_digest
);
criterion_main!(benches);

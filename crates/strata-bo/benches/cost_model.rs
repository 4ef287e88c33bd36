use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata_bo::cost::{compute_blob_access_score, sort_buffer_info};
use strata_types::{BufferId, BufferInfo, PoolBandwidthRange, MEBIBYTE};

fn buffer_fixture(count: u32) -> Vec<BufferInfo> {
    let tiers = [100.0_f32, 400.0, 1000.0, 6000.0];
    (0..count)
        .map(|i| BufferInfo {
            id: BufferId::from_parts(0, i),
            bandwidth_mbps: tiers[(i as usize) % tiers.len()],
            size: u64::from(i % 64 + 1) * MEBIBYTE / 4,
        })
        .collect()
}

fn bench_access_score(c: &mut Criterion) {
    let range = PoolBandwidthRange {
        min_mbps: 100.0,
        max_mbps: 6000.0,
    };
    for count in [16_u32, 256, 4096] {
        let buffers = buffer_fixture(count);
        c.bench_function(&format!("access_score_{count}_buffers"), |b| {
            b.iter(|| compute_blob_access_score(black_box(range), black_box(&buffers)));
        });
    }
}

fn bench_sort(c: &mut Criterion) {
    let buffers = buffer_fixture(4096);
    c.bench_function("sort_buffer_info_4096", |b| {
        b.iter(|| {
            let mut scratch = buffers.clone();
            sort_buffer_info(black_box(&mut scratch), true);
            scratch
        });
    });
}

criterion_group!(benches, bench_access_score, bench_sort);
criterion_main!(benches);

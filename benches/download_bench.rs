use chunkdown::store::{ChunkStore, MemoryChunkStore};
use chunkdown::task::calculate_chunk_size;
use criterion::{Criterion, criterion_group, criterion_main};

fn chunk_sizing_benchmark(c: &mut Criterion) {
    c.bench_function("calculate_chunk_size", |b| {
        b.iter(|| {
            for total in [0u64, 7, 10_000_000, 2 << 30, 500 << 30] {
                std::hint::black_box(calculate_chunk_size(std::hint::black_box(total)));
            }
        })
    });
}

fn memory_store_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let chunk = vec![0u8; 64 * 1024];

    c.bench_function("memory_store_put_list", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = MemoryChunkStore::new();
                for i in 0..16u32 {
                    store.put_chunk("http://h/bench.bin", i, &chunk).await.unwrap();
                }
                let chunks = store.list_chunks("http://h/bench.bin").await.unwrap();
                std::hint::black_box(chunks.len())
            })
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .significance_level(0.1)
        .noise_threshold(0.05)
        .configure_from_args();
    targets = chunk_sizing_benchmark, memory_store_benchmark
}
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use raya_gc::{Arena, GcConfig, TypeDescriptor, TypeKind};
use std::ptr::null;

fn config() -> GcConfig {
    GcConfig::default()
        .with_native_stack_scanning(false)
        .with_executable_code(false)
}

fn bench_fixed_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_fixed");
    group.throughput(Throughput::Elements(1));

    let arena = Arena::new(config()).unwrap();
    arena.attach_thread().unwrap();
    let pair = arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 16, vec![0, 8], None).unwrap());
    group.bench_function("arena", |b| {
        b.iter(|| black_box(arena.allocate(pair).unwrap()));
    });

    group.finish();
}

fn bench_array_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_array");

    let arena = Arena::new(config()).unwrap();
    arena.attach_thread().unwrap();
    let refs = arena.alloc_type(TypeDescriptor::new(TypeKind::Array, null(), 8, vec![0], None).unwrap());
    for count in [8usize, 128, 4096] {
        group.bench_with_input(BenchmarkId::new("arena", count), &count, |b, &count| {
            b.iter(|| black_box(arena.allocate_array(refs, count).unwrap()));
        });
    }

    group.finish();
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");

    for live in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("full", live), &live, |b, &live| {
            let arena = Arena::new(config()).unwrap();
            arena.attach_thread().unwrap();
            let leaf = arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 8, vec![], None).unwrap());
            let root = arena.create_owned_root(live).unwrap();
            for i in 0..live {
                root.set(i, arena.allocate(leaf).unwrap().as_ptr() as usize);
            }
            b.iter(|| arena.collect().unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fixed_allocation, bench_array_allocation, bench_collection);
criterion_main!(benches);

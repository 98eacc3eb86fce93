//! Stress tests for the moving arena
//!
//! Tests validate collector correctness under load:
//! - Objects with many reference fields surviving relocation
//! - Randomized object graphs with cycles and shared nodes
//! - Half-filled reference arrays
//! - Concurrent allocation from many threads
//!
//! # Running Tests
//! ```bash
//! # Run the stress tests (except long-running)
//! cargo test --test gc_stress_tests
//!
//! # Include long-running ones, with collector logging
//! RUST_LOG=raya_gc=debug cargo test --test gc_stress_tests -- --include-ignored
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raya_gc::{Arena, DescriptorRef, GcArray, GcConfig, TypeDescriptor, TypeKind};
use rustc_hash::FxHashSet;
use std::ptr::{null, NonNull};
use std::sync::{Arc, Barrier};
use std::thread;

const WORD: usize = std::mem::size_of::<usize>();

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> GcConfig {
    GcConfig::default()
        .with_native_stack_scanning(false)
        .with_executable_code(false)
}

fn attached_arena(config: GcConfig) -> Arena {
    init_tracing();
    let arena = Arena::new(config).unwrap();
    arena.attach_thread().unwrap();
    arena
}

fn leaf_type(arena: &Arena) -> DescriptorRef {
    arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), WORD, vec![], None).unwrap())
}

fn read(object: usize, index: usize) -> usize {
    unsafe { *(object as *const usize).add(index) }
}

fn write(object: usize, index: usize, value: usize) {
    unsafe { *(object as *mut usize).add(index) = value }
}

fn leaf(arena: &Arena, ty: DescriptorRef, value: usize) -> usize {
    let object = arena.allocate(ty).unwrap().as_ptr() as usize;
    write(object, 0, value);
    object
}

// ===== Relocation =====

#[test]
fn test_every_offset_survives_relocation() {
    const FIELDS: usize = 8;
    let arena = attached_arena(config());
    let leaf_ty = leaf_type(&arena);
    // Interleave references with plain words
    let offsets: Vec<usize> = (0..FIELDS).map(|i| i * 2 * WORD).collect();
    let wide = arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), FIELDS * 2 * WORD, offsets, None).unwrap());
    let root = arena.create_owned_root(1).unwrap();

    root.set(0, arena.allocate(wide).unwrap().as_ptr() as usize);
    for i in 0..FIELDS {
        let target = leaf(&arena, leaf_ty, 1000 + i);
        write(root.get(0), i * 2, target);
        write(root.get(0), i * 2 + 1, i);
    }

    arena.collect_minor().unwrap();
    arena.collect().unwrap();
    arena.collect().unwrap();

    let object = root.get(0);
    assert_eq!(unsafe { arena.type_of(NonNull::new(object as *mut u8).unwrap()) }, Some(wide));
    let mut seen = FxHashSet::default();
    for i in 0..FIELDS {
        let target = read(object, i * 2);
        assert!(seen.insert(target), "two fields share a referent");
        assert_eq!(read(target, 0), 1000 + i);
        assert_eq!(read(object, i * 2 + 1), i);
    }
}

#[test]
fn test_half_filled_array_bookkeeping() {
    let arena = attached_arena(config());
    let leaf_ty = leaf_type(&arena);
    let refs = arena.alloc_type(TypeDescriptor::new(TypeKind::Array, null(), WORD, vec![0], None).unwrap());
    let root = arena.create_owned_root(1).unwrap();

    root.set(0, arena.allocate_array(refs, 1000).unwrap().as_ptr() as usize);
    for i in (0..1000).step_by(2) {
        let element = leaf(&arena, leaf_ty, i);
        let array = unsafe { GcArray::from_raw(NonNull::new(root.get(0) as *mut u8).unwrap()) };
        array.set(i, element);
    }
    let array = unsafe { GcArray::from_raw(NonNull::new(root.get(0) as *mut u8).unwrap()) };
    array.set_filled(500);

    arena.collect().unwrap();

    let ptr = NonNull::new(root.get(0) as *mut u8).unwrap();
    assert_eq!(unsafe { arena.type_of(ptr) }, Some(refs));
    let array = unsafe { GcArray::from_raw(ptr) };
    assert_eq!(array.count(), 1000);
    assert_eq!(array.filled(), 500);
    for i in 0..1000 {
        if i % 2 == 0 {
            assert_eq!(read(array.get(i), 0), i);
        } else {
            assert_eq!(array.get(i), 0);
        }
    }
    assert!(arena.check_memory().is_ok());
}

// ===== Random graphs =====

/// Node: two edges and an id
fn node_type(arena: &Arena) -> DescriptorRef {
    arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 3 * WORD, vec![0, WORD], None).unwrap())
}

fn reachable(edges: &[[Option<usize>; 2]], roots: &[usize]) -> FxHashSet<usize> {
    let mut seen = FxHashSet::default();
    let mut stack = roots.to_vec();
    while let Some(node) = stack.pop() {
        if seen.insert(node) {
            stack.extend(edges[node].iter().flatten().copied());
        }
    }
    seen
}

fn run_random_graph(seed: u64, nodes: usize, rounds: usize) {
    let arena = attached_arena(config().with_nursery_limit(256 * 1024));
    let ty = node_type(&arena);
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..rounds {
        let all = arena.create_owned_root(nodes).unwrap();
        for id in 0..nodes {
            let node = arena.allocate(ty).unwrap().as_ptr() as usize;
            write(node, 2, id);
            all.set(id, node);
        }

        let mut edges = vec![[None, None]; nodes];
        for (id, slots) in edges.iter_mut().enumerate() {
            for (field, slot) in slots.iter_mut().enumerate() {
                if rng.gen_bool(0.7) {
                    let target = rng.gen_range(0..nodes);
                    *slot = Some(target);
                    write(all.get(id), field, all.get(target));
                }
            }
        }

        let root_ids: Vec<usize> = (0..nodes / 50).map(|_| rng.gen_range(0..nodes)).collect();
        let roots = arena.create_owned_root(root_ids.len()).unwrap();
        for (slot, &id) in root_ids.iter().enumerate() {
            roots.set(slot, all.get(id));
        }
        drop(all);

        arena.collect().unwrap();

        let expected = reachable(&edges, &root_ids);
        let mut live = 0;
        arena
            .walk_objects(|_, descriptor| {
                if descriptor == ty {
                    live += 1;
                }
            })
            .unwrap();
        assert_eq!(live, expected.len());

        // Every surviving edge still leads to the node it was set to
        let mut stack: Vec<usize> = (0..roots.len()).map(|i| roots.get(i)).collect();
        let mut visited = FxHashSet::default();
        while let Some(node) = stack.pop() {
            let id = read(node, 2);
            if !visited.insert(id) {
                continue;
            }
            for field in 0..2 {
                let target = read(node, field);
                match edges[id][field] {
                    Some(expected_id) => {
                        assert_eq!(read(target, 2), expected_id);
                        stack.push(target);
                    }
                    None => assert_eq!(target, 0),
                }
            }
        }
        assert_eq!(visited.len(), expected.len());
    }
}

#[test]
fn test_random_graph_survives_collection() {
    run_random_graph(0x5eed, 2_000, 3);
}

#[test]
#[ignore]
fn test_random_graph_long_running() {
    for seed in 0..20 {
        run_random_graph(seed, 20_000, 5);
    }
}

// ===== Concurrency =====

#[test]
fn test_concurrent_allocations_never_overlap() {
    const PER_THREAD: usize = 2_000;
    init_tracing();
    let threads = num_cpus::get().clamp(2, 8);
    let arena = Arena::new(config()).unwrap();
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let arena = arena.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                arena.attach_thread().unwrap();
                let ty = leaf_type(&arena);
                let root = arena.create_owned_root(PER_THREAD).unwrap();
                barrier.wait();
                for i in 0..PER_THREAD {
                    root.set(i, leaf(&arena, ty, t * PER_THREAD + i));
                }
                barrier.wait();
                let addresses: Vec<usize> = (0..PER_THREAD).map(|i| root.get(i)).collect();
                for (i, &object) in addresses.iter().enumerate() {
                    assert_eq!(read(object, 0), t * PER_THREAD + i);
                }
                // Keep the root alive until every thread has checked
                barrier.wait();
                arena.detach_thread().unwrap();
                addresses
            })
        })
        .collect();

    let mut all = FxHashSet::default();
    for handle in handles {
        for address in handle.join().unwrap() {
            assert!(all.insert(address), "address {address:#x} handed out twice");
        }
    }
    assert_eq!(all.len(), threads * PER_THREAD);
}

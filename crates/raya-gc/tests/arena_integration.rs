//! Integration tests for the moving arena
//!
//! Tests cover:
//! - Allocation of fixed objects, arrays, weak arrays and static objects
//! - Root registration and relocation of rooted references
//! - Minor and full collections
//! - Weak reference splatting
//! - Conservative pinning through ambiguous roots
//! - Heap walks, watches, incremental steps and destruction

use raya_gc::{
    Arena, DescriptorRef, GcArray, GcConfig, GcError, GcWeakArray, OwnedRoot, RootKind, TypeDescriptor, TypeKind,
};
use std::ptr::{null, NonNull};
use std::time::Duration;

fn config() -> GcConfig {
    GcConfig::default()
        .with_native_stack_scanning(false)
        .with_executable_code(false)
}

fn attached_arena() -> Arena {
    let arena = Arena::new(config()).unwrap();
    arena.attach_thread().unwrap();
    arena
}

/// Two reference fields
fn pair_type(arena: &Arena) -> DescriptorRef {
    arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 16, vec![0, 8], None).unwrap())
}

/// One plain integer
fn leaf_type(arena: &Arena) -> DescriptorRef {
    arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 8, vec![], None).unwrap())
}

/// Array of references
fn ref_array_type(arena: &Arena) -> DescriptorRef {
    arena.alloc_type(TypeDescriptor::new(TypeKind::Array, null(), 8, vec![0], None).unwrap())
}

fn write_word(object: usize, index: usize, value: usize) {
    unsafe { *(object as *mut usize).add(index) = value }
}

fn read_word(object: usize, index: usize) -> usize {
    unsafe { *(object as *const usize).add(index) }
}

fn leaf(arena: &Arena, ty: DescriptorRef, value: usize) -> usize {
    let object = arena.allocate(ty).unwrap().as_ptr() as usize;
    write_word(object, 0, value);
    object
}

fn count_objects(arena: &Arena, ty: DescriptorRef) -> usize {
    let mut count = 0;
    arena
        .walk_objects(|_, descriptor| {
            if descriptor == ty {
                count += 1;
            }
        })
        .unwrap();
    count
}

// ===== Allocation =====

#[test]
fn test_allocation_is_zeroed_and_typed() {
    let arena = attached_arena();
    let pair = pair_type(&arena);

    let object = arena.allocate(pair).unwrap();
    assert_eq!(read_word(object.as_ptr() as usize, 0), 0);
    assert_eq!(read_word(object.as_ptr() as usize, 1), 0);
    assert_eq!(unsafe { arena.type_of(object) }, Some(pair));
    assert!(unsafe { arena.is_live(object) });
}

#[test]
fn test_allocation_requires_attached_thread() {
    let arena = Arena::new(config()).unwrap();
    let pair = pair_type(&arena);
    assert!(matches!(arena.allocate(pair), Err(GcError::ThreadNotAttached)));
}

#[test]
fn test_allocation_kind_mismatch() {
    let arena = attached_arena();
    let pair = pair_type(&arena);
    let array = ref_array_type(&arena);

    assert!(matches!(arena.allocate(array), Err(GcError::KindMismatch { .. })));
    assert!(matches!(arena.allocate_array(pair, 4), Err(GcError::KindMismatch { .. })));
}

#[test]
fn test_empty_weak_array_is_none() {
    let arena = attached_arena();
    assert!(arena.allocate_weak_array(0).unwrap().is_none());
}

#[test]
fn test_oversized_array_fails() {
    let arena = Arena::new(config().with_arena_limit(4 * 1024 * 1024)).unwrap();
    arena.attach_thread().unwrap();
    let array = ref_array_type(&arena);

    let err = arena.allocate_array(array, usize::MAX / 4).unwrap_err();
    assert!(err.is_fatal_allocation());
    let err = arena.allocate_array(array, 1024 * 1024).unwrap_err();
    assert!(matches!(err, GcError::OutOfMemory { .. }));
}

// ===== Collection =====

#[test]
fn test_full_collection_keeps_rooted_graph() {
    let arena = attached_arena();
    let pair = pair_type(&arena);
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(1).unwrap();

    // root -> pair -> (leaf 7, leaf 9)
    let head = arena.allocate(pair).unwrap().as_ptr() as usize;
    root.set(0, head);
    let left = leaf(&arena, leaf_ty, 7);
    write_word(root.get(0), 0, left);
    let right = leaf(&arena, leaf_ty, 9);
    write_word(root.get(0), 1, right);

    for _ in 0..10 {
        leaf(&arena, leaf_ty, 0xdead);
    }

    arena.collect().unwrap();

    let head = root.get(0);
    assert_eq!(read_word(read_word(head, 0), 0), 7);
    assert_eq!(read_word(read_word(head, 1), 0), 9);
    assert_eq!(count_objects(&arena, leaf_ty), 2);
    assert_eq!(count_objects(&arena, pair), 1);
    assert!(arena.stats().bytes_reclaimed > 0);
}

#[test]
fn test_minor_collection_moves_young_objects() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(1).unwrap();

    let before = leaf(&arena, leaf_ty, 42);
    root.set(0, before);
    arena.collect_minor().unwrap();

    let after = root.get(0);
    assert_ne!(before, after);
    assert_eq!(read_word(after, 0), 42);
    assert!(arena.stats().objects_moved >= 1);
    assert_eq!(arena.stats().minor_collections, 1);
}

#[test]
fn test_cycle_is_collected() {
    let arena = attached_arena();
    let pair = pair_type(&arena);

    let a = arena.allocate(pair).unwrap().as_ptr() as usize;
    let b = arena.allocate(pair).unwrap().as_ptr() as usize;
    write_word(a, 0, b);
    write_word(b, 0, a);

    arena.collect().unwrap();
    assert_eq!(count_objects(&arena, pair), 0);
}

#[test]
fn test_array_of_1000_references_survives() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let array_ty = ref_array_type(&arena);
    let root = arena.create_owned_root(1).unwrap();

    root.set(0, arena.allocate_array(array_ty, 1000).unwrap().as_ptr() as usize);
    for i in 0..1000 {
        let element = leaf(&arena, leaf_ty, i * 3);
        let array = unsafe { GcArray::from_raw(NonNull::new(root.get(0) as *mut u8).unwrap()) };
        array.set(i, element);
    }

    arena.collect().unwrap();

    let array = unsafe { GcArray::from_raw(NonNull::new(root.get(0) as *mut u8).unwrap()) };
    assert_eq!(array.count(), 1000);
    for i in 0..1000 {
        assert_eq!(read_word(array.get(i), 0), i * 3);
    }
    assert_eq!(count_objects(&arena, leaf_ty), 1000);
}

#[test]
fn test_exact_root_range_is_updated() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let mut slots = [0usize; 3];
    slots[0] = leaf(&arena, leaf_ty, 1);
    slots[2] = leaf(&arena, leaf_ty, 3);

    let handle = unsafe {
        arena
            .create_root(RootKind::Exact {
                base: slots.as_mut_ptr(),
                count: slots.len(),
            })
            .unwrap()
    };
    arena.collect().unwrap();
    arena.destroy_root(handle).unwrap();

    assert_eq!(read_word(slots[0], 0), 1);
    assert_eq!(slots[1], 0);
    assert_eq!(read_word(slots[2], 0), 3);
    assert!(matches!(arena.destroy_root(handle), Err(GcError::UnknownRoot(_))));
}

#[test]
fn test_ambiguous_root_pins_target() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let words = [leaf(&arena, leaf_ty, 5), 12345usize];

    let handle = unsafe {
        arena
            .create_root(RootKind::Ambiguous {
                base: words.as_ptr(),
                count: words.len(),
            })
            .unwrap()
    };
    arena.collect().unwrap();

    // Ambiguous words are never rewritten: the target stayed in place
    assert_eq!(read_word(words[0], 0), 5);
    assert_eq!(words[1], 12345);
    assert!(arena.stats().objects_pinned >= 1);
    arena.destroy_root(handle).unwrap();
}

#[test]
fn test_native_stack_reference_survives() {
    let arena = Arena::new(GcConfig::default().with_executable_code(false)).unwrap();
    arena.attach_thread().unwrap();
    let leaf_ty = leaf_type(&arena);

    let object = std::hint::black_box(leaf(&arena, leaf_ty, 77));
    arena.collect().unwrap();
    assert_eq!(read_word(std::hint::black_box(object), 0), 77);
    arena.detach_thread().unwrap();
}

#[test]
fn test_static_objects_do_not_move() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(1).unwrap();

    let object = arena.allocate_static(leaf_ty).unwrap().as_ptr() as usize;
    write_word(object, 0, 11);
    root.set(0, object);
    arena.collect().unwrap();
    arena.collect().unwrap();
    assert_eq!(root.get(0), object);
    assert_eq!(read_word(object, 0), 11);
}

// ===== Weak arrays =====

#[test]
fn test_weak_slot_splatted_exactly_once() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let roots = OwnedRootPair::new(&arena);

    let weak = arena.allocate_weak_array(2).unwrap().unwrap();
    roots.weak.set(0, weak.as_ptr() as usize);
    let weak = unsafe { GcWeakArray::from_raw(weak) };

    let kept = leaf(&arena, leaf_ty, 8);
    roots.strong.set(0, kept);
    weak.set(0, kept);
    weak.set(1, leaf(&arena, leaf_ty, 9));
    assert_eq!(weak.splatted(), 0);

    arena.collect().unwrap();

    // Weak arrays never move, so the handle stays valid
    assert_eq!(roots.weak.get(0), weak.as_ptr() as usize);
    assert_eq!(weak.get(0), roots.strong.get(0));
    assert_eq!(read_word(weak.get(0), 0), 8);
    assert_eq!(weak.get(1), 0);
    assert_eq!(weak.splatted(), 1);

    arena.collect().unwrap();
    assert_eq!(weak.splatted(), 1);
    assert_eq!(arena.stats().weak_splatted, 1);
}

struct OwnedRootPair {
    weak: OwnedRoot,
    strong: OwnedRoot,
}

impl OwnedRootPair {
    fn new(arena: &Arena) -> Self {
        Self {
            weak: arena.create_owned_root(1).unwrap(),
            strong: arena.create_owned_root(1).unwrap(),
        }
    }
}

// ===== Types =====

#[test]
fn test_switch_type_checks_layout() {
    let arena = attached_arena();
    let pair = pair_type(&arena);
    let other_pair = arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 16, vec![0, 8], None).unwrap());
    let leaf_ty = leaf_type(&arena);

    let object = arena.allocate(pair).unwrap();
    unsafe {
        arena.switch_type(object, other_pair).unwrap();
        assert_eq!(arena.type_of(object), Some(other_pair));
        assert!(matches!(arena.switch_type(object, leaf_ty), Err(GcError::StrideMismatch(_))));
    }
}

#[test]
fn test_free_type_reclaimed_when_unused() {
    let arena = attached_arena();
    for _ in 0..200 {
        let ty = leaf_type(&arena);
        arena.free_type(ty).unwrap();
    }
    arena.collect().unwrap();
    assert!(arena.stats().descriptors_reclaimed >= 101);
}

#[test]
fn test_type_object_keeps_described_type_alive() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    // Dispatch table, described type, one ordinary reference
    let meta = arena.alloc_type(
        TypeDescriptor::new(TypeKind::TypeDescriptorItself, null(), 24, vec![8, 16], None).unwrap(),
    );
    let described = leaf_type(&arena);
    let root = arena.create_owned_root(1).unwrap();

    let type_object = arena.allocate(meta).unwrap().as_ptr() as usize;
    write_word(type_object, 1, described.as_ptr() as usize);
    write_word(type_object, 2, leaf(&arena, leaf_ty, 99));
    root.set(0, type_object);
    arena.free_type(described).unwrap();

    arena.collect().unwrap();
    assert_eq!(arena.stats().descriptors_reclaimed, 0);
    // Type objects live in the static pool
    assert_eq!(root.get(0), type_object);
    assert_eq!(read_word(type_object, 1), described.as_ptr() as usize);
    assert_eq!(read_word(read_word(type_object, 2), 0), 99);

    drop(root);
    arena.collect().unwrap();
    assert_eq!(arena.stats().descriptors_reclaimed, 1);
}

// ===== Walks, watches and steps =====

#[test]
fn test_walk_after_collection_sees_only_survivors() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(50).unwrap();

    for i in 0..100 {
        let object = leaf(&arena, leaf_ty, i);
        if i % 2 == 0 {
            root.set(i / 2, object);
        }
    }
    assert_eq!(count_objects(&arena, leaf_ty), 100);

    arena.collect().unwrap();

    let mut values = Vec::new();
    arena
        .walk_objects(|object, descriptor| {
            if descriptor == leaf_ty {
                values.push(read_word(object.as_ptr() as usize, 0));
            }
        })
        .unwrap();
    values.sort_unstable();
    assert_eq!(values, (0..100).step_by(2).collect::<Vec<_>>());
    assert!(arena.check_memory().unwrap() >= 50);
}

#[test]
fn test_watch_reports_moves() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(2).unwrap();

    let young = leaf(&arena, leaf_ty, 1);
    root.set(0, young);
    let fixed = arena.allocate_static(leaf_ty).unwrap().as_ptr() as usize;
    root.set(1, fixed);

    let mut watch = arena.create_watch();
    watch.add(young);
    watch.add(fixed);
    assert!(!watch.moved());

    arena.collect_minor().unwrap();

    assert!(watch.moved_addr(young));
    assert!(!watch.moved_addr(fixed));
    assert!(watch.moved_addr(0x1000));
}

#[test]
fn test_collect_step_converges() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    for i in 0..1000 {
        leaf(&arena, leaf_ty, i);
    }

    let mut steps = 0;
    while arena.collect_step(Duration::from_millis(10)).unwrap() {
        steps += 1;
        assert!(steps < 10, "collect_step did not converge");
    }
    assert!(steps >= 1);
    assert!(!arena.collect_step(Duration::ZERO).unwrap());
}

#[test]
fn test_nursery_limit_triggers_collection() {
    let arena = Arena::new(config().with_nursery_limit(256 * 1024)).unwrap();
    arena.attach_thread().unwrap();
    let leaf_ty = leaf_type(&arena);
    let root = arena.create_owned_root(1).unwrap();
    root.set(0, leaf(&arena, leaf_ty, 99));

    for i in 0..100_000 {
        leaf(&arena, leaf_ty, i);
    }

    let stats = arena.stats();
    assert!(stats.collections >= 1);
    assert_eq!(read_word(root.get(0), 0), 99);
}

// ===== Lifecycle =====

#[test]
fn test_destroy_makes_arena_unusable() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    leaf(&arena, leaf_ty, 1);

    arena.destroy().unwrap();
    assert!(arena.is_destroyed());
    assert!(matches!(arena.allocate(leaf_ty), Err(GcError::Destroyed)));
    assert!(matches!(arena.collect(), Err(GcError::Destroyed)));
    assert!(!arena.is_attached());
    arena.destroy().unwrap();
}

#[test]
fn test_summary_tracks_pools() {
    let arena = attached_arena();
    let leaf_ty = leaf_type(&arena);
    leaf(&arena, leaf_ty, 1);
    arena.allocate_static(leaf_ty).unwrap();
    arena.allocate_code(64, 0).unwrap();

    let summary = arena.summary();
    assert!(summary.mapped > 0);
    assert!(summary.static_objects.blocks >= 1);
    assert!(summary.code.blocks >= 1);
    let json = serde_json::to_string(&summary).unwrap();
    assert!(json.contains("static_objects"));
}

//! Both backends behind the same contract
//!
//! Every test runs against the moving arena and the fallback heap through
//! `dyn GcBackend`, the way the runtime uses them.

use raya_gc::{Arena, GcArray, GcBackend, GcConfig, GcError, GcWeakArray, MallocBackend, TypeDescriptor, TypeKind};
use std::ptr::null;
use std::time::Duration;

fn config() -> GcConfig {
    GcConfig::default().with_executable_code(false)
}

fn backends() -> Vec<Box<dyn GcBackend>> {
    vec![
        Box::new(Arena::new(config()).unwrap()),
        Box::new(MallocBackend::new(config())),
    ]
}

#[test]
fn test_contract_allocation_layout() {
    for backend in backends() {
        backend.attach_thread().unwrap();
        let fixed = backend.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 24, vec![8], None).unwrap());
        let array_ty = backend.alloc_type(TypeDescriptor::new(TypeKind::Array, null(), 4, vec![], None).unwrap());

        let object = backend.allocate(fixed).unwrap();
        assert_eq!(unsafe { backend.type_of(object) }, Some(fixed), "{}", backend.name());

        let array = backend.allocate_array(array_ty, 10).unwrap();
        let array = unsafe { GcArray::from_raw(array) };
        assert_eq!(array.count(), 10);
        assert_eq!(array.filled(), 0);

        let weak = backend.allocate_weak_array(3).unwrap().unwrap();
        assert_eq!(unsafe { GcWeakArray::from_raw(weak) }.count(), 3);
        assert!(backend.allocate_weak_array(0).unwrap().is_none());

        let code = backend.allocate_code(12, 2).unwrap();
        assert_eq!(unsafe { backend.type_of(code) }, None);

        backend.detach_thread().unwrap();
    }
}

#[test]
fn test_contract_errors() {
    for backend in backends() {
        let fixed = backend.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 8, vec![], None).unwrap());
        assert!(matches!(backend.allocate(fixed), Err(GcError::ThreadNotAttached)));

        backend.attach_thread().unwrap();
        assert!(matches!(
            backend.allocate_array(fixed, 1),
            Err(GcError::KindMismatch { .. })
        ));
        backend.detach_thread().unwrap();
    }
}

#[test]
fn test_contract_collection_entry_points() {
    for backend in backends() {
        backend.attach_thread().unwrap();
        let fixed = backend.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 8, vec![], None).unwrap());
        for _ in 0..100 {
            backend.allocate(fixed).unwrap();
        }

        backend.collect().unwrap();
        let mut steps = 0;
        while backend.collect_step(Duration::from_millis(1)).unwrap() {
            steps += 1;
            assert!(steps < 10, "{} did not converge", backend.name());
        }
        assert_eq!(backend.run_finalizers().unwrap(), 0);

        let mut seen = 0;
        backend.walk_objects(&mut |_, _| seen += 1).unwrap();
        if backend.name() == "malloc" {
            assert_eq!(seen, 100);
        }
        backend.free_type(fixed).unwrap();
        backend.detach_thread().unwrap();
    }
}

use kernel_sync::{Service, ServiceError};
use std::panic;
use std::rc::Rc;

#[test]
fn empty_until_installed() {
    let s: Service<u32> = Service::new();
    assert!(!s.is_installed());
    assert_eq!(s.with(|v| *v), Err(ServiceError::NotInstalled));

    s.install(7).unwrap();
    assert!(s.is_installed());
    assert_eq!(s.with(|v| *v), Ok(7));
}

#[test]
fn second_install_is_rejected() {
    let s = Service::new();
    s.install(1u8).unwrap();
    assert_eq!(s.install(2), Err(ServiceError::AlreadyInstalled));
    assert_eq!(s.with(|v| *v), Ok(1));
}

#[test]
fn mutation_persists_between_borrows() {
    let s = Service::new();
    s.install(String::from("a")).unwrap();
    let len = s
        .with(|v| {
            v.push('b');
            v.len()
        })
        .unwrap();
    assert_eq!(len, 2);
    assert_eq!(s.with(|v| v.clone()).unwrap(), "ab");
}

#[test]
fn reentrant_use_reports_busy() {
    let s = Service::new();
    s.install(0u32).unwrap();

    let inner = s.with(|_| s.with(|v| *v)).unwrap();
    assert_eq!(inner, Err(ServiceError::Busy));

    // the outer borrow ended; the slot is usable again
    assert_eq!(s.with(|v| *v), Ok(0));
}

#[test]
fn slot_is_released_on_panic() {
    let s = Service::new();
    s.install(0u32).unwrap();

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _ = s.with(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(s.with(|v| *v), Ok(123));
}

#[test]
fn installed_value_is_dropped_with_the_slot() {
    let marker = Rc::new(());
    {
        let s = Service::new();
        s.install(Rc::clone(&marker)).unwrap();
        assert_eq!(Rc::strong_count(&marker), 2);
    }
    assert_eq!(Rc::strong_count(&marker), 1);
}

#[test]
fn get_mut_bypasses_the_state_machine() {
    let mut s = Service::new();
    assert!(s.get_mut().is_none());
    s.install(vec![1, 2, 3]).unwrap();
    s.get_mut().unwrap().push(4);
    assert_eq!(s.with(|v| v.len()), Ok(4));
}

/// Spot-check a concrete instantiation compiles as Sync.
#[test]
fn service_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    static GLOBAL: Service<u64> = Service::new();
    takes_sync(&GLOBAL);
}

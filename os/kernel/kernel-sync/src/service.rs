use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

/// 0 = EMPTY, 1 = INSTALLING, 2 = READY, 3 = BUSY
const EMPTY: u8 = 0;
const INSTALLING: u8 = 1;
const READY: u8 = 2;
const BUSY: u8 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("service used before it was installed")]
    NotInstalled,
    #[error("service installed twice")]
    AlreadyInstalled,
    #[error("service re-entered while in use")]
    Busy,
}

/// A singleton slot that is explicitly installed once and then borrowed
/// exclusively through [`with`](Self::with).
///
/// Unlike a lock, a `Service` never waits: a second borrow while one is
/// active fails with [`ServiceError::Busy`]. In a single execution context
/// that can only mean re-entry (an interrupt handler calling back into the
/// owner), which must not be allowed to observe half-updated state.
///
/// ```rust
/// # use kernel_sync::{Service, ServiceError};
/// static COUNTER: Service<u32> = Service::new();
///
/// assert_eq!(COUNTER.with(|c| *c), Err(ServiceError::NotInstalled));
/// COUNTER.install(41).unwrap();
/// assert_eq!(COUNTER.with(|c| { *c += 1; *c }), Ok(42));
/// ```
pub struct Service<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for Service<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Service<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value`. Fails if a value was installed before.
    ///
    /// # Errors
    /// [`ServiceError::AlreadyInstalled`] when the slot is not empty.
    pub fn install(&self, value: T) -> Result<(), ServiceError> {
        if self
            .state
            .compare_exchange(EMPTY, INSTALLING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ServiceError::AlreadyInstalled);
        }

        // SAFETY: INSTALLING grants us the only access to the slot.
        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn is_installed(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), READY | BUSY)
    }

    /// Runs `f` with exclusive access to the installed value.
    ///
    /// # Errors
    /// [`ServiceError::NotInstalled`] before [`install`](Self::install),
    /// [`ServiceError::Busy`] when called from inside another `with`.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ServiceError> {
        if let Err(state) =
            self.state
                .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            return Err(if state == BUSY {
                ServiceError::Busy
            } else {
                ServiceError::NotInstalled
            });
        }

        let _release = Release(&self.state);
        // SAFETY: BUSY grants exclusive access; READY guarantees initialization.
        let value = unsafe { (*self.value.get()).assume_init_mut() };
        Ok(f(value))
    }

    /// Mutable access without the state machine; `&mut self` rules out contention.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if *self.state.get_mut() == READY {
            // SAFETY: READY guarantees initialization.
            Some(unsafe { self.value.get_mut().assume_init_mut() })
        } else {
            None
        }
    }
}

/// Returns the slot to READY when the borrow ends, including on unwind.
struct Release<'a>(&'a AtomicU8);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(READY, Ordering::Release);
    }
}

impl<T> Drop for Service<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY guarantees initialization; we drop it exactly once.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// Safety: the state machine hands out at most one `&mut T` at a time.
unsafe impl<T: Send> Sync for Service<T> {}
unsafe impl<T: Send> Send for Service<T> {}

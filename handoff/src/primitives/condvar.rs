use std::{cell::UnsafeCell, mem::MaybeUninit, time::Duration};

use libc::{
    c_int, clock_gettime, pthread_cond_broadcast, pthread_cond_destroy, pthread_cond_init,
    pthread_cond_signal, pthread_cond_t, pthread_cond_timedwait, pthread_cond_wait,
    pthread_condattr_destroy, pthread_condattr_init, pthread_condattr_setclock, timespec,
    CLOCK_MONOTONIC, ETIMEDOUT,
};

use crate::CheckOk;

use super::MutexGuard;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Process-private pthread condition variable on `CLOCK_MONOTONIC`.
pub struct Condvar {
    inner: UnsafeCell<MaybeUninit<pthread_cond_t>>,
}

impl Condvar {
    pub fn new() -> Self {
        let inner = UnsafeCell::new(MaybeUninit::uninit());
        let mut attr = MaybeUninit::uninit();
        unsafe {
            pthread_condattr_init(attr.as_mut_ptr())
                .r("condattr_init")
                .unwrap();
            pthread_condattr_setclock(attr.as_mut_ptr(), CLOCK_MONOTONIC)
                .r("condattr_setclock")
                .unwrap();
            pthread_cond_init((*inner.get()).as_mut_ptr(), attr.as_ptr())
                .r("cond_init")
                .unwrap();
            pthread_condattr_destroy(attr.as_mut_ptr());
        }

        Self { inner }
    }

    pub fn signal(&self) {
        unsafe {
            if pthread_cond_signal((*self.inner.get()).as_mut_ptr()) != 0 {
                panic!("failed to signal condvar");
            }
        }
    }

    pub fn broadcast(&self) {
        unsafe {
            if pthread_cond_broadcast((*self.inner.get()).as_mut_ptr()) != 0 {
                panic!("failed to broadcast condvar");
            }
        }
    }

    pub fn wait<'m, T>(&self, guard: MutexGuard<'m, T>) -> MutexGuard<'m, T> {
        unsafe {
            if pthread_cond_wait((*self.inner.get()).as_mut_ptr(), guard.raw_lock()) != 0 {
                panic!("failed to wait on condvar");
            }
        }
        guard
    }

    /// The flag reports whether the deadline passed.
    pub fn wait_timeout<'m, T>(
        &self,
        guard: MutexGuard<'m, T>,
        timeout: Duration,
    ) -> (MutexGuard<'m, T>, bool) {
        let result = unsafe {
            cond_wait_timeout(
                (*self.inner.get()).as_mut_ptr(),
                guard.raw_lock(),
                timeout,
            )
        };
        match result {
            0 => (guard, false),
            ETIMEDOUT => (guard, true),
            e => panic!("failed to wait for condvar: {e}"),
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Drop for Condvar {
    fn drop(&mut self) {
        if unsafe { pthread_cond_destroy((*self.inner.get()).as_mut_ptr()) } != 0 {
            panic!("failed to destroy condvar");
        }
    }
}

unsafe fn cond_wait_timeout(
    cond: *mut pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
    timeout: Duration,
) -> c_int {
    let mut now = MaybeUninit::<timespec>::uninit();
    clock_gettime(CLOCK_MONOTONIC, now.as_mut_ptr())
        .r("clock_gettime")
        .unwrap();
    let now = now.assume_init();

    let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2);
    let mut tv_sec = (now.tv_sec as i64).saturating_add(secs);
    let mut tv_nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if tv_nsec >= NANOS_PER_SEC {
        tv_sec = tv_sec.saturating_add(1);
        tv_nsec -= NANOS_PER_SEC;
    }

    let deadline = timespec {
        tv_sec: tv_sec as _,
        tv_nsec: tv_nsec as _,
    };
    pthread_cond_timedwait(cond, mutex, &raw const deadline)
}

#[cfg(test)]
mod test {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use super::Condvar;
    use crate::primitives::Mutex;

    #[test]
    fn wait_timeout_expires() {
        let lock = Mutex::new(());
        let cond = Condvar::new();
        let start = Instant::now();
        let (_guard, timed_out) = cond.wait_timeout(lock.lock(), Duration::from_millis(30));
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn signal_wakes_waiter() {
        let ready = Mutex::new(false);
        let cond = Condvar::new();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                *ready.lock() = true;
                cond.signal();
            });

            let mut guard = ready.lock();
            while !*guard {
                guard = cond.wait(guard);
            }
        });
        assert!(*ready.lock());
    }
}

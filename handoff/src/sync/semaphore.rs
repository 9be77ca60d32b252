use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{
    primitives::{Condvar, Mutex},
    truncated_name, Name, NotifyError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    #[default]
    Forever,
    Poll,
    For(Duration),
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        let now = Instant::now();
        match self {
            Wait::Forever => None,
            Wait::Poll => Some(now),
            // Durations too large to represent are as good as forever.
            Wait::For(timeout) => now.checked_add(timeout),
        }
    }
}

static NEXT_LEASE: AtomicU64 = AtomicU64::new(1);

/// Exclusive right to raise a leased semaphore's count.
#[derive(Debug)]
pub struct Lease {
    key: u64,
}

#[derive(Debug)]
struct State {
    count: u32,
    limit: u32,
    base_limit: u32,
    aborted: bool,
    lease: Option<u64>,
}

impl State {
    fn unleased(&self) -> Result<(), NotifyError> {
        match self.lease {
            Some(_) => Err(NotifyError::Leased),
            None => Ok(()),
        }
    }
}

/// Counting semaphore guarded by a pthread mutex and condition variable.
/// The count never exceeds the limit; a `give` that would overshoot it is
/// refused and leaves the count untouched.
pub struct Semaphore {
    name: Name,
    state: Mutex<State>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(name: &str, initial: u32) -> Self {
        Self::with_limit(name, initial, u32::MAX)
    }

    pub fn with_limit(name: &str, initial: u32, limit: u32) -> Self {
        assert!(
            initial <= limit,
            "initial count {initial} exceeds limit {limit}"
        );
        Self {
            name: truncated_name(name),
            state: Mutex::new(State {
                count: initial,
                limit,
                base_limit: limit,
                aborted: false,
                lease: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn limit(&self) -> u32 {
        self.state.lock().limit
    }

    pub fn is_leased(&self) -> bool {
        self.state.lock().lease.is_some()
    }

    /// Adds `n` to the count and wakes waiters. Returns the count before the
    /// update.
    pub fn give(&self, n: u32) -> Result<u32, NotifyError> {
        let mut state = self.state.lock();
        state.unleased()?;
        self.add(&mut state, n)
    }

    /// Blocks until the count is positive, then decrements it. Returns the
    /// count before the decrement.
    pub fn take(&self) -> u32 {
        let mut state = self.state.lock();
        while state.count == 0 {
            state = self.cond.wait(state);
        }
        let previous = state.count;
        state.count = previous - 1;
        previous
    }

    pub fn take_timeout(&self, timeout: Duration) -> Option<u32> {
        self.take_with(Wait::For(timeout), false)
    }

    pub fn try_take(&self) -> Option<u32> {
        self.take_with(Wait::Poll, false)
    }

    /// Waits according to `wait`, then decrements the count, or zeroes it
    /// with `clear_on_exit`. `None` means the wait expired or was aborted.
    pub fn take_with(&self, wait: Wait, clear_on_exit: bool) -> Option<u32> {
        let deadline = wait.deadline();
        let mut state = self.state.lock();
        while state.count == 0 {
            if state.aborted {
                state.aborted = false;
                return None;
            }
            match deadline {
                None => state = self.cond.wait(state),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    state = self.cond.wait_timeout(state, remaining).0;
                }
            }
        }
        let previous = state.count;
        state.count = if clear_on_exit { 0 } else { previous - 1 };
        // An abort nobody had to wait for is stale.
        state.aborted = false;
        Some(previous)
    }

    pub fn set(&self, value: u32) -> Result<u32, NotifyError> {
        let mut state = self.state.lock();
        state.unleased()?;
        let previous = state.count;
        state.count = checked_count(previous, Some(value), state.limit)?;
        self.wake(value);
        Ok(previous)
    }

    /// Overwrites the count only if the previous value has been consumed.
    pub fn set_if_clear(&self, value: u32) -> Result<(), NotifyError> {
        let mut state = self.state.lock();
        state.unleased()?;
        if state.count != 0 {
            return Err(NotifyError::Pending(state.count));
        }
        state.count = checked_count(0, Some(value), state.limit)?;
        self.wake(value);
        Ok(())
    }

    pub fn set_bits(&self, mask: u32) -> Result<u32, NotifyError> {
        let mut state = self.state.lock();
        state.unleased()?;
        let previous = state.count;
        state.count = checked_count(previous, Some(previous | mask), state.limit)?;
        self.wake(state.count);
        Ok(previous)
    }

    /// Takes the semaphore over: the count becomes `initial`, the limit
    /// `limit`, and only [`give_leased`](Self::give_leased) with the returned
    /// lease can raise the count until it is released. Takes still work.
    ///
    /// Refused while another lease is held, while an earlier value is still
    /// unconsumed, or if `limit` exceeds the semaphore's own limit.
    pub fn lease(&self, initial: u32, limit: u32) -> Result<Lease, NotifyError> {
        let mut state = self.state.lock();
        state.unleased()?;
        if state.count != 0 {
            return Err(NotifyError::Pending(state.count));
        }
        if limit > state.base_limit {
            return Err(NotifyError::Overflow {
                count: 0,
                limit: state.base_limit,
            });
        }
        state.count = checked_count(0, Some(initial), limit)?;
        state.limit = limit;
        state.aborted = false;
        let key = NEXT_LEASE.fetch_add(1, Ordering::Relaxed);
        state.lease = Some(key);
        self.wake(initial);
        Ok(Lease { key })
    }

    pub fn give_leased(&self, lease: &Lease, n: u32) -> Result<u32, NotifyError> {
        let mut state = self.state.lock();
        if state.lease != Some(lease.key) {
            return Err(NotifyError::Leased);
        }
        self.add(&mut state, n)
    }

    /// Ends `lease`, zeroing the count and restoring the original limit.
    /// A lease that no longer holds the semaphore is ignored.
    pub fn release(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if state.lease == Some(lease.key) {
            state.lease = None;
            state.count = 0;
            state.limit = state.base_limit;
            state.aborted = false;
        }
    }

    /// Cuts short the current `take_with` wait, or the next one that would
    /// block. Plain `take` is not affected.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.cond.broadcast();
    }

    pub fn debug_str(&self) -> String {
        self.to_string()
    }

    fn add(&self, state: &mut State, n: u32) -> Result<u32, NotifyError> {
        let previous = state.count;
        if n == 0 {
            return Ok(previous);
        }
        state.count = checked_count(previous, previous.checked_add(n), state.limit)?;
        self.wake(n);
        Ok(previous)
    }

    fn wake(&self, added: u32) {
        match added {
            0 => {}
            1 => self.cond.signal(),
            _ => self.cond.broadcast(),
        }
    }
}

fn checked_count(count: u32, next: Option<u32>, limit: u32) -> Result<u32, NotifyError> {
    next.filter(|next| *next <= limit)
        .ok_or(NotifyError::Overflow { count, limit })
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.state.lock().count;
        write!(f, "semaphore '{}', count={}", self.name, count)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("name", &self.name.as_str())
            .field("count", &state.count)
            .field("limit", &state.limit)
            .field("leased", &state.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use super::{Semaphore, Wait};
    use crate::NotifyError;

    #[test]
    fn take_returns_count_before_decrement() {
        let sem = Semaphore::new("free", 3);
        assert_eq!(sem.take(), 3);
        assert_eq!(sem.take(), 2);
        assert_eq!(sem.give(1), Ok(1));
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn take_blocks_until_give() {
        let sem = Semaphore::new("items", 0);
        let start = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                sem.give(1).unwrap();
            });
            assert_eq!(sem.take(), 1);
        });
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn bounded_takes_on_empty() {
        let sem = Semaphore::new("items", 0);
        assert_eq!(sem.try_take(), None);

        let start = Instant::now();
        assert_eq!(sem.take_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));

        sem.give(2).unwrap();
        assert_eq!(sem.try_take(), Some(2));
        assert_eq!(sem.take_timeout(Duration::from_millis(30)), Some(1));
    }

    #[test]
    fn give_respects_limit() {
        let sem = Semaphore::with_limit("bounded", 3, 4);
        assert_eq!(sem.give(1), Ok(3));
        assert_eq!(
            sem.give(1),
            Err(NotifyError::Overflow { count: 4, limit: 4 })
        );
        assert_eq!(
            sem.give(u32::MAX),
            Err(NotifyError::Overflow { count: 4, limit: 4 })
        );
        assert_eq!(sem.count(), 4);
        assert_eq!(sem.give(0), Ok(4));
    }

    #[test]
    fn set_variants() {
        let sem = Semaphore::with_limit("slot", 0, 8);
        assert_eq!(sem.set_if_clear(4), Ok(()));
        assert_eq!(sem.set_if_clear(2), Err(NotifyError::Pending(4)));
        assert_eq!(sem.set(1), Ok(4));
        assert_eq!(sem.set_bits(0b110), Ok(1));
        assert_eq!(sem.count(), 0b111);
        assert!(sem.set(9).is_err());
        assert_eq!(sem.count(), 0b111);
    }

    #[test]
    fn clear_on_exit_zeroes_count() {
        let sem = Semaphore::new("binary", 5);
        assert_eq!(sem.take_with(Wait::Poll, true), Some(5));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn abort_cuts_wait_short() {
        let sem = Semaphore::new("waiter", 0);
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                sem.abort();
            });
            assert_eq!(sem.take_with(Wait::Forever, false), None);
        });

        // Held for the next blocking wait, then consumed.
        sem.abort();
        assert_eq!(sem.take_with(Wait::Forever, false), None);
        assert_eq!(sem.try_take(), None);

        // A positive count wins over a pending abort, and uses it up.
        sem.abort();
        sem.give(1).unwrap();
        assert_eq!(sem.take_with(Wait::Forever, false), Some(1));
        let start = Instant::now();
        assert_eq!(sem.take_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn lease_locks_out_other_givers() {
        let sem = Semaphore::with_limit("slots", 0, 255);
        let lease = sem.lease(4, 4).unwrap();
        assert!(sem.is_leased());
        assert_eq!(sem.count(), 4);
        assert_eq!(sem.limit(), 4);

        assert_eq!(sem.give(1), Err(NotifyError::Leased));
        assert_eq!(sem.set(9), Err(NotifyError::Leased));
        assert_eq!(sem.set_if_clear(1), Err(NotifyError::Leased));
        assert_eq!(sem.set_bits(1), Err(NotifyError::Leased));
        assert_eq!(sem.lease(0, 4).err(), Some(NotifyError::Leased));
        assert_eq!(sem.count(), 4);

        // The holder is still capped by the leased limit.
        assert_eq!(
            sem.give_leased(&lease, 1),
            Err(NotifyError::Overflow { count: 4, limit: 4 })
        );
        assert_eq!(sem.take_with(Wait::Poll, false), Some(4));
        assert_eq!(sem.give_leased(&lease, 1), Ok(3));

        sem.abort();
        sem.release(&lease);
        assert!(!sem.is_leased());
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.limit(), 255);
        // The release also dropped the pending abort.
        let start = Instant::now();
        assert_eq!(sem.take_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));

        // A stale lease cannot touch the next holder's semaphore.
        let next = sem.lease(0, 2).unwrap();
        assert_eq!(sem.give_leased(&lease, 1), Err(NotifyError::Leased));
        sem.release(&lease);
        assert!(sem.is_leased());
        assert_eq!(sem.give_leased(&next, 1), Ok(0));
    }

    #[test]
    fn lease_needs_a_consumed_value_and_room() {
        let sem = Semaphore::with_limit("slots", 1, 8);
        assert_eq!(sem.lease(0, 4).err(), Some(NotifyError::Pending(1)));
        sem.take();
        assert_eq!(
            sem.lease(0, 9).err(),
            Some(NotifyError::Overflow { count: 0, limit: 8 })
        );
        assert!(!sem.is_leased());
    }

    #[test]
    fn every_blocked_taker_is_released() {
        const WAITERS: usize = 4;
        let sem = Semaphore::new("many", 0);
        let done = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..WAITERS {
                s.spawn(|| {
                    sem.take();
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
            thread::sleep(Duration::from_millis(30));
            for _ in 0..WAITERS {
                sem.give(1).unwrap();
            }
        });
        assert_eq!(done.load(Ordering::SeqCst), WAITERS);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn bulk_give_wakes_all_waiters() {
        let sem = Semaphore::new("bulk", 0);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| sem.take());
            }
            thread::sleep(Duration::from_millis(30));
            sem.give(3).unwrap();
        });
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn debug_str_reports_name_and_count() {
        let sem = Semaphore::new("a-rather-long-semaphore-name", 2);
        assert_eq!(sem.name(), "a-rather-long-se");
        assert_eq!(sem.debug_str(), "semaphore 'a-rather-long-se', count=2");
    }
}

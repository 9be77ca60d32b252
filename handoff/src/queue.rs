//! Fixed-capacity queue handing values from one producer task to one
//! consumer task. The producer's notification channel counts free slots, the
//! consumer's counts ready items; both are leased to the queue for its
//! lifetime, so a slot is only ever touched by the side holding its permit.

use std::{
    cell::UnsafeCell,
    error::Error,
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};

use crate::{
    diag::nwarn,
    sync::Wait,
    task::{Channel, Emulated, TaskNotify},
    IndexT, MAX_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueConfig {
    /// Per-attempt wait of blocking `push`/`pop`. An expired attempt is
    /// reported as a stall and retried. Must not be `Wait::Poll`.
    pub wait: Wait,
}

/// A bounded push gave up; the value is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError<T> {
    Timeout(T),
    Aborted(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Timeout(value) | PushError::Aborted(value) => value,
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Timeout(_) => f.write_str("timed out waiting for a free slot"),
            PushError::Aborted(_) => f.write_str("wait for a free slot was aborted"),
        }
    }
}

impl<T: fmt::Debug> Error for PushError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Timeout,
    Aborted,
}

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopError::Timeout => f.write_str("timed out waiting for an item"),
            PopError::Aborted => f.write_str("wait for an item was aborted"),
        }
    }
}

impl Error for PopError {}

/// Single-producer/single-consumer queue of capacity `N` (`1..=255`).
///
/// `push`-side calls must come from the thread bound to the producer task,
/// `pop`-side calls from the one bound to the consumer task; anything else
/// panics. Other capacities do not compile:
///
/// ```compile_fail
/// use handoff::{Queue, TaskHandle};
///
/// let queue: anyhow::Result<Queue<u8, 256>> =
///     Queue::new(TaskHandle::new("p"), 0, TaskHandle::new("c"), 0);
/// ```
///
/// ```
/// use std::thread;
/// use handoff::{set_current_task, Queue, TaskHandle};
///
/// let producer = TaskHandle::new("Producer");
/// let consumer = TaskHandle::new("Consumer");
/// let queue: Queue<String, 4> = Queue::new(producer.clone(), 1, consumer.clone(), 2)?;
///
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _bound = set_current_task(&producer).unwrap();
///         queue.push("hello".to_string());
///     });
///     s.spawn(|| {
///         let _bound = set_current_task(&consumer).unwrap();
///         assert_eq!(queue.recv(), "hello");
///     });
/// });
/// # anyhow::Ok(())
/// ```
pub struct Queue<T, const N: usize, B: TaskNotify = Emulated> {
    slots: [UnsafeCell<Option<T>>; N],
    // Written by the consumer only.
    front: AtomicU8,
    // Written by the producer only.
    back: AtomicU8,
    producer: B::Task,
    producer_channel: Channel,
    producer_lease: B::Lease,
    consumer: B::Task,
    consumer_channel: Channel,
    consumer_lease: B::Lease,
    config: QueueConfig,
    _backend: PhantomData<fn() -> B>,
}

// Slots are only reached through a permit taken on the owning side's leased
// channel, and `TaskNotify` guarantees each side runs on a single thread.
unsafe impl<T: Send, const N: usize, B: TaskNotify> Sync for Queue<T, N, B> {}

impl<T, const N: usize, B: TaskNotify> Queue<T, N, B> {
    const VALID_CAPACITY: () = assert!(
        N > 0 && N <= MAX_CAPACITY,
        "queue capacity must be within 1..=255"
    );

    pub fn new(
        producer: B::Task,
        producer_channel: Channel,
        consumer: B::Task,
        consumer_channel: Channel,
    ) -> anyhow::Result<Self> {
        Self::with_config(
            producer,
            producer_channel,
            consumer,
            consumer_channel,
            QueueConfig::default(),
        )
    }

    /// Leases the producer's channel primed with `N` free slots and the
    /// consumer's with 0 ready items, both capped at `N`.
    ///
    /// Fails if both roles name the same task, if `config.wait` polls, if a
    /// channel index is invalid, or if a channel is leased or still holds an
    /// unconsumed value.
    pub fn with_config(
        producer: B::Task,
        producer_channel: Channel,
        consumer: B::Task,
        consumer_channel: Channel,
        config: QueueConfig,
    ) -> anyhow::Result<Self> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_CAPACITY;

        if B::same_task(&producer, &consumer) {
            bail!("producer and consumer must be different tasks");
        }
        if config.wait == Wait::Poll {
            bail!("blocking push/pop cannot poll, use try_push/try_pop instead");
        }

        let capacity = N as u32;
        let producer_lease = B::lease(&producer, producer_channel, capacity, capacity)
            .with_context(|| format!("leasing producer channel {producer_channel} with {N} slots"))?;

        let consumer_lease = match B::lease(&consumer, consumer_channel, 0, capacity) {
            Ok(lease) => lease,
            Err(e) => {
                B::release(&producer, producer_channel, &producer_lease);
                return Err(anyhow::Error::new(e)
                    .context(format!("leasing consumer channel {consumer_channel}")));
            }
        };

        Ok(Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(None)),
            front: AtomicU8::new(0),
            back: AtomicU8::new(0),
            producer,
            producer_channel,
            producer_lease,
            consumer,
            consumer_channel,
            consumer_lease,
            config,
            _backend: PhantomData,
        })
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Appends `value`, blocking while the queue is full.
    pub fn push(&self, value: T) {
        self.expect_role(&self.producer, "push", "producer");
        loop {
            let available = B::notify_take(self.producer_channel, false, self.config.wait);
            if available > 0 {
                debug_assert!(available as usize <= N, "{available} free slots in a queue of {N}");
                break;
            }
            nwarn!(
                "push: no free slot within {:?}, waiting again",
                self.config.wait
            );
        }
        // Safety: we hold a free-slot permit.
        unsafe { self.write_back(value) };
    }

    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.push_within(value, Wait::Poll).map_err(PushError::into_inner)
    }

    pub fn push_timeout(&self, value: T, timeout: Duration) -> Result<(), PushError<T>> {
        self.push_within(value, Wait::For(timeout))
    }

    /// Removes the front item into `out`, blocking while the queue is empty.
    /// The previous value of `out` is dropped.
    pub fn pop(&self, out: &mut T) {
        *out = self.recv();
    }

    pub fn recv(&self) -> T {
        self.expect_role(&self.consumer, "pop", "consumer");
        loop {
            let ready = B::notify_take(self.consumer_channel, false, self.config.wait);
            if ready > 0 {
                debug_assert!(ready as usize <= N, "{ready} items in a queue of {N}");
                break;
            }
            nwarn!(
                "pop: no item within {:?}, waiting again",
                self.config.wait
            );
        }
        // Safety: we hold a ready-item permit.
        unsafe { self.read_front() }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.pop_within(Wait::Poll).ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        self.pop_within(Wait::For(timeout))
    }

    fn push_within(&self, value: T, wait: Wait) -> Result<(), PushError<T>> {
        self.expect_role(&self.producer, "push", "producer");
        match Self::take_permit(self.producer_channel, wait) {
            Ok(()) => {
                // Safety: we hold a free-slot permit.
                unsafe { self.write_back(value) };
                Ok(())
            }
            Err(PopError::Timeout) => Err(PushError::Timeout(value)),
            Err(PopError::Aborted) => Err(PushError::Aborted(value)),
        }
    }

    fn pop_within(&self, wait: Wait) -> Result<T, PopError> {
        self.expect_role(&self.consumer, "pop", "consumer");
        Self::take_permit(self.consumer_channel, wait)?;
        // Safety: we hold a ready-item permit.
        Ok(unsafe { self.read_front() })
    }

    /// A zero count means the wait ended without a permit. Ending early can
    /// only be an abort; ending at or after the deadline is a timeout.
    fn take_permit(channel: Channel, wait: Wait) -> Result<(), PopError> {
        let start = Instant::now();
        if B::notify_take(channel, false, wait) > 0 {
            return Ok(());
        }
        match wait {
            Wait::Poll => Err(PopError::Timeout),
            Wait::For(timeout) if start.elapsed() >= timeout => Err(PopError::Timeout),
            _ => Err(PopError::Aborted),
        }
    }

    /// # Safety
    /// The caller must hold a free-slot permit from the producer channel.
    unsafe fn write_back(&self, value: T) {
        let back = self.back.load(Ordering::Relaxed);
        let slot = &mut *self.slots[back as usize].get();
        debug_assert!(slot.is_none(), "slot {back} still holds an unread item");
        *slot = Some(value);
        self.back.store(Self::advance(back), Ordering::Relaxed);

        self.notify(&self.consumer, self.consumer_channel, &self.consumer_lease);
    }

    /// # Safety
    /// The caller must hold a ready-item permit from the consumer channel.
    unsafe fn read_front(&self) -> T {
        let front = self.front.load(Ordering::Relaxed);
        let value = (*self.slots[front as usize].get()).take();
        self.front.store(Self::advance(front), Ordering::Relaxed);

        self.notify(&self.producer, self.producer_channel, &self.producer_lease);
        match value {
            Some(value) => value,
            None => unreachable!("ready-item permit for empty slot {front}"),
        }
    }

    fn advance(index: IndexT) -> IndexT {
        if index as usize >= N - 1 {
            0
        } else {
            index + 1
        }
    }

    fn notify(&self, task: &B::Task, channel: Channel, lease: &B::Lease) {
        // Leased counts track the slots exactly, so a refusal is a bug.
        if let Err(e) = B::give_leased(task, channel, lease) {
            panic!("queue notification on channel {channel} refused: {e}");
        }
    }

    fn expect_role(&self, task: &B::Task, op: &str, role: &str) {
        assert!(
            B::is_current(task),
            "{op} must be called from the queue's {role} task"
        );
    }
}

impl<T, const N: usize, B: TaskNotify> Drop for Queue<T, N, B> {
    fn drop(&mut self) {
        B::release(&self.producer, self.producer_channel, &self.producer_lease);
        B::release(&self.consumer, self.consumer_channel, &self.consumer_lease);
    }
}

use crate::{sync::Wait, NotifyError};

use super::Channel;

/// What `notify_set` does to the target channel's count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    NoAction,
    SetBits,
    /// Add one, ignoring the value.
    Increment,
    SetValueWithOverwrite,
    /// Refused while the previous value is unconsumed.
    SetValueWithoutOverwrite,
}

/// Indexed task notifications, as offered by an RTOS kernel or an emulation
/// of one.
///
/// # Safety
///
/// Implementors must guarantee that
/// - `is_current` holds for a given task on at most one thread at a time,
/// - a successful give or set happens-before the `notify_take` that observes
///   its count, and
/// - while a channel is leased, nothing but `give_leased` with that lease
///   raises its count, and never past the leased limit.
pub unsafe trait TaskNotify {
    type Task: Clone + Send + Sync;
    type Lease: Send + Sync;

    /// Whether the calling thread runs as `task`.
    fn is_current(task: &Self::Task) -> bool;

    fn same_task(a: &Self::Task, b: &Self::Task) -> bool;

    /// Waits on the calling task's own `channel`, then decrements the count
    /// (or zeroes it with `clear_on_exit`). Returns the count before the
    /// update, or 0 if the wait expired or was aborted.
    fn notify_take(channel: Channel, clear_on_exit: bool, wait: Wait) -> u32;

    fn notify_give(task: &Self::Task, channel: Channel) -> Result<(), NotifyError>;

    fn notify_set(
        task: &Self::Task,
        channel: Channel,
        value: u32,
        action: NotifyAction,
    ) -> Result<(), NotifyError>;

    /// Breaks `task` out of its current (or next) blocking `notify_take`.
    fn abort_wait(task: &Self::Task);

    /// Sets an unconsumed-free `channel` to `initial` and reserves it, capped
    /// at `limit`, for the holder of the returned lease.
    fn lease(
        task: &Self::Task,
        channel: Channel,
        initial: u32,
        limit: u32,
    ) -> Result<Self::Lease, NotifyError>;

    fn give_leased(
        task: &Self::Task,
        channel: Channel,
        lease: &Self::Lease,
    ) -> Result<(), NotifyError>;

    /// Zeroes the channel and gives it back to everyone.
    fn release(task: &Self::Task, channel: Channel, lease: &Self::Lease);
}

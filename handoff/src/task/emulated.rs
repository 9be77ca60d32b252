use crate::{
    diag::{ntrace, nwarn},
    sync::{Lease, Wait},
    NotifyError,
};

use super::{current_task, is_current_task, Channel, NotifyAction, TaskHandle, TaskNotify};

/// Task notifications emulated with one counting semaphore per channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Emulated;

unsafe impl TaskNotify for Emulated {
    type Task = TaskHandle;
    type Lease = Lease;

    fn is_current(task: &TaskHandle) -> bool {
        is_current_task(task)
    }

    fn same_task(a: &TaskHandle, b: &TaskHandle) -> bool {
        a.ptr_eq(b)
    }

    fn notify_take(channel: Channel, clear_on_exit: bool, wait: Wait) -> u32 {
        notify_take(channel, clear_on_exit, wait)
    }

    fn notify_give(task: &TaskHandle, channel: Channel) -> Result<(), NotifyError> {
        notify_give(task, channel)
    }

    fn notify_set(
        task: &TaskHandle,
        channel: Channel,
        value: u32,
        action: NotifyAction,
    ) -> Result<(), NotifyError> {
        notify_set(task, channel, value, action)
    }

    fn abort_wait(task: &TaskHandle) {
        abort_wait(task)
    }

    fn lease(
        task: &TaskHandle,
        channel: Channel,
        initial: u32,
        limit: u32,
    ) -> Result<Lease, NotifyError> {
        let semaphore = task.channel(channel)?;
        ntrace!("lease({channel}, {initial}/{limit}): {}", semaphore.debug_str());
        semaphore.lease(initial, limit)
    }

    fn give_leased(
        task: &TaskHandle,
        channel: Channel,
        lease: &Lease,
    ) -> Result<(), NotifyError> {
        task.channel(channel)?.give_leased(lease, 1).map(|_| ())
    }

    fn release(task: &TaskHandle, channel: Channel, lease: &Lease) {
        match task.channel(channel) {
            Ok(semaphore) => semaphore.release(lease),
            Err(e) => nwarn!("release by '{}': {e}", task.name()),
        }
    }
}

/// Takes from the calling thread's own notification `channel`.
///
/// # Panics
///
/// If the calling thread was never bound with
/// [`set_current_task`](super::set_current_task).
pub fn notify_take(channel: Channel, clear_on_exit: bool, wait: Wait) -> u32 {
    let Some(task) = current_task() else {
        panic!("notify_take on channel {channel} from a thread without a task identity");
    };
    let semaphore = match task.channel(channel) {
        Ok(semaphore) => semaphore,
        Err(e) => {
            nwarn!("notify_take by '{}': {e}", task.name());
            return 0;
        }
    };
    ntrace!("notify_take({channel}): {}", semaphore.debug_str());
    semaphore.take_with(wait, clear_on_exit).unwrap_or(0)
}

pub fn notify_give(task: &TaskHandle, channel: Channel) -> Result<(), NotifyError> {
    let semaphore = task.channel(channel)?;
    ntrace!("notify_give({channel}): {}", semaphore.debug_str());
    semaphore.give(1).map(|_| ())
}

pub fn notify_set(
    task: &TaskHandle,
    channel: Channel,
    value: u32,
    action: NotifyAction,
) -> Result<(), NotifyError> {
    let semaphore = task.channel(channel)?;
    ntrace!(
        "notify_set({channel}, {value}, {action:?}): {}",
        semaphore.debug_str()
    );
    match action {
        NotifyAction::NoAction => Ok(()),
        NotifyAction::SetBits => semaphore.set_bits(value).map(|_| ()),
        NotifyAction::Increment => semaphore.give(1).map(|_| ()),
        NotifyAction::SetValueWithOverwrite => semaphore.set(value).map(|_| ()),
        NotifyAction::SetValueWithoutOverwrite => semaphore.set_if_clear(value),
    }
}

/// Aborts the blocking waits of every channel of `task`.
pub fn abort_wait(task: &TaskHandle) {
    ntrace!("abort_wait('{}')", task.name());
    for channel in &task.tcb.channels {
        channel.abort();
    }
}

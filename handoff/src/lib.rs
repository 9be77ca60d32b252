//! Fixed-capacity single-producer/single-consumer handoff between two tasks,
//! driven by RTOS-style task notifications.

use anyhow::bail;
use arrayvec::ArrayString;
use libc::c_int;

mod diag;
mod error;
pub mod primitives;
pub mod queue;
pub mod sync;
pub mod task;

pub use error::NotifyError;
pub use queue::{PopError, PushError, Queue, QueueConfig};
pub use sync::{Lease, Semaphore, Wait};
pub use task::{
    abort_wait, clear_current_task, current_task, notify_give, notify_set, notify_take,
    set_current_task, Channel, Emulated, NotifyAction, TaskBinding, TaskHandle, TaskNotify,
    NOTIFY_CHANNELS,
};

/// Width of the queue's slot indices.
pub type IndexT = u8;

/// Largest queue capacity representable by [`IndexT`].
pub const MAX_CAPACITY: usize = IndexT::MAX as usize;

/// Longest task or semaphore name kept, in bytes.
pub const NAME_LEN: usize = 16;

pub type Name = ArrayString<NAME_LEN>;

/// Copies `name`, cutting it at the last whole character that fits.
pub fn truncated_name(name: &str) -> Name {
    let mut out = Name::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

pub trait CheckOk<R> {
    fn r(self, op: &str) -> Result<R, anyhow::Error>;
}

impl CheckOk<()> for c_int {
    fn r(self, op: &str) -> Result<(), anyhow::Error> {
        if self != 0 {
            bail!("Operation {op} failed: Code {self}");
        }
        Ok(())
    }
}

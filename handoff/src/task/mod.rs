//! Task identities: a name plus [`NOTIFY_CHANNELS`] notification counters,
//! adopted by a thread with [`set_current_task`].

mod emulated;
mod notify;

use std::{
    cell::RefCell,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

pub use emulated::*;
pub use notify::*;

use crate::{primitives::Mutex, sync::Semaphore, truncated_name, Name, NotifyError, MAX_CAPACITY};

/// Notification channels per task.
pub const NOTIFY_CHANNELS: usize = 3;

/// Index of a notification channel within a task.
pub type Channel = usize;

struct TaskControlBlock {
    name: Name,
    channels: [Semaphore; NOTIFY_CHANNELS],
    owner: Mutex<Option<ThreadId>>,
}

/// Shared reference to a task control block.
#[derive(Clone)]
pub struct TaskHandle {
    tcb: Arc<TaskControlBlock>,
}

impl TaskHandle {
    /// Creates a task whose channel counts are capped at the largest queue
    /// capacity.
    pub fn new(name: &str) -> Self {
        Self::with_limit(name, MAX_CAPACITY as u32)
    }

    pub fn with_limit(name: &str, limit: u32) -> Self {
        let name = truncated_name(name);
        let channels = std::array::from_fn(|index| {
            Semaphore::with_limit(&format!("{name}#{index}"), 0, limit)
        });
        Self {
            tcb: Arc::new(TaskControlBlock {
                name,
                channels,
                owner: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.tcb.name
    }

    pub fn channel(&self, index: Channel) -> Result<&Semaphore, NotifyError> {
        self.tcb
            .channels
            .get(index)
            .ok_or(NotifyError::InvalidChannel(index))
    }

    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.tcb, &other.tcb)
    }

    /// Thread currently bound to this identity, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        *self.tcb.owner.lock()
    }

    fn claim(&self, thread: ThreadId) -> Result<(), NotifyError> {
        let mut owner = self.tcb.owner.lock();
        match *owner {
            Some(current) if current != thread => Err(NotifyError::AlreadyBound),
            _ => {
                *owner = Some(thread);
                Ok(())
            }
        }
    }

    fn release(&self, thread: ThreadId) {
        let mut owner = self.tcb.owner.lock();
        if *owner == Some(thread) {
            *owner = None;
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name())
            .field("channels", &self.tcb.channels)
            .finish()
    }
}

struct Binding {
    task: TaskHandle,
    thread: ThreadId,
    id: u64,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.task.release(self.thread);
    }
}

static NEXT_BINDING: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// Keeps the calling thread bound to a task. Dropping it ends the binding,
/// unless the thread has been rebound since.
#[derive(Debug)]
#[must_use = "the task binding ends when this guard is dropped"]
pub struct TaskBinding {
    // None for a guard returned while the task was already current.
    id: Option<u64>,
    _thread: PhantomData<*const ()>,
}

impl Drop for TaskBinding {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let ended = CURRENT.try_with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().is_some_and(|binding| binding.id == id) {
                current.take()
            } else {
                None
            }
        });
        drop(ended);
    }
}

/// Binds the calling thread to `task` until the returned guard is dropped,
/// the thread is rebound, or the thread exits.
///
/// An identity can be current on one live thread only.
pub fn set_current_task(task: &TaskHandle) -> Result<TaskBinding, NotifyError> {
    if is_current_task(task) {
        return Ok(TaskBinding {
            id: None,
            _thread: PhantomData,
        });
    }
    let thread = thread::current().id();
    task.claim(thread)?;
    let id = NEXT_BINDING.fetch_add(1, Ordering::Relaxed);
    let previous = CURRENT.with(|current| {
        current.borrow_mut().replace(Binding {
            task: task.clone(),
            thread,
            id,
        })
    });
    drop(previous);
    Ok(TaskBinding {
        id: Some(id),
        _thread: PhantomData,
    })
}

pub fn clear_current_task() {
    let previous = CURRENT.with(|current| current.borrow_mut().take());
    drop(previous);
}

pub fn current_task() -> Option<TaskHandle> {
    CURRENT.with(|current| current.borrow().as_ref().map(|binding| binding.task.clone()))
}

pub(crate) fn is_current_task(task: &TaskHandle) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|binding| binding.task.ptr_eq(task))
    })
}

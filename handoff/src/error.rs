use std::{error::Error, fmt};

/// Status of a refused notification or task binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// Channel index is outside `0..NOTIFY_CHANNELS`.
    InvalidChannel(usize),
    /// The update would push the count past the channel's limit. `count` is
    /// the value before the refused update.
    Overflow { count: u32, limit: u32 },
    /// Set-without-overwrite found a value the task has not consumed yet.
    Pending(u32),
    /// The task identity is already bound to another live thread.
    AlreadyBound,
    /// The channel is leased and only its holder may raise the count.
    Leased,
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::InvalidChannel(index) => write!(f, "invalid notification channel {index}"),
            NotifyError::Overflow { count, limit } => {
                write!(f, "notification count {count} cannot grow past limit {limit}")
            }
            NotifyError::Pending(count) => {
                write!(f, "notification value {count} has not been consumed")
            }
            NotifyError::AlreadyBound => write!(f, "task is already bound to another thread"),
            NotifyError::Leased => write!(f, "notification channel is leased to another user"),
        }
    }
}

impl Error for NotifyError {}

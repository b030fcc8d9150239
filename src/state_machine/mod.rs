mod item;
mod pending;
mod state;

pub use item::{
    AttemptFailure, AttemptOutcome, ItemKey, ItemState, ItemTransition, RetryConfig, WorkItem,
};
pub use pending::PendingSet;
pub use state::{AbortReason, RunEvent, RunMachine, RunState, StopReason};

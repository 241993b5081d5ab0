//! Domain model (IDs, tasks, virtual queues, states, errors).

pub mod errors;
pub mod ids;
pub mod rate_limit;
pub mod state;
pub mod task;
pub mod time;
pub mod vqueue;

pub use self::errors::{ErrorKind, Result, StoreError, VtqError};
pub use self::ids::{ParseIdError, TaskId};
pub use self::rate_limit::{RateLimitKind, RateLimitRule};
pub use self::state::{TaskStatus, Transition, TransitionOutcome};
pub use self::task::{NewTask, Task, TaskError, TaskRecord, TaskUpdate, DEFAULT_TASK_PRIORITY};
pub use self::vqueue::{VQueuePolicy, VirtualQueue};

//! Execution engine for Workhive work items.
//!
//! Work is submitted through a `WorkQueue` bound to one isolation strategy.
//! Every item runs on a worker thread inside an execution slot.
//!
//! # Isolation strategies
//!
//! - **`None`** - Runs in the host process against the host's static state.
//! - **`IsolatedContext`** - Runs in the host process against a context that
//!   owns its static state and private copies of its libraries. One context
//!   exists per distinct `ContextOptions`.
//! - **`IsolatedProcess`** - Runs in a pooled daemon process. Daemons are
//!   reused by work with an identical `ProcessOptions` and evicted when idle
//!   or under memory pressure.
//!
//! # Architecture
//!
//! ```text
//! Executor
//!     │
//!     ├── WorkQueue (None / IsolatedContext)
//!     │       │
//!     │       └── worker threads (rayon)
//!     │               └── InlineSlot / ContextSlot → WorkAction
//!     │
//!     ├── WorkQueue (IsolatedProcess)
//!     │       │
//!     │       └── dispatcher threads (rayon)
//!     │               └── DaemonPool::acquire → DaemonLease
//!     │                       ├── IPC: Execute command
//!     │                       │       └── workhive-worker runs the action
//!     │                       └── lease dropped → daemon back to idle
//!     │
//!     └── OutcomeTracker ← every outcome, drained by await_all
//! ```
//!
//! # Module Structure
//!
//! - `context` - Isolated contexts and completion callbacks
//! - `executor` - Executor, builder and work queues
//! - `slot` - Execution slots for each strategy
//! - `tracker` - In-flight bookkeeping behind `await_all`

mod context;
mod executor;
mod slot;
mod tracker;

pub use context::{CompletionCallback, ContextLibrary, IsolatedContext};
pub use executor::{Executor, ExecutorBuilder, WorkQueue};
pub use slot::{ContextSlot, ExecutionSlot, InlineSlot};

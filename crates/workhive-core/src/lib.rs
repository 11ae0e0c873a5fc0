//! Core engine for Workhive, a unit-of-work execution engine.
//!
//! This crate provides:
//! - Work queues with selectable isolation (none, isolated context, daemon process)
//! - An action registry and per-context static state
//! - A pool of reusable daemon processes with idle and pressure eviction
//! - The IPC protocol and serve loop daemons run

pub mod action;
pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod pressure;
pub mod work;

pub use action::{ActionContext, ActionError, ActionRegistry, ActionResult, StaticStore, WorkAction};
pub use config::{
    ContextOptions, DaemonPoolConfig, ExecutorConfig, IsolationStrategy, ProcessOptions,
    WorkQueueConfig,
};
pub use error::{AggregateFailure, Error, Result};
pub use execute::{CompletionCallback, Executor, ExecutorBuilder, IsolatedContext, WorkQueue};
pub use ipc::{DaemonPool, PoolStats, find_daemon_binary, serve_stdio};
pub use pressure::{AvailableMemoryThreshold, NoPressure, ResourcePressure};
pub use work::{
    Failure, FailureKind, ItemStatus, Outcome, Parameters, WorkItem, WorkItemHandle, WorkItemId,
};

//! Execution slots: where a single work item actually runs.

use std::sync::Arc;

use crate::action::{ActionContext, ActionRegistry, StaticStore, run_action};
use crate::config::{IsolationStrategy, ProcessOptions};
use crate::error::Result;
use crate::ipc::{DaemonLease, DaemonPool};
use crate::work::{Failure, Outcome, WorkItem};

use super::context::IsolatedContext;

/// An execution environment able to run work items one after another.
pub trait ExecutionSlot {
    fn strategy(&self) -> IsolationStrategy;

    /// Run one item to completion. Never panics on action failure.
    fn run(&mut self, item: &WorkItem) -> Outcome;
}

/// Runs actions on the calling thread against the host's static state.
pub struct InlineSlot {
    registry: ActionRegistry,
    statics: StaticStore,
}

impl InlineSlot {
    pub fn new(registry: ActionRegistry, statics: StaticStore) -> Self {
        Self { registry, statics }
    }
}

impl ExecutionSlot for InlineSlot {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::None
    }

    fn run(&mut self, item: &WorkItem) -> Outcome {
        let ctx = ActionContext::new(item.id(), IsolationStrategy::None, &self.statics);
        run_in_process(&self.registry, item, &ctx)
    }
}

/// Runs actions on the calling thread inside an isolated context.
pub struct ContextSlot {
    registry: ActionRegistry,
    context: Arc<IsolatedContext>,
}

impl ContextSlot {
    pub fn new(registry: ActionRegistry, context: Arc<IsolatedContext>) -> Self {
        Self { registry, context }
    }
}

impl ExecutionSlot for ContextSlot {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::IsolatedContext
    }

    fn run(&mut self, item: &WorkItem) -> Outcome {
        let context = &self.context;
        let ctx = ActionContext::new(
            item.id(),
            IsolationStrategy::IsolatedContext,
            context.statics(),
        )
        .with_context(&context.options().settings, context.libraries());
        run_in_process(&self.registry, item, &ctx)
    }
}

impl ExecutionSlot for DaemonLease {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::IsolatedProcess
    }

    fn run(&mut self, item: &WorkItem) -> Outcome {
        self.execute(item)
    }
}

fn run_in_process(registry: &ActionRegistry, item: &WorkItem, ctx: &ActionContext<'_>) -> Outcome {
    let action = match registry.create(item.action()) {
        Ok(action) => action,
        Err(e) => return Outcome::Failure(Failure::action(e.to_string())),
    };
    match run_action(action.as_ref(), item.params(), ctx) {
        Ok(value) => Outcome::Success(value),
        Err(failed) => Outcome::Failure(Failure::action(failed.into_message())),
    }
}

/// Where a work queue gets its slots from.
#[derive(Clone)]
pub(crate) enum SlotSource {
    Inline {
        registry: ActionRegistry,
        statics: StaticStore,
    },
    Context {
        registry: ActionRegistry,
        context: Arc<IsolatedContext>,
    },
    Daemon {
        pool: Arc<DaemonPool>,
        options: ProcessOptions,
    },
}

impl SlotSource {
    /// Whether items run against the host-side registry.
    pub(crate) fn registry(&self) -> Option<&ActionRegistry> {
        match self {
            SlotSource::Inline { registry, .. } | SlotSource::Context { registry, .. } => {
                Some(registry)
            }
            SlotSource::Daemon { .. } => None,
        }
    }

    /// Obtain a slot. For daemons this may block until one is free.
    pub(crate) fn open(&self) -> Result<Box<dyn ExecutionSlot>> {
        match self {
            SlotSource::Inline { registry, statics } => {
                Ok(Box::new(InlineSlot::new(registry.clone(), statics.clone())))
            }
            SlotSource::Context { registry, context } => {
                Ok(Box::new(ContextSlot::new(registry.clone(), context.clone())))
            }
            SlotSource::Daemon { pool, options } => Ok(Box::new(pool.acquire(options)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionResult;
    use crate::config::ContextOptions;
    use crate::work::{FailureKind, Parameters, WorkItemId};
    use serde_json::Value;

    fn strategy_name(_: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
        Ok(Value::from(ctx.strategy().to_string()))
    }

    fn profile(_: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
        Ok(ctx.setting("profile").map(Value::from).unwrap_or(Value::Null))
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry
            .register_fn("strategy", strategy_name)
            .register_fn("profile", profile);
        registry
    }

    fn item(action: &str) -> WorkItem {
        WorkItem::new(WorkItemId::new(1), action.to_string(), Parameters::new())
    }

    #[test]
    fn test_inline_slot_runs_with_host_strategy() {
        let mut slot = InlineSlot::new(registry(), StaticStore::new());
        assert_eq!(slot.strategy(), IsolationStrategy::None);
        assert_eq!(
            slot.run(&item("strategy")),
            Outcome::Success(Value::from("none"))
        );
    }

    #[test]
    fn test_context_slot_exposes_settings() {
        let temp = tempfile::TempDir::new().unwrap();
        let context = IsolatedContext::load(
            ContextOptions::new().with_setting("profile", "strict"),
            temp.path(),
        )
        .unwrap();
        let mut slot = ContextSlot::new(registry(), Arc::new(context));

        assert_eq!(
            slot.run(&item("strategy")),
            Outcome::Success(Value::from("isolated-context"))
        );
        assert_eq!(
            slot.run(&item("profile")),
            Outcome::Success(Value::from("strict"))
        );
    }

    #[test]
    fn test_unknown_action_is_action_failure() {
        let mut slot = InlineSlot::new(registry(), StaticStore::new());
        let outcome = slot.run(&item("missing"));
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::Action);
    }
}

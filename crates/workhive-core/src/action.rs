//! Actions, the registry that instantiates them, and the context they run in.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::config::IsolationStrategy;
use crate::error::{Error, Result};
use crate::execute::ContextLibrary;
use crate::work::{Parameters, WorkItemId};

/// Error type actions return. Anything implementing `std::error::Error`
/// converts into it, so actions can use `?` freely.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Result of running an action.
pub type ActionResult = std::result::Result<Value, ActionError>;

/// A runnable unit of user code.
pub trait WorkAction: Send {
    fn execute(&self, params: &Parameters, ctx: &ActionContext<'_>) -> ActionResult;
}

impl<F> WorkAction for F
where
    F: Fn(&Parameters, &ActionContext<'_>) -> ActionResult + Send,
{
    fn execute(&self, params: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
        self(params, ctx)
    }
}

type ActionFactory = Arc<dyn Fn() -> Box<dyn WorkAction> + Send + Sync>;

/// Maps action-type identifiers to factories.
///
/// Supplied by the host and passed explicitly to the executor and to the
/// daemon serve loop. Cloning shares the underlying table.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: Arc<FxHashMap<String, ActionFactory>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a fresh action instance per item.
    pub fn register<F, A>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: WorkAction + 'static,
    {
        let factory: ActionFactory = Arc::new(move || Box::new(factory()) as Box<dyn WorkAction>);
        Arc::make_mut(&mut self.factories).insert(name.into(), factory);
        self
    }

    /// Register a stateless function as an action.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, action: F) -> &mut Self
    where
        F: Fn(&Parameters, &ActionContext<'_>) -> ActionResult + Send + Sync + Clone + 'static,
    {
        self.register(name, move || action.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the action registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn WorkAction>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownAction(name.to_string()))
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// State shared by every action running in the same execution context.
///
/// This is the isolation boundary for "static" state: the host has one,
/// each isolated context has its own, and each daemon process has its own.
#[derive(Clone, Default)]
pub struct StaticStore {
    slots: Arc<Mutex<FxHashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl StaticStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `key`, initializing it on first use.
    ///
    /// Fails if the key already holds a value of another type.
    pub fn get_or_init<T, F>(&self, key: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| Error::Infrastructure(format!("static store lock poisoned: {}", e)))?;
        let slot = slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>)
            .clone();
        slot.downcast::<T>().map_err(|_| {
            Error::Configuration(format!("static '{}' holds a value of another type", key))
        })
    }

    /// Whether two handles point at the same store.
    pub fn same_store(&self, other: &StaticStore) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an action sees of its execution environment.
pub struct ActionContext<'a> {
    item_id: WorkItemId,
    strategy: IsolationStrategy,
    statics: &'a StaticStore,
    settings: Option<&'a BTreeMap<String, String>>,
    libraries: &'a [ContextLibrary],
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        item_id: WorkItemId,
        strategy: IsolationStrategy,
        statics: &'a StaticStore,
    ) -> Self {
        Self {
            item_id,
            strategy,
            statics,
            settings: None,
            libraries: &[],
        }
    }

    pub(crate) fn with_context(
        mut self,
        settings: &'a BTreeMap<String, String>,
        libraries: &'a [ContextLibrary],
    ) -> Self {
        self.settings = Some(settings);
        self.libraries = libraries;
        self
    }

    pub fn item_id(&self) -> WorkItemId {
        self.item_id
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    /// Static state of the surrounding execution context.
    pub fn statics(&self) -> &StaticStore {
        self.statics
    }

    /// A setting from the isolated context's options.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.and_then(|s| s.get(key)).map(String::as_str)
    }

    /// Libraries privately loaded into the isolated context.
    pub fn libraries(&self) -> &[ContextLibrary] {
        self.libraries
    }
}

/// Run an action instance, converting errors and panics into a message.
pub(crate) fn run_action(
    action: &dyn WorkAction,
    params: &Parameters,
    ctx: &ActionContext<'_>,
) -> std::result::Result<Value, ActionFailed> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| action.execute(params, ctx))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ActionFailed::Error(e.to_string())),
        Err(payload) => Err(ActionFailed::Panic(panic_message(payload.as_ref()))),
    }
}

/// How an action invocation went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActionFailed {
    Error(String),
    Panic(String),
}

impl ActionFailed {
    pub(crate) fn into_message(self) -> String {
        match self {
            ActionFailed::Error(message) => message,
            ActionFailed::Panic(message) => format!("action panicked: {}", message),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

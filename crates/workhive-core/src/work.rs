//! Work items, their parameters and outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Unique identifier for a work item within an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub(crate) u64);

impl WorkItemId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item_{}", self.0)
    }
}

/// Named parameter payload handed to an action.
///
/// Values are JSON so the payload can cross the daemon channel unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, serializing the value with serde.
    pub fn with(mut self, name: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Insert a property, serializing the value with serde.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Serialization(format!("parameter value: {}", e)))?;
        self.0.insert(name.into(), value);
        Ok(())
    }

    /// Raw JSON value of a property.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserialize a property into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| Error::Deserialization(format!("missing parameter '{}'", name)))?;
        T::deserialize(value)
            .map_err(|e| Error::Deserialization(format!("parameter '{}': {}", name, e)))
    }

    /// Deserialize an optional property into `T`.
    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub(crate) fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("parameters: {}", e)))
    }

    pub(crate) fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(format!("parameters: {}", e)))
    }
}

impl FromIterator<(String, Value)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One submitted unit of work. Immutable once built.
#[derive(Debug, Clone)]
pub struct WorkItem {
    id: WorkItemId,
    action: String,
    params: Arc<Parameters>,
}

impl WorkItem {
    pub(crate) fn new(id: WorkItemId, action: String, params: Parameters) -> Self {
        Self {
            id,
            action,
            params: Arc::new(params),
        }
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }
}

/// Which class of problem produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The action itself returned an error or panicked.
    Action,
    /// The slot or daemon could not start, or died while running the item.
    Infrastructure,
}

/// Cause attached to a failed outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn action(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Action,
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Infrastructure,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Action => write!(f, "action failed: {}", self.message),
            FailureKind::Infrastructure => write!(f, "infrastructure failure: {}", self.message),
        }
    }
}

/// Terminal result of a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }
}

/// Lifecycle of a submitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
}

impl From<u8> for ItemStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            _ => Self::Completed,
        }
    }
}

/// Caller-side handle to a submitted work item.
#[derive(Debug, Clone)]
pub struct WorkItemHandle {
    id: WorkItemId,
    status: Arc<AtomicU8>,
}

impl WorkItemHandle {
    pub(crate) fn new(id: WorkItemId) -> Self {
        Self {
            id,
            status: Arc::new(AtomicU8::new(ItemStatus::Pending as u8)),
        }
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn status(&self) -> ItemStatus {
        ItemStatus::from(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ItemStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_typed_access() {
        let params = Parameters::new()
            .with("input", "abc")
            .unwrap()
            .with("count", 3u32)
            .unwrap();

        assert_eq!(params.get::<String>("input").unwrap(), "abc");
        assert_eq!(params.get::<u32>("count").unwrap(), 3);
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_parameters_missing_and_wrong_type() {
        let params = Parameters::new().with("count", "three").unwrap();

        assert!(matches!(
            params.get::<u32>("missing"),
            Err(Error::Deserialization(_))
        ));
        assert!(matches!(
            params.get::<u32>("count"),
            Err(Error::Deserialization(_))
        ));
        assert_eq!(params.get_opt::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn test_parameters_json_bytes() {
        let params = Parameters::new().with("flag", true).unwrap();
        let bytes = params.to_json_bytes().unwrap();
        assert_eq!(bytes, br#"{"flag":true}"#);
        assert_eq!(Parameters::from_json_bytes(&bytes).unwrap(), params);
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = Outcome::Success(Value::from(7));
        let failed = Outcome::Failure(Failure::infrastructure("daemon died"));

        assert_eq!(ok.value(), Some(&Value::from(7)));
        assert!(ok.failure().is_none());
        assert_eq!(failed.failure().unwrap().kind, FailureKind::Infrastructure);
        assert_eq!(
            failed.failure().unwrap().to_string(),
            "infrastructure failure: daemon died"
        );
    }

    #[test]
    fn test_handle_status_transitions() {
        let handle = WorkItemHandle::new(WorkItemId::new(1));
        let observer = handle.clone();
        assert_eq!(observer.status(), ItemStatus::Pending);

        handle.set_status(ItemStatus::Running);
        assert_eq!(observer.status(), ItemStatus::Running);

        handle.set_status(ItemStatus::Completed);
        assert_eq!(observer.status(), ItemStatus::Completed);
    }
}

//! Change events flowing from sources into the manager, and from the manager
//! out to listeners.

use std::fmt;

use crate::value::{ConfigValue, SourceInfo, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single change to the key space.
///
/// Delete events still carry a `Value` so the manager knows which source (and
/// which `Ref` group) the deletion comes from. A delete with an empty key and
/// a `Ref` removes every key of that group.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventType,
    pub key: String,
    pub value: Value,
}

impl Event {
    pub fn create(key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: EventType::Create,
            key: key.into(),
            value,
        }
    }

    pub fn update(key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: EventType::Update,
            key: key.into(),
            value,
        }
    }

    /// Delete one key contributed by `source` (optionally within a group).
    pub fn delete(key: impl Into<String>, source: SourceInfo, reference: Option<String>) -> Self {
        let mut value = Value::new(ConfigValue::String(String::new()), source);
        if let Some(reference) = reference {
            value = value.with_ref(reference);
        }
        Self {
            kind: EventType::Delete,
            key: key.into(),
            value,
        }
    }

    /// Delete every key contributed by `source` under `reference`.
    pub fn delete_ref(source: SourceInfo, reference: impl Into<String>) -> Self {
        Self {
            kind: EventType::Delete,
            key: String::new(),
            value: Value::new(ConfigValue::String(String::new()), source).with_ref(reference),
        }
    }

    pub fn source_name(&self) -> &str {
        self.value.source().name()
    }

    pub fn priority(&self) -> i32 {
        self.value.priority()
    }

    pub fn reference(&self) -> Option<&str> {
        self.value.reference()
    }

    pub fn is_group_delete(&self) -> bool {
        self.kind == EventType::Delete && self.key.is_empty() && self.reference().is_some()
    }
}

//! Task payload file format.
//!
//! A payload is a JSON object with an optional top-level `task` description
//! and an ordered `subtasks` list:
//!
//! ```json
//! {
//!   "task": "Write a small CLI",
//!   "subtasks": [
//!     { "id": 1, "description": "Design the argument surface" },
//!     { "id": 2, "description": "Implement the parser" }
//!   ]
//! }
//! ```
//!
//! The file is read leniently: only invalid JSON or a non-object root rejects
//! it. A non-string `task` is rendered as text, and a subtask entry that is not
//! an object becomes [`SubtaskEntry::Malformed`] like one missing a field.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default, deserialize_with = "lenient_text")]
    pub task: Option<String>,
    #[serde(default, deserialize_with = "lenient_subtasks")]
    pub subtasks: Vec<RawSubtask>,
}

/// A subtask as it appears in the file, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSubtask {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub description: Option<Value>,
}

/// A subtask with both required fields present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtaskEntry {
    Valid(Subtask),
    /// Missing identifier or description. `id` is whatever could be read.
    Malformed { id: Option<String> },
}

impl TaskFile {
    pub fn from_json(input: &str) -> DomainResult<Self> {
        serde_json::from_str(input)
            .map_err(|e| DomainError::validation(format!("invalid task file: {e}")))
    }

    /// Top-level description, if present and non-blank.
    pub fn main_task(&self) -> Option<&str> {
        self.task
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn entries(&self) -> impl Iterator<Item = SubtaskEntry> + '_ {
        self.subtasks.iter().map(RawSubtask::validate)
    }
}

impl RawSubtask {
    /// Anything but an object reads as an entry with neither field.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => Self {
                id: fields.remove("id"),
                description: fields.remove("description"),
            },
            _ => Self::default(),
        }
    }

    pub fn validate(&self) -> SubtaskEntry {
        let id = self.id.as_ref().and_then(scalar_text);
        let description = self.description.as_ref().and_then(scalar_text);

        match (id, description) {
            (Some(id), Some(description)) => SubtaskEntry::Valid(Subtask { id, description }),
            (id, _) => SubtaskEntry::Malformed { id },
        }
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_subtasks<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RawSubtask>, D::Error> {
    let entries = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(entries.into_iter().map(RawSubtask::from_value).collect())
}

/// Non-blank string or number rendered as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_without_main_task() {
        let file = TaskFile::from_json(
            r#"{"subtasks": [{"id": 1, "description": "one"}, {"id": "b", "description": "two"}]}"#,
        )
        .unwrap();

        assert_eq!(file.main_task(), None);
        let entries: Vec<_> = file.entries().collect();
        assert_eq!(
            entries,
            vec![
                SubtaskEntry::Valid(Subtask {
                    id: "1".into(),
                    description: "one".into()
                }),
                SubtaskEntry::Valid(Subtask {
                    id: "b".into(),
                    description: "two".into()
                }),
            ]
        );
    }

    #[test]
    fn missing_fields_mark_entry_malformed() {
        let file = TaskFile::from_json(
            r#"{"task": "  main  ", "subtasks": [{"id": 3}, {"description": "no id"}, {"id": "", "description": "x"}]}"#,
        )
        .unwrap();

        assert_eq!(file.main_task(), Some("main"));
        let entries: Vec<_> = file.entries().collect();
        assert_eq!(
            entries,
            vec![
                SubtaskEntry::Malformed { id: Some("3".into()) },
                SubtaskEntry::Malformed { id: None },
                SubtaskEntry::Malformed { id: None },
            ]
        );
    }

    #[test]
    fn non_object_entries_are_malformed_not_fatal() {
        let file = TaskFile::from_json(
            r#"{"subtasks": ["oops", null, 4, {"id": 1, "description": "real"}]}"#,
        )
        .unwrap();

        let entries: Vec<_> = file.entries().collect();
        assert_eq!(entries.len(), 4);
        assert!(entries[..3]
            .iter()
            .all(|e| *e == SubtaskEntry::Malformed { id: None }));
        assert_eq!(
            entries[3],
            SubtaskEntry::Valid(Subtask {
                id: "1".into(),
                description: "real".into()
            })
        );
    }

    #[test]
    fn non_string_main_task_is_rendered_as_text() {
        let file =
            TaskFile::from_json(r#"{"task": {"goal": "ship"}, "subtasks": null}"#).unwrap();
        assert_eq!(file.main_task(), Some(r#"{"goal":"ship"}"#));
        assert_eq!(file.entries().count(), 0);

        let file = TaskFile::from_json(r#"{"task": null}"#).unwrap();
        assert_eq!(file.main_task(), None);
    }

    #[test]
    fn empty_object_has_no_subtasks() {
        let file = TaskFile::from_json("{}").unwrap();
        assert_eq!(file.entries().count(), 0);
    }

    #[test]
    fn non_json_is_a_validation_error() {
        let err = TaskFile::from_json("subtasks: []").unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}

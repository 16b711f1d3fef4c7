use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::PublishError;
use crate::model::{Binary, ObjectKey};
use crate::target::model::Scope;

/// Work chained after a successful upsert, run in registration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    UploadBinary { field: String, binary: Binary },
    FocalPoint { field: String, point: (f32, f32) },
}

/// One rendered upsert of an item language into the target system.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTask {
    pub key: ObjectKey,
    pub site_id: i64,
    pub scope: Scope,
    pub uuid: String,
    /// `None` for project root items.
    pub parent_uuid: Option<String>,
    /// Source parent, used to write a missing parent first.
    pub parent: Option<ObjectKey>,
    pub language: String,
    pub schema: String,
    pub fields: Map<String, Value>,
    pub roles: Option<Vec<String>>,
    /// Fields referencing items that are still pending in this run.
    pub postponed_fields: Option<Map<String, Value>>,
    pub continuations: Vec<Continuation>,
    pub postponable: bool,
    pub dirt_id: Option<i64>,
    /// Languages the item must have remotely after this write. Others are deleted.
    pub expected_languages: Option<Vec<String>>,
}

impl WriteTask {
    pub fn has_postponed_fields(&self) -> bool {
        self.postponed_fields.as_ref().is_some_and(|f| !f.is_empty())
    }
}

/// A write task together with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub task: Arc<WriteTask>,
    pub retries: u32,
    /// Set once the task was deferred to the replay phase.
    pub postponed: bool,
    /// Only these fields are written on replay when not empty.
    pub delta: Map<String, Value>,
    pub reason: Option<String>,
}

impl Attempt {
    pub fn new(task: WriteTask) -> Self {
        Self {
            task: Arc::new(task),
            retries: 0,
            postponed: false,
            delta: Map::new(),
            reason: None,
        }
    }

    /// Replay of the fields that were left out of the first write. The
    /// replay has not been postponed and may still be postponed once.
    pub fn deferred_fields(task: Arc<WriteTask>) -> Self {
        let delta = task.postponed_fields.clone().unwrap_or_default();
        Self {
            task,
            retries: 0,
            postponed: false,
            delta,
            reason: Some("references pending at render time".into()),
        }
    }

    /// Whether this attempt only writes the deferred fields of an earlier write.
    pub fn is_field_replay(&self) -> bool {
        !self.delta.is_empty()
    }

    pub fn retried(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }

    /// Defers the attempt to the replay phase. A second postponement is fatal.
    pub fn postpone(self, reason: String) -> Result<Self, PublishError> {
        if self.postponed || !self.task.postponable {
            return Err(PublishError::PostponedTwice {
                key: self.task.key,
                uuid: self.task.uuid.clone(),
                reason,
            });
        }
        Ok(Self {
            postponed: true,
            reason: Some(reason),
            ..self
        })
    }

    /// Field data sent with the upsert of this attempt.
    pub fn request_fields(&self) -> Map<String, Value> {
        if !self.delta.is_empty() {
            return self.delta.clone();
        }
        let mut fields = self.task.fields.clone();
        if self.postponed {
            if let Some(extra) = &self.task.postponed_fields {
                fields.extend(extra.clone());
            }
        }
        fields
    }

    /// Whether the fields left out of this write still need a replay.
    pub fn needs_field_replay(&self) -> bool {
        !self.postponed && !self.is_field_replay() && self.task.has_postponed_fields()
    }
}

/// Message on the write queue.
#[derive(Debug)]
pub enum WriteMessage {
    Work(Attempt),
    Stop,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::ObjectType;
    use serde_json::json;

    pub(crate) fn task(id: i64) -> WriteTask {
        let mut fields = Map::new();
        fields.insert("name".into(), json!("n"));
        WriteTask {
            key: ObjectKey::new(ObjectType::Folder, id),
            site_id: 1,
            scope: Scope::new("site", None),
            uuid: format!("{:032x}", id),
            parent_uuid: Some("root".into()),
            parent: None,
            language: "en".into(),
            schema: "cms_folder".into(),
            fields,
            roles: None,
            postponed_fields: None,
            continuations: Vec::new(),
            postponable: true,
            dirt_id: None,
            expected_languages: None,
        }
    }

    #[test]
    fn second_postponement_is_fatal() {
        let attempt = Attempt::new(task(1));
        let postponed = attempt.postpone("conflict".into()).unwrap();
        assert!(postponed.postponed);
        let err = postponed.postpone("again".into()).unwrap_err();
        assert!(matches!(err, PublishError::PostponedTwice { .. }));
    }

    #[test]
    fn replay_includes_postponed_fields() {
        let mut t = task(1);
        let mut later = Map::new();
        later.insert("start".into(), json!({ "uuid": "x" }));
        t.postponed_fields = Some(later);
        let attempt = Attempt::new(t);
        assert!(attempt.needs_field_replay());
        assert!(!attempt.request_fields().contains_key("start"));

        let deferred = Attempt::deferred_fields(attempt.task.clone());
        assert_eq!(deferred.request_fields().len(), 1);
        assert!(!deferred.needs_field_replay());

        let replayed = attempt.postpone("parent".into()).unwrap();
        let fields = replayed.request_fields();
        assert!(fields.contains_key("start") && fields.contains_key("name"));
    }

    #[test]
    fn field_replay_can_still_be_postponed_once() {
        let mut t = task(1);
        let mut later = Map::new();
        later.insert("start".into(), json!({ "uuid": "x" }));
        t.postponed_fields = Some(later);
        let deferred = Attempt::deferred_fields(Arc::new(t));
        assert!(deferred.is_field_replay());
        assert!(!deferred.postponed);

        let postponed = deferred.postpone("conflict".into()).unwrap();
        assert!(postponed.is_field_replay());
        assert_eq!(postponed.request_fields().len(), 1);
        assert!(!postponed.needs_field_replay());
        let err = postponed.postpone("again".into()).unwrap_err();
        assert!(matches!(err, PublishError::PostponedTwice { .. }));
    }
}

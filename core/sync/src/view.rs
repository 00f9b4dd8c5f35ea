//! Optimistic local view of records touched by queued writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use recsync_common::{LocalId, MutationMethod, RecordRef};

use crate::engine::Delivery;
use crate::queue::QueuedMutation;

/// How far a record's displayed state has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    /// Last loaded from the server.
    Authoritative,
    /// Reflects writes that are still queued. Not saved on the server yet.
    Queued,
    /// Every write was acknowledged; not yet refreshed from the server.
    Confirmed,
}

/// Display state of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    /// Current data; `None` once a delete has been applied.
    pub data: Option<Value>,
    pub state: ViewState,
    /// Queued writes reflected in `data`, oldest first.
    pub pending: Vec<LocalId>,
}

impl ViewEntry {
    /// Whether the record is shown as deleted.
    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }
}

/// In-memory display state, updated in two phases: `apply` when a write is
/// queued and `settle` once the server acknowledges it.
#[derive(Debug, Default)]
pub struct LocalView {
    records: HashMap<RecordRef, ViewEntry>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect a queued write. Writes with no nameable target are ignored.
    pub fn apply(&mut self, mutation: &QueuedMutation) {
        let Some(record) = mutation.target() else {
            return;
        };

        let entry = self.records.entry(record).or_insert_with(|| ViewEntry {
            data: None,
            state: ViewState::Queued,
            pending: Vec::new(),
        });

        entry.data = match mutation.method {
            MutationMethod::Create => Some(mutation.payload.clone()),
            MutationMethod::Update => Some(merge(entry.data.take(), &mutation.payload)),
            MutationMethod::Delete => None,
        };
        entry.state = ViewState::Queued;
        entry.pending.push(mutation.local_id.clone());
    }

    /// Clear acknowledged writes.
    ///
    /// A record with no pending writes left becomes `Confirmed`, taking the
    /// server's returned copy when the last delivery carried one. Deleted
    /// records are dropped.
    pub fn settle(&mut self, delivered: &[Delivery]) {
        if delivered.is_empty() {
            return;
        }
        let by_id: HashMap<&LocalId, &Delivery> =
            delivered.iter().map(|d| (&d.local_id, d)).collect();

        self.records.retain(|_, entry| {
            let mut last_record = None;
            entry.pending.retain(|id| match by_id.get(id) {
                Some(delivery) => {
                    last_record = delivery.record.clone();
                    false
                }
                None => true,
            });

            if entry.pending.is_empty() && entry.state == ViewState::Queued {
                if entry.data.is_none() {
                    return false;
                }
                if let Some(record) = last_record {
                    entry.data = Some(record);
                }
                entry.state = ViewState::Confirmed;
            }
            true
        });
    }

    /// Forget writes that left the queue without being delivered.
    pub fn forget(&mut self, removed: &HashSet<LocalId>) {
        self.records.retain(|_, entry| {
            let before = entry.pending.len();
            entry.pending.retain(|id| !removed.contains(id));
            // Without its queued writes the optimistic data means nothing.
            !(before > 0 && entry.pending.is_empty() && entry.state == ViewState::Queued)
        });
    }

    /// Store a fresh copy from the server.
    ///
    /// Ignored while writes to the record are queued, so the user keeps
    /// seeing their own edits.
    pub fn replace_authoritative(&mut self, record: RecordRef, data: Value) {
        let entry = self.records.entry(record).or_insert_with(|| ViewEntry {
            data: None,
            state: ViewState::Authoritative,
            pending: Vec::new(),
        });
        if entry.pending.is_empty() {
            entry.data = Some(data);
            entry.state = ViewState::Authoritative;
        }
    }

    pub fn get(&self, record: &RecordRef) -> Option<&ViewEntry> {
        self.records.get(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn merge(base: Option<Value>, changes: &Value) -> Value {
    match (base, changes) {
        (Some(Value::Object(mut fields)), Value::Object(updates)) => {
            for (key, value) in updates {
                fields.insert(key.clone(), value.clone());
            }
            Value::Object(fields)
        }
        _ => changes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsync_common::Endpoint;
    use serde_json::json;

    fn mutation(endpoint: &str, method: MutationMethod, payload: Value) -> QueuedMutation {
        QueuedMutation::new(Endpoint::parse(endpoint).unwrap(), method, payload)
    }

    fn delivered(m: &QueuedMutation, record: Option<Value>) -> Delivery {
        Delivery {
            local_id: m.local_id.clone(),
            endpoint: m.endpoint.clone(),
            record,
        }
    }

    fn record(collection: &str, id: &str) -> RecordRef {
        RecordRef::new(collection, id).unwrap()
    }

    #[test]
    fn test_apply_marks_queued() {
        let mut view = LocalView::new();
        view.replace_authoritative(record("candidates", "1"), json!({"name": "Ada", "city": "Leeds"}));

        let m = mutation("candidates/1", MutationMethod::Update, json!({"city": "York"}));
        view.apply(&m);

        let entry = view.get(&record("candidates", "1")).unwrap();
        assert_eq!(entry.state, ViewState::Queued);
        assert_eq!(entry.data, Some(json!({"name": "Ada", "city": "York"})));
        assert_eq!(entry.pending, vec![m.local_id.clone()]);
    }

    #[test]
    fn test_settle_takes_server_copy() {
        let mut view = LocalView::new();
        let m = mutation("jobs", MutationMethod::Create, json!({"id": 3, "title": "Welder"}));
        view.apply(&m);

        view.settle(&[delivered(&m, Some(json!({"id": 3, "title": "Welder", "status": "open"})))]);

        let entry = view.get(&record("jobs", "3")).unwrap();
        assert_eq!(entry.state, ViewState::Confirmed);
        assert!(entry.pending.is_empty());
        assert_eq!(entry.data.as_ref().unwrap()["status"], "open");
    }

    #[test]
    fn test_partial_settle_stays_queued() {
        let mut view = LocalView::new();
        let first = mutation("jobs/3", MutationMethod::Update, json!({"title": "A"}));
        let second = mutation("jobs/3", MutationMethod::Update, json!({"title": "B"}));
        view.apply(&first);
        view.apply(&second);

        view.settle(&[delivered(&first, Some(json!({"title": "A"})))]);

        let entry = view.get(&record("jobs", "3")).unwrap();
        assert_eq!(entry.state, ViewState::Queued);
        assert_eq!(entry.data, Some(json!({"title": "B"})));
    }

    #[test]
    fn test_settled_delete_is_dropped() {
        let mut view = LocalView::new();
        let m = mutation("visas/2", MutationMethod::Delete, Value::Null);
        view.apply(&m);
        assert!(view.get(&record("visas", "2")).unwrap().is_deleted());

        view.settle(&[delivered(&m, None)]);
        assert!(view.get(&record("visas", "2")).is_none());
    }

    #[test]
    fn test_authoritative_refresh_waits_for_queue() {
        let mut view = LocalView::new();
        let m = mutation("employers/1", MutationMethod::Update, json!({"name": "Local"}));
        view.apply(&m);

        view.replace_authoritative(record("employers", "1"), json!({"name": "Server"}));
        assert_eq!(
            view.get(&record("employers", "1")).unwrap().data,
            Some(json!({"name": "Local"}))
        );

        view.settle(&[delivered(&m, None)]);
        view.replace_authoritative(record("employers", "1"), json!({"name": "Server"}));
        let entry = view.get(&record("employers", "1")).unwrap();
        assert_eq!(entry.state, ViewState::Authoritative);
        assert_eq!(entry.data, Some(json!({"name": "Server"})));
    }

    #[test]
    fn test_forget_discarded_write() {
        let mut view = LocalView::new();
        let m = mutation("candidates/4", MutationMethod::Update, json!({"name": "Typo"}));
        view.apply(&m);

        view.forget(&HashSet::from([m.local_id.clone()]));
        assert!(view.is_empty());
    }

    #[test]
    fn test_anonymous_create_ignored() {
        let mut view = LocalView::new();
        view.apply(&mutation("candidates", MutationMethod::Create, json!({"name": "Ada"})));
        assert!(view.is_empty());
    }
}

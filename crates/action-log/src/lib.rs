//! Append-only log of user-level actions.
//!
//! Actions get a monotonic ID and a wall-clock timestamp at record time. The
//! correlator later writes the IDs of the requests each action caused back onto the
//! record.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use netlens_core_types::{ActionId, ActionKind, ActionRecord, RequestId};

/// Caller-supplied shape of an action about to be recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionDraft {
    pub kind: ActionKind,
    pub selector: String,
    pub description: String,
    pub page_url: String,
}

impl ActionDraft {
    pub fn new(kind: ActionKind, selector: impl Into<String>) -> Self {
        Self {
            kind,
            selector: selector.into(),
            description: String::new(),
            page_url: String::new(),
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn on_page(mut self, url: impl Into<String>) -> Self {
        self.page_url = url.into();
        self
    }
}

struct LogState {
    actions: Vec<ActionRecord>,
    next_counter: u64,
}

/// The append-only action log.
pub struct ActionLog {
    state: RwLock<LogState>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                actions: Vec::new(),
                next_counter: 0,
            }),
        }
    }

    /// Record an action stamped with the current wall clock.
    pub fn record(&self, draft: ActionDraft) -> ActionRecord {
        let now_ms = Utc::now().timestamp_millis() as f64;
        self.record_with_timestamp(draft, now_ms)
    }

    /// Record an action with a caller-supplied wall-clock timestamp, for sources
    /// that carry their own clock.
    pub fn record_with_timestamp(&self, draft: ActionDraft, timestamp_ms: f64) -> ActionRecord {
        let mut state = self.state.write();
        let id = ActionId::from_counter(state.next_counter);
        state.next_counter += 1;
        let record = ActionRecord {
            id,
            kind: draft.kind,
            selector: draft.selector,
            description: draft.description,
            timestamp_ms,
            page_url: draft.page_url,
            resulting_request_ids: Vec::new(),
        };
        debug!(
            target: "action-log",
            id = %record.id,
            kind = ?record.kind,
            "action recorded"
        );
        state.actions.push(record.clone());
        record
    }

    pub fn all(&self) -> Vec<ActionRecord> {
        self.state.read().actions.clone()
    }

    pub fn get(&self, id: &ActionId) -> Option<ActionRecord> {
        self.state
            .read()
            .actions
            .iter()
            .find(|action| &action.id == id)
            .cloned()
    }

    /// Actions whose timestamp lies in `[start_ms, end_ms]`.
    pub fn in_window(&self, start_ms: f64, end_ms: f64) -> Vec<ActionRecord> {
        self.state
            .read()
            .actions
            .iter()
            .filter(|action| action.timestamp_ms >= start_ms && action.timestamp_ms <= end_ms)
            .cloned()
            .collect()
    }

    /// Back-write the requests the correlator attributed to an action.
    pub fn set_resulting_requests(&self, id: &ActionId, requests: Vec<RequestId>) {
        let mut state = self.state.write();
        if let Some(action) = state.actions.iter_mut().find(|action| &action.id == id) {
            action.resulting_request_ids = requests;
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().actions.is_empty()
    }

    /// Drop all recorded actions. The ID counter keeps counting.
    pub fn clear(&self) {
        self.state.write().actions.clear();
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

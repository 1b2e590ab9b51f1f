//! Bounded two-set capture store.
//!
//! Pending records live in an in-flight map until finalization moves them into the
//! finalized ring. One lock owns both sets plus the index counter and the clock
//! offset, so a finalization is never partially visible to queries.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

use netlens_core_types::{Attribution, RequestId, RequestRecord};

struct StoreState {
    pending: HashMap<RequestId, RequestRecord>,
    finalized: VecDeque<RequestRecord>,
    next_index: u64,
    /// `wall_time - monotonic_time`, in seconds, fixed by the first request-sent
    /// event of the session.
    time_offset_s: Option<f64>,
    /// Bumped by `clear()`; commits carry the generation they started under.
    generation: u64,
}

pub struct CaptureStore {
    max_requests: usize,
    state: RwLock<StoreState>,
}

impl CaptureStore {
    pub fn new(max_requests: usize) -> Self {
        Self {
            max_requests,
            state: RwLock::new(StoreState {
                pending: HashMap::new(),
                finalized: VecDeque::new(),
                next_index: 0,
                time_offset_s: None,
                generation: 0,
            }),
        }
    }

    /// Learn the wall/monotonic offset from a request-sent event. First one wins.
    pub fn observe_wall_clock(&self, wall_s: f64, monotonic_s: f64) {
        let mut state = self.state.write();
        if state.time_offset_s.is_none() {
            state.time_offset_s = Some(wall_s - monotonic_s);
        }
    }

    /// Project a monotonic timestamp to wall-clock milliseconds. `None` until the
    /// offset is known; raw monotonic values are never projected blind.
    pub fn project_ms(&self, monotonic_s: f64) -> Option<f64> {
        self.state
            .read()
            .time_offset_s
            .map(|offset| (monotonic_s + offset) * 1000.0)
    }

    pub fn allocate_index(&self) -> u64 {
        let mut state = self.state.write();
        let index = state.next_index;
        state.next_index += 1;
        index
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn insert_pending(&self, record: RequestRecord) {
        self.state.write().pending.insert(record.id.clone(), record);
    }

    /// Mutate an in-flight record in place; `None` when the ID is not in flight.
    pub fn with_pending_mut<R>(
        &self,
        id: &RequestId,
        apply: impl FnOnce(&mut RequestRecord) -> R,
    ) -> Option<R> {
        self.state.write().pending.get_mut(id).map(apply)
    }

    pub fn take_pending(&self, id: &RequestId) -> Option<RequestRecord> {
        self.state.write().pending.remove(id)
    }

    /// Set `preflight_request_id` on the target record, wherever it currently
    /// lives. Returns whether a target was found.
    pub fn link_preflight(&self, target: &RequestId, preflight: &RequestId) -> bool {
        let mut state = self.state.write();
        if let Some(record) = state.pending.get_mut(target) {
            record.preflight_request_id = Some(preflight.clone());
            return true;
        }
        if let Some(record) = state
            .finalized
            .iter_mut()
            .find(|record| &record.id == target)
        {
            record.preflight_request_id = Some(preflight.clone());
            return true;
        }
        false
    }

    /// Find a record (in either set) that declared itself a preflight for
    /// `actual`, for back-filling when the actual request arrives second.
    pub fn find_preflight_for(&self, actual: &RequestId) -> Option<RequestId> {
        let state = self.state.read();
        state
            .pending
            .values()
            .chain(state.finalized.iter())
            .find(|record| record.preflight_for.as_ref() == Some(actual))
            .map(|record| record.id.clone())
    }

    /// Move a finalized record into the store, evicting the earliest-inserted
    /// record at capacity. Refused when `generation` is stale, so a body fetch
    /// resolving after `clear()` cannot reintroduce its record.
    pub fn commit(&self, record: RequestRecord, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            debug!(
                target: "event-ingest",
                id = %record.id,
                "commit dropped: store cleared during finalization"
            );
            return false;
        }
        if state.finalized.len() >= self.max_requests {
            if let Some(evicted) = state.finalized.pop_front() {
                debug!(
                    target: "event-ingest",
                    id = %evicted.id,
                    "store at capacity, evicting earliest record"
                );
            }
        }
        state.finalized.push_back(record);
        true
    }

    pub fn apply_attribution(&self, id: &RequestId, attribution: Attribution) -> bool {
        let mut state = self.state.write();
        match state
            .finalized
            .iter_mut()
            .find(|record| &record.id == id)
        {
            Some(record) if record.attribution.is_none() => {
                record.attribution = Some(attribution);
                true
            }
            _ => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn len(&self) -> usize {
        self.state.read().finalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().finalized.is_empty()
    }

    pub fn get(&self, id: &RequestId) -> Option<RequestRecord> {
        self.state
            .read()
            .finalized
            .iter()
            .find(|record| &record.id == id)
            .cloned()
    }

    /// Snapshot of the finalized set in insertion order.
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.state.read().finalized.iter().cloned().collect()
    }

    /// Discard both sets and invalidate outstanding finalizations. The clock
    /// offset and index counter are session properties and survive.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.pending.clear();
        state.finalized.clear();
        state.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlens_core_types::{RequestInitiator, RequestTiming, ResourceKind};
    use std::collections::HashMap;

    fn record(id: &str, index: u64) -> RequestRecord {
        RequestRecord {
            id: RequestId::from(id),
            index,
            url: format!("https://example.com/{id}"),
            method: "GET".into(),
            request_headers: HashMap::new(),
            request_body: None,
            status: 200,
            status_text: "OK".into(),
            response_headers: HashMap::new(),
            mime_type: "application/json".into(),
            response_body: None,
            response_size: 0,
            resource_kind: ResourceKind::Fetch,
            initiator: RequestInitiator::other(),
            timing: RequestTiming {
                start_ms: 1.0,
                ..RequestTiming::default()
            },
            redirect_chain: Vec::new(),
            preflight_for: None,
            preflight_request_id: None,
            attribution: None,
        }
    }

    #[test]
    fn eviction_is_fifo_by_insertion() {
        let store = CaptureStore::new(3);
        for n in 0..5 {
            let generation = store.generation();
            store.commit(record(&format!("r{n}"), n), generation);
        }
        assert_eq!(store.len(), 3);
        assert!(store.get(&RequestId::from("r0")).is_none());
        assert!(store.get(&RequestId::from("r1")).is_none());
        assert!(store.get(&RequestId::from("r2")).is_some());
        assert!(store.get(&RequestId::from("r4")).is_some());
    }

    #[test]
    fn stale_generation_commit_is_refused() {
        let store = CaptureStore::new(10);
        let generation = store.generation();
        store.clear();
        assert!(!store.commit(record("r1", 0), generation));
        assert!(store.is_empty());
    }

    #[test]
    fn attribution_is_set_once() {
        let store = CaptureStore::new(10);
        let generation = store.generation();
        store.commit(record("r1", 0), generation);

        let first = Attribution {
            action_id: netlens_core_types::ActionId::from_counter(0),
            confidence: 0.9,
            method: netlens_core_types::AttributionMethod::StackTrace,
        };
        let second = Attribution {
            action_id: netlens_core_types::ActionId::from_counter(1),
            confidence: 0.4,
            method: netlens_core_types::AttributionMethod::TimingOnly,
        };
        assert!(store.apply_attribution(&RequestId::from("r1"), first));
        assert!(!store.apply_attribution(&RequestId::from("r1"), second));

        let stored = store.get(&RequestId::from("r1")).unwrap();
        assert_eq!(stored.attribution.unwrap().confidence, 0.9);
    }

    #[test]
    fn offset_survives_clear() {
        let store = CaptureStore::new(10);
        store.observe_wall_clock(1000.0, 10.0);
        store.clear();
        assert_eq!(store.project_ms(11.0), Some(1001.0 * 1000.0));
    }

    #[test]
    fn projection_requires_offset() {
        let store = CaptureStore::new(10);
        assert!(store.project_ms(5.0).is_none());
        store.observe_wall_clock(100.0, 1.0);
        // first observation wins
        store.observe_wall_clock(500.0, 1.0);
        assert_eq!(store.project_ms(2.0), Some(101.0 * 1000.0));
    }
}

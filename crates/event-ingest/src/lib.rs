//! Network lifecycle ingestion for the netlens observer.
//!
//! Consumes the four lifecycle events the debug source emits, reassembles
//! per-request records (redirect coalescing, preflight pairing, two-clock
//! reconciliation), and maintains the bounded finalized store the query layer and
//! correlator read.

pub mod body;
pub mod events;
pub mod query;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use netlens_core_types::{
    config::ObserverConfig, Attribution, CaptureSignal, InitiatorKind, ObserverStats, RequestId,
    RequestRecord, RequestTiming, ResourceKind,
};

use crate::body::{body_is_fetchable, render_body, BodyFetcher};
use crate::events::{
    LoadingFailed, LoadingFinished, NetworkEvent, RequestWillBeSent, ResponseReceived,
};
use crate::query::{apply_filter, RequestFilter, UrlMatcher};
use crate::store::CaptureStore;

/// Interval at which the quiescence wait samples the in-flight count.
const QUIET_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The event ingester. All mutation funnels through here; queries read snapshots.
pub struct NetworkEventIngester {
    store: CaptureStore,
    exclude: Vec<UrlMatcher>,
    max_body_chars: usize,
    fetcher: Option<Arc<dyn BodyFetcher>>,
    signals: broadcast::Sender<CaptureSignal>,
}

impl NetworkEventIngester {
    pub fn new(config: &ObserverConfig) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            store: CaptureStore::new(config.max_requests),
            exclude: config
                .exclude_patterns
                .iter()
                .map(|pattern| UrlMatcher::new(pattern))
                .collect(),
            max_body_chars: config.max_response_body_size,
            fetcher: None,
            signals,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn BodyFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureSignal> {
        self.signals.subscribe()
    }

    /// Parse and ingest a raw debug-protocol event. Returns whether the method
    /// was one of the four lifecycle events and carried a usable payload.
    pub async fn ingest_cdp(&self, method: &str, params: &serde_json::Value) -> bool {
        match NetworkEvent::from_cdp(method, params) {
            Some(event) => {
                self.ingest(event).await;
                true
            }
            None => {
                debug!(target: "event-ingest", method, "debug event ignored");
                false
            }
        }
    }

    /// Apply one lifecycle event. The only suspension point is the body fetch on
    /// finalization; events for the same request ID must arrive in source order.
    pub async fn ingest(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent(ev) => self.on_request_will_be_sent(ev),
            NetworkEvent::ResponseReceived(ev) => self.on_response_received(ev),
            NetworkEvent::LoadingFinished(ev) => self.on_loading_finished(ev).await,
            NetworkEvent::LoadingFailed(ev) => self.on_loading_failed(ev),
        }
    }

    fn is_excluded(&self, url: &str) -> bool {
        self.exclude.iter().any(|matcher| matcher.matches(url))
    }

    fn on_request_will_be_sent(&self, ev: RequestWillBeSent) {
        if self.is_excluded(&ev.url) {
            debug!(target: "event-ingest", url = %ev.url, "request excluded by pattern");
            return;
        }

        self.store.observe_wall_clock(ev.wall_time, ev.monotonic_time);
        let start_ms = ev.wall_time * 1000.0;

        // Redirect coalescing: same ID already in flight plus a redirect response
        // means another hop of the same logical request, not a new record.
        if let Some(redirect) = &ev.redirect_response {
            let coalesced = self.store.with_pending_mut(&ev.request_id, |record| {
                record.redirect_chain.push(netlens_core_types::RedirectHop {
                    url: record.url.clone(),
                    status: redirect.status,
                    headers: redirect.headers.clone(),
                });
                record.url = ev.url.clone();
                record.method = ev.method.clone();
                record.request_headers = ev.headers.clone();
                record.request_body = ev.post_data.clone();
                record.timing.start_ms = start_ms;
            });
            if coalesced.is_some() {
                return;
            }
        }

        let mut record = RequestRecord {
            id: ev.request_id.clone(),
            index: self.store.allocate_index(),
            url: ev.url,
            method: ev.method,
            request_headers: ev.headers,
            request_body: ev.post_data,
            status: 0,
            status_text: String::new(),
            response_headers: HashMap::new(),
            mime_type: String::new(),
            response_body: None,
            response_size: 0,
            resource_kind: ev
                .resource_type
                .as_deref()
                .map(ResourceKind::from_protocol)
                .unwrap_or_default(),
            initiator: ev.initiator,
            timing: RequestTiming {
                start_ms,
                ..RequestTiming::default()
            },
            redirect_chain: Vec::new(),
            preflight_for: None,
            preflight_request_id: None,
            attribution: None,
        };

        // Preflight pairing works in both arrival orders: a preflight names its
        // target directly, an actual request back-fills from any record that
        // already declared itself the preflight.
        if record.initiator.kind == InitiatorKind::Preflight {
            if let Some(target) = record.initiator.target_request.clone() {
                record.preflight_for = Some(target.clone());
                if !self.store.link_preflight(&target, &record.id) {
                    debug!(
                        target: "event-ingest",
                        preflight = %record.id,
                        %target,
                        "preflight target not observed yet"
                    );
                }
            }
        } else if let Some(preflight) = self.store.find_preflight_for(&record.id) {
            record.preflight_request_id = Some(preflight);
        }

        let signal = CaptureSignal::RequestStarted {
            id: record.id.clone(),
            url: record.url.clone(),
            method: record.method.clone(),
        };
        self.store.insert_pending(record);
        let _ = self.signals.send(signal);
    }

    fn on_response_received(&self, ev: ResponseReceived) {
        let response_ms = self.store.project_ms(ev.monotonic_time);
        let applied = self.store.with_pending_mut(&ev.request_id, |record| {
            record.status = ev.status;
            record.status_text = ev.status_text.clone();
            record.response_headers = ev.headers.clone();
            record.mime_type = ev.mime_type.clone();
            record.timing.response_ms = response_ms;
            if let Some(kind) = ev.resource_type.as_deref() {
                record.resource_kind = ResourceKind::from_protocol(kind);
            }
        });
        if applied.is_none() {
            debug!(target: "event-ingest", id = %ev.request_id, "response for unknown request");
        }
    }

    async fn on_loading_finished(&self, ev: LoadingFinished) {
        let Some(mut record) = self.store.take_pending(&ev.request_id) else {
            debug!(target: "event-ingest", id = %ev.request_id, "finish for unknown request");
            return;
        };
        // The generation is pinned before the fetch await; a clear() racing the
        // fetch invalidates this commit rather than resurrecting the record.
        let generation = self.store.generation();

        if let Some(end_ms) = self.store.project_ms(ev.monotonic_time) {
            record.timing.end_ms = Some(end_ms);
            record.timing.duration_ms = Some(end_ms - record.timing.start_ms);
        }
        record.response_size = ev.encoded_data_length;

        if let Some(fetcher) = &self.fetcher {
            if body_is_fetchable(&record.mime_type) {
                match fetcher.fetch_body(&record.id).await {
                    Ok(Some(fetched)) => {
                        record.response_body = Some(render_body(fetched, self.max_body_chars));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target: "event-ingest",
                            id = %record.id,
                            error = %err,
                            "body fetch failed, finalizing without body"
                        );
                    }
                }
            }
        }

        let signal = CaptureSignal::RequestFinalized {
            id: record.id.clone(),
            url: record.url.clone(),
            status: record.status,
        };
        if self.store.commit(record, generation) {
            let _ = self.signals.send(signal);
        }
    }

    fn on_loading_failed(&self, ev: LoadingFailed) {
        let Some(mut record) = self.store.take_pending(&ev.request_id) else {
            debug!(target: "event-ingest", id = %ev.request_id, "failure for unknown request");
            return;
        };
        let generation = self.store.generation();

        if record.status == 0 {
            record.status_text = ev.error_text.clone();
        }
        if let Some(end_ms) = self.store.project_ms(ev.monotonic_time) {
            record.timing.end_ms = Some(end_ms);
            record.timing.duration_ms = Some(end_ms - record.timing.start_ms);
        }

        let signal = CaptureSignal::RequestFailed {
            id: record.id.clone(),
            url: record.url.clone(),
            error: ev.error_text,
        };
        if self.store.commit(record, generation) {
            let _ = self.signals.send(signal);
        }
    }

    pub fn get_requests(&self, filter: &RequestFilter) -> Vec<RequestRecord> {
        apply_filter(filter, self.store.snapshot())
    }

    pub fn get_request(&self, id: &RequestId) -> Option<RequestRecord> {
        self.store.get(id)
    }

    pub fn get_requests_since(&self, timestamp_ms: f64) -> Vec<RequestRecord> {
        apply_filter(
            &RequestFilter::default().since(timestamp_ms),
            self.store.snapshot(),
        )
    }

    /// Snapshot of every finalized record in insertion order.
    pub fn all_requests(&self) -> Vec<RequestRecord> {
        self.store.snapshot()
    }

    pub fn apply_attribution(&self, id: &RequestId, attribution: Attribution) -> bool {
        self.store.apply_attribution(id, attribution)
    }

    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    pub fn request_count(&self) -> usize {
        self.store.len()
    }

    pub fn stats(&self, total_actions: usize) -> ObserverStats {
        ObserverStats {
            total_requests: self.store.len(),
            pending_requests: self.store.pending_count(),
            total_actions,
        }
    }

    /// Drop pending and finalized records and invalidate in-flight body fetches.
    pub fn clear(&self) {
        self.store.clear();
        let _ = self.signals.send(CaptureSignal::Cleared);
    }

    /// Resolve once the in-flight count has been zero continuously for
    /// `quiet_period`, sampling every 25 ms. Returns `false` on timeout.
    pub async fn wait_for_network_quiet(&self, quiet_period: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiet_since: Option<Instant> = None;

        loop {
            if self.store.pending_count() == 0 {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= quiet_period {
                    return true;
                }
            } else {
                quiet_since = None;
            }

            if Instant::now() >= deadline {
                return false;
            }
            sleep(QUIET_POLL_INTERVAL).await;
        }
    }
}

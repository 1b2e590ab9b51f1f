//! netlens: a causal view of browser network behavior.
//!
//! The observer consumes the lifecycle events a remote-debugging source emits,
//! reconstructs per-request records, and attributes each request to the recorded
//! user action that triggered it. [`NetworkObserver`] is the session object the
//! outer tool layer talks to; everything underneath lives in the member crates.
//!
//! ```no_run
//! use netlens::{ActionDraft, ActionKind, NetworkObserver, ObserverConfig};
//!
//! # async fn demo(params: serde_json::Value) -> Result<(), netlens::ObserverError> {
//! let observer = NetworkObserver::new(ObserverConfig::default())?;
//! observer.record_action(ActionDraft::new(ActionKind::Click, "button#load"));
//! observer.ingest_cdp("Network.requestWillBeSent", &params).await;
//! let results = observer.correlate_all();
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

pub use netlens_action_log::{ActionDraft, ActionLog};
pub use netlens_core_types::{
    config::ObserverConfig, ActionId, ActionKind, ActionRecord, Attribution, AttributionMethod,
    CallFrame, CaptureSignal, ChainKind, CorrelationResult, InitiatorKind, ObserverError,
    ObserverStats, RedirectHop, RequestChain, RequestId, RequestInitiator, RequestRecord,
    RequestTiming, ResourceKind, StackTrace,
};
pub use netlens_correlator::{chains::detect_chains, Correlator};
pub use netlens_event_ingest::{
    body::{BodyFetcher, FetchedBody},
    events::{
        LoadingFailed, LoadingFinished, NetworkEvent, RedirectResponse, RequestWillBeSent,
        ResponseReceived,
    },
    query::RequestFilter,
    NetworkEventIngester,
};

/// One observation session: an ingester, an action log, and a correlator wired
/// together. Constructed, used, and discarded; nothing persists.
pub struct NetworkObserver {
    config: ObserverConfig,
    ingester: Arc<NetworkEventIngester>,
    actions: Arc<ActionLog>,
    correlator: Correlator,
}

impl NetworkObserver {
    pub fn new(config: ObserverConfig) -> Result<Self, ObserverError> {
        config.validate()?;
        Ok(Self {
            ingester: Arc::new(NetworkEventIngester::new(&config)),
            actions: Arc::new(ActionLog::new()),
            correlator: Correlator::new(&config),
            config,
        })
    }

    /// Build an observer whose finalizations retrieve response bodies through
    /// the supplied callback.
    pub fn with_fetcher(
        config: ObserverConfig,
        fetcher: Arc<dyn BodyFetcher>,
    ) -> Result<Self, ObserverError> {
        config.validate()?;
        Ok(Self {
            ingester: Arc::new(NetworkEventIngester::new(&config).with_fetcher(fetcher)),
            actions: Arc::new(ActionLog::new()),
            correlator: Correlator::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Subscribe to capture signals (request started/finalized/failed, clear).
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureSignal> {
        self.ingester.subscribe()
    }

    pub async fn ingest(&self, event: NetworkEvent) {
        self.ingester.ingest(event).await;
    }

    /// Feed a raw debug-protocol event. Non-lifecycle methods and malformed
    /// payloads are dropped; returns whether the event was ingested.
    pub async fn ingest_cdp(&self, method: &str, params: &serde_json::Value) -> bool {
        self.ingester.ingest_cdp(method, params).await
    }

    pub fn record_action(&self, draft: ActionDraft) -> ActionRecord {
        self.actions.record(draft)
    }

    /// Record an action with an explicit wall-clock timestamp, for drivers that
    /// stamp gestures at dispatch time.
    pub fn record_action_at(&self, draft: ActionDraft, timestamp_ms: f64) -> ActionRecord {
        self.actions.record_with_timestamp(draft, timestamp_ms)
    }

    pub fn get_actions(&self) -> Vec<ActionRecord> {
        self.actions.all()
    }

    pub fn get_action(&self, id: &ActionId) -> Option<ActionRecord> {
        self.actions.get(id)
    }

    pub fn get_requests(&self, filter: &RequestFilter) -> Vec<RequestRecord> {
        self.ingester.get_requests(filter)
    }

    pub fn get_request(&self, id: &RequestId) -> Option<RequestRecord> {
        self.ingester.get_request(id)
    }

    pub fn get_requests_since(&self, timestamp_ms: f64) -> Vec<RequestRecord> {
        self.ingester.get_requests_since(timestamp_ms)
    }

    /// Correlate every finalized request against one action. Attributions are
    /// written back onto the store (first writer wins) and the action's
    /// resulting-request list is updated.
    pub fn correlate_action(&self, action_id: &ActionId) -> Option<CorrelationResult> {
        let requests = self.ingester.all_requests();
        let actions = self.actions.all();
        let result = self
            .correlator
            .correlate_action(action_id, &requests, &actions)?;
        self.apply_result(&result);
        Some(result)
    }

    /// Correlate all finalized requests that are still unattributed, grouped by
    /// winning action, sorted by action timestamp.
    pub fn correlate_all(&self) -> Vec<CorrelationResult> {
        let requests = self.ingester.all_requests();
        let actions = self.actions.all();
        let results = self.correlator.correlate_all(&requests, &actions);
        for result in &results {
            self.apply_result(result);
        }
        results
    }

    fn apply_result(&self, result: &CorrelationResult) {
        for member in &result.requests {
            if let Some(attribution) = &member.attribution {
                self.ingester
                    .apply_attribution(&member.id, attribution.clone());
            }
        }
        self.actions.set_resulting_requests(
            &result.action.id,
            result.action.resulting_request_ids.clone(),
        );
        debug!(
            target: "netlens",
            action = %result.action.id,
            requests = result.requests.len(),
            chains = result.chains.len(),
            "correlation applied"
        );
    }

    pub fn stats(&self) -> ObserverStats {
        self.ingester.stats(self.actions.len())
    }

    /// Drop captured requests and recorded actions. Outstanding body fetches
    /// are invalidated; calling this twice is the same as calling it once.
    pub fn clear(&self) {
        self.ingester.clear();
        self.actions.clear();
    }

    /// Resolve once the in-flight count has stayed at zero for the configured
    /// quiet period. Returns `false` when `timeout` elapses first.
    pub async fn wait_for_network_quiet(&self, timeout: Duration) -> bool {
        let quiet = Duration::from_millis(self.config.network_quiet_period_ms);
        self.ingester.wait_for_network_quiet(quiet, timeout).await
    }
}

//! End-to-end scenarios through the session facade: events in, correlated
//! causal view out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use netlens::{
    ActionDraft, ActionKind, AttributionMethod, BodyFetcher, CaptureSignal, ChainKind,
    FetchedBody, InitiatorKind, LoadingFinished, NetworkEvent, NetworkObserver, ObserverConfig,
    RequestFilter, RequestId, RequestInitiator, RequestWillBeSent, ResponseReceived, ResourceKind,
    StackTrace,
};

const WALL_BASE: f64 = 1_700_000_000.0;
const MONO_BASE: f64 = 5_000.0;

fn wall_ms(offset_s: f64) -> f64 {
    (WALL_BASE + offset_s) * 1000.0
}

fn sent(id: &str, url: &str, method: &str, at_s: f64) -> RequestWillBeSent {
    RequestWillBeSent {
        request_id: RequestId::from(id),
        url: url.to_string(),
        method: method.to_string(),
        headers: HashMap::new(),
        post_data: None,
        initiator: RequestInitiator::other(),
        wall_time: WALL_BASE + at_s,
        monotonic_time: MONO_BASE + at_s,
        redirect_response: None,
        resource_type: Some("Fetch".to_string()),
    }
}

fn response(id: &str, status: u16, at_s: f64) -> ResponseReceived {
    ResponseReceived {
        request_id: RequestId::from(id),
        url: String::new(),
        status,
        status_text: "OK".to_string(),
        headers: HashMap::new(),
        mime_type: "application/json".to_string(),
        monotonic_time: MONO_BASE + at_s,
        resource_type: None,
    }
}

fn finished(id: &str, at_s: f64) -> LoadingFinished {
    LoadingFinished {
        request_id: RequestId::from(id),
        monotonic_time: MONO_BASE + at_s,
        encoded_data_length: 512,
    }
}

fn click_stack() -> StackTrace {
    StackTrace {
        description: None,
        frames: Vec::new(),
        parent: Some(Box::new(StackTrace {
            description: Some("click".into()),
            frames: Vec::new(),
            parent: None,
        })),
    }
}

async fn complete(observer: &NetworkObserver, event: RequestWillBeSent, status: u16, at_s: f64) {
    let id = event.request_id.as_str().to_string();
    observer.ingest(NetworkEvent::RequestWillBeSent(event)).await;
    observer
        .ingest(NetworkEvent::ResponseReceived(response(&id, status, at_s)))
        .await;
    observer
        .ingest(NetworkEvent::LoadingFinished(finished(&id, at_s + 0.01)))
        .await;
}

#[tokio::test]
async fn click_flow_is_attributed_end_to_end() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    let action = observer.record_action_at(
        ActionDraft::new(ActionKind::Click, "button#signin").described(r#"button "Sign In""#),
        wall_ms(1.0),
    );

    let mut login = sent("LOGIN", "https://app.example.com/auth/login", "POST", 1.1);
    login.initiator = RequestInitiator {
        kind: InitiatorKind::Script,
        stack: Some(click_stack()),
        url: None,
        line: None,
        column: None,
        target_request: None,
    };
    complete(&observer, login, 200, 1.2).await;

    let results = observer.correlate_all();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.action.id, action.id);
    assert_eq!(result.requests.len(), 1);

    let attribution = result.requests[0].attribution.as_ref().unwrap();
    assert!(attribution.confidence >= 0.85);
    assert_eq!(attribution.method, AttributionMethod::StackTrace);

    // The attribution landed on the store and the action record.
    let stored = observer.get_request(&RequestId::from("LOGIN")).unwrap();
    assert!(stored.attribution.is_some());
    let stored_action = observer.get_action(&action.id).unwrap();
    assert_eq!(stored_action.resulting_request_ids, vec![RequestId::from("LOGIN")]);
}

#[tokio::test]
async fn out_of_order_preflight_inherits_attribution() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    let action = observer.record_action_at(
        ActionDraft::new(ActionKind::Click, "button#save"),
        wall_ms(1.0),
    );

    let mut actual = sent("ACTUAL", "https://api.example.com/items", "POST", 1.05);
    actual.initiator.stack = Some(click_stack());
    complete(&observer, actual, 201, 1.1).await;
    observer.correlate_all();

    // The preflight shows up late, after its target was already correlated.
    let mut preflight = sent("PF", "https://api.example.com/items", "OPTIONS", 1.3);
    preflight.initiator = RequestInitiator {
        kind: InitiatorKind::Preflight,
        stack: None,
        url: None,
        line: None,
        column: None,
        target_request: Some(RequestId::from("ACTUAL")),
    };
    complete(&observer, preflight, 204, 1.35).await;

    let actual = observer.get_request(&RequestId::from("ACTUAL")).unwrap();
    let preflight = observer.get_request(&RequestId::from("PF")).unwrap();
    assert_eq!(actual.preflight_request_id, Some(RequestId::from("PF")));
    assert_eq!(preflight.preflight_for, Some(RequestId::from("ACTUAL")));

    let results = observer.correlate_all();
    assert_eq!(results.len(), 1);
    let attribution = observer
        .get_request(&RequestId::from("PF"))
        .unwrap()
        .attribution
        .unwrap();
    assert_eq!(attribution.action_id, action.id);
    assert_eq!(attribution.confidence, 0.85);
    assert_eq!(attribution.method, AttributionMethod::Chain);
}

struct TokenFetcher {
    bodies: HashMap<String, String>,
}

#[async_trait]
impl BodyFetcher for TokenFetcher {
    async fn fetch_body(&self, id: &RequestId) -> anyhow::Result<Option<FetchedBody>> {
        Ok(self.bodies.get(id.as_str()).map(|body| FetchedBody {
            body: body.clone(),
            base64_encoded: false,
        }))
    }
}

#[tokio::test]
async fn auth_flow_chain_shows_up_in_correlation_result() {
    let token = "eyJhbGciOiJIUzI1NiJ9.e30.signature";
    let fetcher = TokenFetcher {
        bodies: HashMap::from([(
            "LOGIN".to_string(),
            format!(r#"{{"access_token":"{token}"}}"#),
        )]),
    };
    let observer =
        NetworkObserver::with_fetcher(ObserverConfig::default(), Arc::new(fetcher)).unwrap();

    let action = observer.record_action_at(
        ActionDraft::new(ActionKind::Click, "button#signin").described("sign in"),
        wall_ms(1.0),
    );

    let mut login = sent("LOGIN", "https://api.example.com/auth/login", "POST", 1.05);
    login.initiator.stack = Some(click_stack());
    complete(&observer, login, 200, 1.1).await;

    for (id, at_s) in [("ME", 1.3), ("ORDERS", 1.5)] {
        let mut authed = sent(id, &format!("https://api.example.com/{id}"), "GET", at_s);
        authed.initiator.stack = Some(click_stack());
        authed
            .headers
            .insert("Authorization".into(), format!("Bearer {token}"));
        complete(&observer, authed, 200, at_s + 0.05).await;
    }

    let result = observer.correlate_action(&action.id).unwrap();
    assert_eq!(result.requests.len(), 3);

    let auth_chains: Vec<_> = result
        .chains
        .iter()
        .filter(|chain| chain.kind == ChainKind::AuthFlow)
        .collect();
    assert_eq!(auth_chains.len(), 1);
    assert_eq!(
        auth_chains[0].request_ids,
        vec![
            RequestId::from("LOGIN"),
            RequestId::from("ME"),
            RequestId::from("ORDERS"),
        ]
    );
}

#[tokio::test]
async fn stats_track_both_stores() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    observer.record_action(ActionDraft::new(ActionKind::Navigate, ""));
    complete(
        &observer,
        sent("R1", "https://app.example.com/", "GET", 0.0),
        200,
        0.1,
    )
    .await;
    observer
        .ingest(NetworkEvent::RequestWillBeSent(sent(
            "R2",
            "https://app.example.com/api",
            "GET",
            0.2,
        )))
        .await;

    let stats = observer.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.pending_requests, 1);
    assert_eq!(stats.total_actions, 1);

    observer.clear();
    observer.clear();
    let stats = observer.stats();
    assert_eq!(stats.total_requests, 0);
    assert_eq!(stats.pending_requests, 0);
    assert_eq!(stats.total_actions, 0);
}

#[tokio::test]
async fn repeated_correlation_leaves_attributions_stable() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    observer.record_action_at(ActionDraft::new(ActionKind::Click, "#load"), wall_ms(1.0));
    let mut load = sent("R1", "https://app.example.com/api/data", "GET", 1.05);
    load.initiator.stack = Some(click_stack());
    complete(&observer, load, 200, 1.1).await;

    let first = observer.correlate_all();
    assert_eq!(first.len(), 1);
    let settled = observer
        .get_request(&RequestId::from("R1"))
        .unwrap()
        .attribution
        .unwrap();

    // Everything is attributed now; a second pass finds no new work and the
    // stored attribution is unchanged.
    let second = observer.correlate_all();
    assert!(second.is_empty());
    let still = observer
        .get_request(&RequestId::from("R1"))
        .unwrap()
        .attribution
        .unwrap();
    assert_eq!(still.action_id, settled.action_id);
    assert_eq!(still.confidence, settled.confidence);
}

#[tokio::test]
async fn query_surface_filters_and_slices() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    complete(
        &observer,
        sent("R1", "https://app.example.com/styles.css", "GET", 0.0),
        200,
        0.05,
    )
    .await;
    let mut doc = sent("R2", "https://app.example.com/page", "GET", 1.0);
    doc.resource_type = Some("Document".to_string());
    complete(&observer, doc, 200, 1.05).await;
    complete(
        &observer,
        sent("R3", "https://api.example.com/users", "POST", 2.0),
        500,
        2.05,
    )
    .await;

    let documents =
        observer.get_requests(&RequestFilter::default().kind(ResourceKind::Document));
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, RequestId::from("R2"));

    let errors = observer.get_requests(&RequestFilter::default().status_range(500, 599));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, RequestId::from("R3"));

    let recent = observer.get_requests_since(wall_ms(1.5));
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, RequestId::from("R3"));
}

#[tokio::test]
async fn capture_signals_reach_subscribers() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();
    let mut signals = observer.subscribe();

    complete(
        &observer,
        sent("R1", "https://app.example.com/api", "GET", 0.0),
        200,
        0.05,
    )
    .await;

    match signals.recv().await.unwrap() {
        CaptureSignal::RequestStarted { id, method, .. } => {
            assert_eq!(id, RequestId::from("R1"));
            assert_eq!(method, "GET");
        }
        other => panic!("unexpected signal {other:?}"),
    }
    match signals.recv().await.unwrap() {
        CaptureSignal::RequestFinalized { status, .. } => assert_eq!(status, 200),
        other => panic!("unexpected signal {other:?}"),
    }
}

#[tokio::test]
async fn quiescence_resolves_after_last_finalization() {
    let config = ObserverConfig {
        network_quiet_period_ms: 50,
        ..ObserverConfig::default()
    };
    let observer = NetworkObserver::new(config).unwrap();

    observer
        .ingest(NetworkEvent::RequestWillBeSent(sent(
            "R1",
            "https://app.example.com/api",
            "GET",
            0.0,
        )))
        .await;
    assert!(!observer.wait_for_network_quiet(Duration::from_millis(120)).await);

    observer
        .ingest(NetworkEvent::ResponseReceived(response("R1", 200, 0.05)))
        .await;
    observer
        .ingest(NetworkEvent::LoadingFinished(finished("R1", 0.06)))
        .await;
    assert!(observer.wait_for_network_quiet(Duration::from_millis(500)).await);
}

#[tokio::test]
async fn raw_cdp_events_flow_through() {
    let observer = NetworkObserver::new(ObserverConfig::default()).unwrap();

    let sent_params = serde_json::json!({
        "requestId": "R1",
        "request": {
            "url": "https://api.example.com/users",
            "method": "GET",
            "headers": { "Accept": "application/json" }
        },
        "wallTime": WALL_BASE,
        "timestamp": MONO_BASE,
        "type": "Fetch"
    });
    assert!(observer.ingest_cdp("Network.requestWillBeSent", &sent_params).await);

    let response_params = serde_json::json!({
        "requestId": "R1",
        "response": {
            "url": "https://api.example.com/users",
            "status": 200,
            "statusText": "OK",
            "headers": {},
            "mimeType": "application/json"
        },
        "timestamp": MONO_BASE + 0.089
    });
    assert!(observer.ingest_cdp("Network.responseReceived", &response_params).await);

    let finished_params = serde_json::json!({
        "requestId": "R1",
        "timestamp": MONO_BASE + 0.095,
        "encodedDataLength": 2048
    });
    assert!(observer.ingest_cdp("Network.loadingFinished", &finished_params).await);

    // Unknown methods and malformed payloads are dropped.
    assert!(!observer.ingest_cdp("Network.dataReceived", &serde_json::json!({})).await);
    assert!(
        !observer
            .ingest_cdp("Network.loadingFinished", &serde_json::json!({"timestamp": 1.0}))
            .await
    );

    let record = observer.get_request(&RequestId::from("R1")).unwrap();
    assert_eq!(record.status, 200);
    assert_eq!(record.resource_kind, ResourceKind::Fetch);
    let duration = record.timing.duration_ms.unwrap();
    assert!((duration - 95.0).abs() < 1e-6);
}

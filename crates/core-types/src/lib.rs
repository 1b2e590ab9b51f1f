//! Shared types for the netlens observer crates.
//!
//! Everything the ingester, correlator, and facade exchange lives here: request and
//! action records, initiator metadata, attribution results, and the capture signals
//! published on the observer bus.

pub mod config;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Contract-violation errors. In-band conditions (malformed events, unknown IDs,
/// failed body fetches) are absorbed by the observer and never surface here.
#[derive(Debug, Error, Clone)]
pub enum ObserverError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Opaque request identifier supplied by the debug event source.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Stable string form of the action log's monotonic counter.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn from_counter(counter: u64) -> Self {
        Self(format!("action-{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource classification reported by the event source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Script,
    Image,
    Font,
    Xhr,
    Fetch,
    WebSocket,
    Other,
}

impl ResourceKind {
    /// Map the protocol's `type` string; unknown labels fold into `Other`.
    pub fn from_protocol(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "stylesheet" => Self::Stylesheet,
            "script" => Self::Script,
            "image" => Self::Image,
            "font" => Self::Font,
            "xhr" => Self::Xhr,
            "fetch" => Self::Fetch,
            "websocket" => Self::WebSocket,
            _ => Self::Other,
        }
    }
}

impl Default for ResourceKind {
    fn default() -> Self {
        Self::Other
    }
}

/// Discriminant of the request initiator reported by the source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiatorKind {
    Parser,
    Script,
    Preload,
    Preflight,
    Other,
}

impl InitiatorKind {
    pub fn from_protocol(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "parser" => Self::Parser,
            "script" => Self::Script,
            "preload" => Self::Preload,
            "preflight" => Self::Preflight,
            _ => Self::Other,
        }
    }
}

/// One frame of a JavaScript call stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallFrame {
    pub function_name: String,
    pub url: String,
    pub line: u32,
    pub column: u32,
}

/// Linked stack structure: each node holds its synchronous frames and an optional
/// async parent. Iteration over parents is bounded by the correlator, so cyclic or
/// pathological inputs cannot spin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StackTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub frames: Vec<CallFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<StackTrace>>,
}

/// Initiator metadata attached to a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestInitiator {
    pub kind: InitiatorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// For a `Preflight` initiator: the actual request this one clears the way for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_request: Option<RequestId>,
}

impl RequestInitiator {
    pub fn other() -> Self {
        Self {
            kind: InitiatorKind::Other,
            stack: None,
            url: None,
            line: None,
            column: None,
            target_request: None,
        }
    }
}

/// One coalesced redirect hop: the URL that answered, its status, and its headers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedirectHop {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// Wall-clock timing for a request, in milliseconds since the epoch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestTiming {
    pub start_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

/// How an attribution was decided, strongest evidence first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    StackTrace,
    TimingSemantic,
    TimingOnly,
    Chain,
}

/// Correlator verdict attached to a request record, set at most once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attribution {
    pub action_id: ActionId,
    pub confidence: f64,
    pub method: AttributionMethod,
}

/// A single network exchange through its full lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    /// Monotonic insertion index used for display ordering.
    pub index: u64,
    pub url: String,
    pub method: String,
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// Zero until a response (or failure) is observed.
    pub status: u16,
    pub status_text: String,
    pub response_headers: HashMap<String, String>,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub response_size: u64,
    pub resource_kind: ResourceKind,
    pub initiator: RequestInitiator,
    pub timing: RequestTiming,
    /// Prior hops coalesced under this request ID; the record URL is the final hop.
    #[serde(default)]
    pub redirect_chain: Vec<RedirectHop>,
    /// Set when this record is the preflight covering another request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_for: Option<RequestId>,
    /// Set when another record is the preflight covering this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<Attribution>,
}

impl RequestRecord {
    /// Case-insensitive request-header lookup; header names keep their original case.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.request_headers, name)
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.response_headers, name)
    }
}

fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Kinds of user-level actions the log records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Navigate,
    Type,
    Submit,
    Scroll,
    AgentAction,
}

/// A recorded user action. Append-only within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub kind: ActionKind,
    pub selector: String,
    pub description: String,
    /// Wall-clock milliseconds at creation.
    pub timestamp_ms: f64,
    pub page_url: String,
    /// Requests attributed to this action, populated by the correlator.
    #[serde(default)]
    pub resulting_request_ids: Vec<RequestId>,
}

/// Causal structure discovered inside a correlated group.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Redirect,
    Preflight,
    AuthFlow,
    Sequential,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestChain {
    pub kind: ChainKind,
    pub request_ids: Vec<RequestId>,
    pub description: String,
}

/// Output of per-action correlation: the action, its requests sorted by start time,
/// detected chains, and the mean member confidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub action: ActionRecord,
    pub requests: Vec<RequestRecord>,
    pub chains: Vec<RequestChain>,
    pub confidence: f64,
}

/// Counters exposed to the outer tool layer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ObserverStats {
    pub total_requests: usize,
    pub pending_requests: usize,
    pub total_actions: usize,
}

/// Signals published on the observer's broadcast bus as records move through the
/// capture pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CaptureSignal {
    RequestStarted {
        id: RequestId,
        url: String,
        method: String,
    },
    RequestFinalized {
        id: RequestId,
        url: String,
        status: u16,
    },
    RequestFailed {
        id: RequestId,
        url: String,
        error: String,
    },
    Cleared,
}

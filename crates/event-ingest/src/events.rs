//! Typed lifecycle events and the debug-protocol boundary.
//!
//! The event source is loosely typed; everything is funneled through
//! [`NetworkEvent::from_cdp`], which maps raw `Network.*` params into tagged
//! variants and rejects payloads missing required fields. Nothing past this module
//! sees an untyped value.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use netlens_core_types::{
    CallFrame, InitiatorKind, RequestId, RequestInitiator, StackTrace,
};

/// A network lifecycle event, already validated at the source boundary.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    RequestWillBeSent(RequestWillBeSent),
    ResponseReceived(ResponseReceived),
    LoadingFinished(LoadingFinished),
    LoadingFailed(LoadingFailed),
}

#[derive(Clone, Debug)]
pub struct RequestWillBeSent {
    pub request_id: RequestId,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub post_data: Option<String>,
    pub initiator: RequestInitiator,
    /// Seconds since the epoch; only request-sent events carry this.
    pub wall_time: f64,
    /// Monotonic seconds since an arbitrary origin.
    pub monotonic_time: f64,
    pub redirect_response: Option<RedirectResponse>,
    pub resource_type: Option<String>,
}

/// The response that caused a redirect-bearing request-sent event.
#[derive(Clone, Debug)]
pub struct RedirectResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ResponseReceived {
    pub request_id: RequestId,
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub mime_type: String,
    pub monotonic_time: f64,
    pub resource_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoadingFinished {
    pub request_id: RequestId,
    pub monotonic_time: f64,
    pub encoded_data_length: u64,
}

#[derive(Clone, Debug)]
pub struct LoadingFailed {
    pub request_id: RequestId,
    pub monotonic_time: f64,
    pub error_text: String,
}

impl NetworkEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::RequestWillBeSent(ev) => &ev.request_id,
            Self::ResponseReceived(ev) => &ev.request_id,
            Self::LoadingFinished(ev) => &ev.request_id,
            Self::LoadingFailed(ev) => &ev.request_id,
        }
    }

    /// Map a raw debug-protocol event into a typed variant.
    ///
    /// Returns `None` for methods outside the four lifecycle events and for
    /// payloads missing their required fields; the source is authoritative, so
    /// both are dropped without comment.
    pub fn from_cdp(method: &str, params: &Value) -> Option<NetworkEvent> {
        match method {
            "Network.requestWillBeSent" => {
                let raw: RawRequestWillBeSent = serde_json::from_value(params.clone()).ok()?;
                if raw.request.url.is_empty() {
                    return None;
                }
                Some(NetworkEvent::RequestWillBeSent(RequestWillBeSent {
                    request_id: RequestId(raw.request_id),
                    url: raw.request.url,
                    method: raw.request.method,
                    headers: headers_from_value(&raw.request.headers),
                    post_data: raw.request.post_data,
                    initiator: raw.initiator.map(initiator_from_raw).unwrap_or_else(RequestInitiator::other),
                    wall_time: raw.wall_time,
                    monotonic_time: raw.timestamp,
                    redirect_response: raw.redirect_response.map(|resp| RedirectResponse {
                        status: resp.status,
                        headers: headers_from_value(&resp.headers),
                    }),
                    resource_type: raw.resource_type,
                }))
            }
            "Network.responseReceived" => {
                let raw: RawResponseReceived = serde_json::from_value(params.clone()).ok()?;
                Some(NetworkEvent::ResponseReceived(ResponseReceived {
                    request_id: RequestId(raw.request_id),
                    url: raw.response.url,
                    status: raw.response.status,
                    status_text: raw.response.status_text,
                    headers: headers_from_value(&raw.response.headers),
                    mime_type: raw.response.mime_type,
                    monotonic_time: raw.timestamp,
                    resource_type: raw.resource_type,
                }))
            }
            "Network.loadingFinished" => {
                let raw: RawLoadingFinished = serde_json::from_value(params.clone()).ok()?;
                Some(NetworkEvent::LoadingFinished(LoadingFinished {
                    request_id: RequestId(raw.request_id),
                    monotonic_time: raw.timestamp,
                    encoded_data_length: raw.encoded_data_length.max(0.0) as u64,
                }))
            }
            "Network.loadingFailed" => {
                let raw: RawLoadingFailed = serde_json::from_value(params.clone()).ok()?;
                Some(NetworkEvent::LoadingFailed(LoadingFailed {
                    request_id: RequestId(raw.request_id),
                    monotonic_time: raw.timestamp,
                    error_text: raw.error_text,
                }))
            }
            _ => None,
        }
    }
}

fn initiator_from_raw(raw: RawInitiator) -> RequestInitiator {
    RequestInitiator {
        kind: InitiatorKind::from_protocol(&raw.kind),
        stack: raw.stack.map(stack_from_raw),
        url: raw.url,
        line: raw.line_number,
        column: raw.column_number,
        target_request: raw.request_id.map(RequestId),
    }
}

fn stack_from_raw(raw: RawStackTrace) -> StackTrace {
    StackTrace {
        description: raw.description,
        frames: raw
            .call_frames
            .into_iter()
            .map(|frame| CallFrame {
                function_name: frame.function_name,
                url: frame.url,
                line: frame.line_number,
                column: frame.column_number,
            })
            .collect(),
        parent: raw.parent.map(|parent| Box::new(stack_from_raw(*parent))),
    }
}

/// Protocol headers arrive as a JSON object whose values are usually strings but
/// occasionally numbers; stringify the rest, preserving name case.
fn headers_from_value(value: &Value) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(object) = value.as_object() {
        for (name, value) in object {
            let rendered = match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            };
            headers.insert(name.clone(), rendered);
        }
    }
    headers
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequestWillBeSent {
    request_id: String,
    request: RawRequest,
    wall_time: f64,
    timestamp: f64,
    #[serde(default)]
    redirect_response: Option<RawResponse>,
    #[serde(default)]
    initiator: Option<RawInitiator>,
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    url: String,
    method: String,
    #[serde(default)]
    headers: Value,
    #[serde(default)]
    post_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    #[serde(default)]
    url: String,
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Value,
    #[serde(default)]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponseReceived {
    request_id: String,
    response: RawResponse,
    timestamp: f64,
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadingFinished {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    encoded_data_length: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadingFailed {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    error_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInitiator {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    stack: Option<RawStackTrace>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    column_number: Option<u32>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStackTrace {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    call_frames: Vec<RawCallFrame>,
    #[serde(default)]
    parent: Option<Box<RawStackTrace>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCallFrame {
    #[serde(default)]
    function_name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    line_number: u32,
    #[serde(default)]
    column_number: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_will_be_sent() {
        let params = json!({
            "requestId": "R1",
            "request": {
                "url": "https://api.example.com/users",
                "method": "GET",
                "headers": { "Accept": "application/json", "Content-Length": 42 }
            },
            "wallTime": 1700000000.5,
            "timestamp": 12.25,
            "initiator": {
                "type": "script",
                "stack": {
                    "callFrames": [
                        { "functionName": "loadUsers", "url": "https://app/main.js", "lineNumber": 10, "columnNumber": 4 }
                    ],
                    "parent": { "description": "click", "callFrames": [] }
                }
            },
            "type": "Fetch"
        });

        let event = NetworkEvent::from_cdp("Network.requestWillBeSent", &params).unwrap();
        let NetworkEvent::RequestWillBeSent(ev) = event else {
            panic!("wrong variant");
        };
        assert_eq!(ev.request_id.as_str(), "R1");
        assert_eq!(ev.headers.get("Accept").unwrap(), "application/json");
        assert_eq!(ev.headers.get("Content-Length").unwrap(), "42");
        let stack = ev.initiator.stack.unwrap();
        assert_eq!(stack.frames[0].function_name, "loadUsers");
        assert_eq!(
            stack.parent.unwrap().description.as_deref(),
            Some("click")
        );
    }

    #[test]
    fn missing_request_id_is_rejected() {
        let params = json!({
            "request": { "url": "https://example.com", "method": "GET" },
            "wallTime": 1.0,
            "timestamp": 1.0
        });
        assert!(NetworkEvent::from_cdp("Network.requestWillBeSent", &params).is_none());
    }

    #[test]
    fn empty_url_is_rejected() {
        let params = json!({
            "requestId": "R1",
            "request": { "url": "", "method": "GET" },
            "wallTime": 1.0,
            "timestamp": 1.0
        });
        assert!(NetworkEvent::from_cdp("Network.requestWillBeSent", &params).is_none());
    }

    #[test]
    fn unknown_methods_are_ignored(){
        assert!(NetworkEvent::from_cdp("Network.webSocketCreated", &json!({})).is_none());
    }

    #[test]
    fn preflight_initiator_carries_target() {
        let params = json!({
            "requestId": "PF1",
            "request": { "url": "https://api.example.com/users", "method": "OPTIONS" },
            "wallTime": 1.0,
            "timestamp": 1.0,
            "initiator": { "type": "preflight", "requestId": "R1" }
        });
        let NetworkEvent::RequestWillBeSent(ev) =
            NetworkEvent::from_cdp("Network.requestWillBeSent", &params).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(ev.initiator.kind, InitiatorKind::Preflight);
        assert_eq!(ev.initiator.target_request.unwrap().as_str(), "R1");
    }
}

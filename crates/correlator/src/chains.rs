//! Causal chain detection inside a correlated request group.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use netlens_core_types::{ChainKind, RequestChain, RequestRecord};

/// Adjacent requests closer than this are considered sequentially dependent.
const SEQUENTIAL_GAP_MS: f64 = 50.0;

/// How far behind an issued token we look when matching Authorization headers.
const TOKEN_PREFIX_CHARS: usize = 20;

static AUTH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)auth|login|sign-in|token|session|oauth").expect("static pattern"));

/// Detect redirect, preflight, auth-flow, and sequential chains in a group
/// already sorted by start time.
pub fn detect_chains(group: &[RequestRecord]) -> Vec<RequestChain> {
    let mut chains = Vec::new();

    for record in group {
        if !record.redirect_chain.is_empty() {
            let hops = record.redirect_chain.len();
            chains.push(RequestChain {
                kind: ChainKind::Redirect,
                request_ids: vec![record.id.clone()],
                description: format!(
                    "{hops} redirect hop{} ending at {}",
                    if hops == 1 { "" } else { "s" },
                    url_path(&record.url)
                ),
            });
        }
    }

    for record in group {
        if let Some(preflight_id) = &record.preflight_request_id {
            if group.iter().any(|other| &other.id == preflight_id) {
                chains.push(RequestChain {
                    kind: ChainKind::Preflight,
                    request_ids: vec![preflight_id.clone(), record.id.clone()],
                    description: format!(
                        "CORS preflight for {} {}",
                        record.method,
                        url_path(&record.url)
                    ),
                });
            }
        }
    }

    if let Some(chain) = detect_auth_flow(group) {
        chains.push(chain);
    }

    for pair in group.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if let Some(prev_end) = prev.timing.end_ms {
            let gap = next.timing.start_ms - prev_end;
            if (0.0..=SEQUENTIAL_GAP_MS).contains(&gap) {
                chains.push(RequestChain {
                    kind: ChainKind::Sequential,
                    request_ids: vec![prev.id.clone(), next.id.clone()],
                    description: format!(
                        "{} then {} after {:.0} ms",
                        url_path(&prev.url),
                        url_path(&next.url),
                        gap
                    ),
                });
            }
        }
    }

    chains
}

/// At most one auth-flow chain per group: the first token-issuing POST plus
/// every later request presenting that token.
fn detect_auth_flow(group: &[RequestRecord]) -> Option<RequestChain> {
    for record in group {
        if !record.method.eq_ignore_ascii_case("POST") {
            continue;
        }
        if !AUTH_URL.is_match(&record.url) {
            continue;
        }
        if !(200..300).contains(&record.status) {
            continue;
        }
        let Some(token) = record.response_body.as_deref().and_then(extract_token) else {
            continue;
        };
        let prefix: String = token.chars().take(TOKEN_PREFIX_CHARS).collect();

        let dependents: Vec<_> = group
            .iter()
            .filter(|other| {
                other.id != record.id
                    && other.timing.start_ms > record.timing.start_ms
                    && other
                        .request_header("authorization")
                        .map(|value| value.contains(&prefix))
                        .unwrap_or(false)
            })
            .collect();

        if dependents.is_empty() {
            continue;
        }

        let mut request_ids = vec![record.id.clone()];
        request_ids.extend(dependents.iter().map(|other| other.id.clone()));
        let count = dependents.len();
        return Some(RequestChain {
            kind: ChainKind::AuthFlow,
            request_ids,
            description: format!(
                "auth via {} feeds {} authenticated request{}",
                url_path(&record.url),
                count,
                if count == 1 { "" } else { "s" }
            ),
        });
    }
    None
}

/// Pull a bearer token out of an auth response body. Looks for a string under
/// `token`, `access_token`, or `jwt`, at the top level or nested under `data`.
fn extract_token(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    const KEYS: &[&str] = &["token", "access_token", "jwt"];
    for key in KEYS {
        if let Some(token) = value.get(key).and_then(Value::as_str) {
            return Some(token.to_string());
        }
    }
    let data = value.get("data")?;
    for key in &["token", "access_token"] {
        if let Some(token) = data.get(key).and_then(Value::as_str) {
            return Some(token.to_string());
        }
    }
    None
}

/// Best-effort URL path for display. Malformed URLs, empty strings, and exotic
/// schemes fall back to the raw text.
pub(crate) fn url_path(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(parsed) => {
            let path = parsed.path();
            if path.is_empty() {
                raw.to_string()
            } else {
                path.to_string()
            }
        }
        Err(_) => raw.to_string(),
    }
}

//! Timing and semantic scoring for attribution candidates.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use netlens_core_types::{ActionKind, ActionRecord, RequestRecord, ResourceKind};

/// Decay constant of the proximity term: a candidate loses half its proximity
/// bonus roughly every 100 ms of distance from the action.
const PROXIMITY_WEIGHT: f64 = 0.35;
const PROXIMITY_DECAY_MS: f64 = 150.0;

const BACKGROUND_PENALTY: f64 = 0.20;

/// Hosts and URL fragments that mark analytics/telemetry noise rather than
/// user-triggered traffic.
const BACKGROUND_URL_HINTS: &[&str] = &[
    "google-analytics",
    "gtag",
    "fbevents",
    "segment.io",
    "hotjar",
    "sentry",
    "datadog",
    "newrelic",
    "analytics",
    "tracking",
    "telemetry",
    "heartbeat",
    "health",
    "ping",
    "beacon",
];

struct SemanticRule {
    action_text: Regex,
    url: Option<Regex>,
    method: Option<&'static str>,
    bonus: f64,
}

fn rule(action_text: &str, url: Option<&str>, method: Option<&'static str>, bonus: f64) -> SemanticRule {
    let compile = |pattern: &str| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("static semantic pattern")
    };
    SemanticRule {
        action_text: compile(action_text),
        url: url.map(compile),
        method,
        bonus,
    }
}

/// Ordered rule table; the first matching row wins.
static SEMANTIC_RULES: Lazy<Vec<SemanticRule>> = Lazy::new(|| {
    vec![
        rule(
            r"login|sign[ -]?in",
            Some(r"auth|login|sign-?in|session"),
            Some("POST"),
            0.30,
        ),
        rule(
            r"register|sign[ -]?up",
            Some(r"register|sign-?up|user"),
            Some("POST"),
            0.30,
        ),
        rule(r"save|update|submit", None, Some("POST"), 0.15),
        rule(r"delete|remove", None, Some("DELETE"), 0.25),
        rule(r"search", Some(r"search|query|find"), Some("GET"), 0.25),
        rule(
            r"load[ -]?more|next",
            Some(r"page|offset|cursor|limit"),
            Some("GET"),
            0.20,
        ),
        rule(
            r"logout|sign[ -]?out",
            Some(r"logout|sign-?out|session"),
            None,
            0.30,
        ),
    ]
});

pub(crate) fn is_background_url(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    BACKGROUND_URL_HINTS
        .iter()
        .any(|hint| lowered.contains(hint))
}

fn action_type_bonus(request: &RequestRecord, action: &ActionRecord) -> f64 {
    match action.kind {
        ActionKind::Navigate if request.resource_kind == ResourceKind::Document => 0.35,
        ActionKind::Submit if request.method.eq_ignore_ascii_case("POST") => 0.25,
        ActionKind::Click
            if matches!(
                request.resource_kind,
                ResourceKind::Xhr | ResourceKind::Fetch
            ) =>
        {
            0.15
        }
        _ => 0.0,
    }
}

fn semantic_rule_bonus(request: &RequestRecord, action: &ActionRecord) -> f64 {
    let action_text = format!("{} {}", action.description, action.selector);
    for rule in SEMANTIC_RULES.iter() {
        if !rule.action_text.is_match(&action_text) {
            continue;
        }
        if let Some(url) = &rule.url {
            if !url.is_match(&request.url) {
                continue;
            }
        }
        if let Some(method) = rule.method {
            if !request.method.eq_ignore_ascii_case(method) {
                continue;
            }
        }
        return rule.bonus;
    }
    0.0
}

/// Score a time-window candidate: exponential proximity plus semantic evidence,
/// minus the background penalty, clamped to [0, 1]. Negative deltas inside the
/// clock-skew tolerance get the full proximity bonus.
pub(crate) fn score_candidate(request: &RequestRecord, action: &ActionRecord) -> f64 {
    let delta_ms = (request.timing.start_ms - action.timestamp_ms).max(0.0);
    let proximity = PROXIMITY_WEIGHT * (-delta_ms / PROXIMITY_DECAY_MS).exp();

    let mut score = proximity + action_type_bonus(request, action) + semantic_rule_bonus(request, action);
    if is_background_url(&request.url) {
        score -= BACKGROUND_PENALTY;
    }
    score.clamp(0.0, 1.0)
}

//! Filtering over the finalized store.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use netlens_core_types::{RequestRecord, ResourceKind};

/// URL matcher that prefers a compiled regex and degrades to case-insensitive
/// substring match when the pattern does not compile. User-supplied patterns are
/// never a reason to error.
#[derive(Clone, Debug)]
pub enum UrlMatcher {
    Pattern(Regex),
    Substring(String),
}

impl UrlMatcher {
    pub fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Self::Pattern(regex),
            Err(_) => Self::Substring(pattern.to_ascii_lowercase()),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Pattern(regex) => regex.is_match(url),
            Self::Substring(needle) => url.to_ascii_lowercase().contains(needle.as_str()),
        }
    }
}

/// Filter over finalized request records. All criteria are optional and
/// conjunctive.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Regex over the URL; invalid patterns degrade to substring match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    /// Exact method, compared case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_min: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_max: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<ResourceKind>,
    /// Keep records whose start time is at or after this wall-clock millisecond.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_ms: Option<f64>,
    /// Applied after sorting by insertion order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn url(mut self, pattern: impl Into<String>) -> Self {
        self.url_pattern = Some(pattern.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn status_range(mut self, min: u16, max: u16) -> Self {
        self.status_min = Some(min);
        self.status_max = Some(max);
        self
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.resource_kind = Some(kind);
        self
    }

    pub fn since(mut self, timestamp_ms: f64) -> Self {
        self.since_ms = Some(timestamp_ms);
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Apply a filter to a snapshot, sorting by insertion index before the limit.
pub fn apply_filter(filter: &RequestFilter, mut records: Vec<RequestRecord>) -> Vec<RequestRecord> {
    let url_matcher = filter.url_pattern.as_deref().map(UrlMatcher::new);

    records.retain(|record| {
        if let Some(matcher) = &url_matcher {
            if !matcher.matches(&record.url) {
                return false;
            }
        }
        if let Some(method) = &filter.method {
            if !record.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(min) = filter.status_min {
            if record.status < min {
                return false;
            }
        }
        if let Some(max) = filter.status_max {
            if record.status > max {
                return false;
            }
        }
        if let Some(kind) = filter.resource_kind {
            if record.resource_kind != kind {
                return false;
            }
        }
        if let Some(since) = filter.since_ms {
            if record.timing.start_ms < since {
                return false;
            }
        }
        true
    });

    records.sort_by_key(|record| record.index);
    if let Some(limit) = filter.limit {
        records.truncate(limit);
    }
    records
}

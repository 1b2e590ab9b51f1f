//! Response body retrieval.
//!
//! The ingester never talks to the browser itself; finalization invokes a
//! caller-supplied [`BodyFetcher`] for text-like media types. Failures are
//! non-fatal and leave the body unset.

use async_trait::async_trait;

use netlens_core_types::RequestId;

/// Body payload handed back by the fetch callback.
#[derive(Clone, Debug)]
pub struct FetchedBody {
    pub body: String,
    pub base64_encoded: bool,
}

/// Caller-supplied response-body retrieval seam.
#[async_trait]
pub trait BodyFetcher: Send + Sync {
    /// Fetch the response body for a finalized request. `Ok(None)` and `Err` both
    /// finalize the record without a body.
    async fn fetch_body(&self, id: &RequestId) -> anyhow::Result<Option<FetchedBody>>;
}

/// Media types whose bodies are binary and never fetched.
const SKIPPED_MIME_PREFIXES: &[&str] = &["image/", "video/", "audio/"];
const SKIPPED_MIME_MARKERS: &[&str] = &["font", "wasm"];

pub(crate) fn body_is_fetchable(mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    if SKIPPED_MIME_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
    {
        return false;
    }
    !SKIPPED_MIME_MARKERS.iter().any(|marker| mime.contains(marker))
}

pub(crate) const TRUNCATION_MARKER: &str = "... [truncated]";

/// Render a fetched body for storage: base64 payloads become a placeholder,
/// text is truncated to the configured character limit.
pub(crate) fn render_body(fetched: FetchedBody, max_chars: usize) -> String {
    if fetched.base64_encoded {
        return format!("[base64 encoded, {} chars]", fetched.body.chars().count());
    }
    if fetched.body.chars().count() <= max_chars {
        return fetched.body;
    }
    let mut truncated: String = fetched.body.chars().take(max_chars).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

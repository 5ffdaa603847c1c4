// =============================================================================
// Cross-component error taxonomy
// =============================================================================
//
// Components map their own failures into these kinds at the boundary where a
// caller has to pick a policy (retry / fallback / pause / abandon). Everything
// else stays `anyhow` with context, the same as the rest of the engine.
//
// Retry policy per kind:
//   Unavailable       — bounded retry with backoff, then surface.
//   RateLimited       — honour retry-after when present, otherwise backoff.
//   InvalidParams     — never retried; names the offending field.
//   ContentFiltered   — never retried; surfaced to the transport as 400-class.
//   MalformedResponse — one retry with a tightened instruction, then abandon
//                       the tick without executing anything.
//   NeedsCredentials  — never retried; the account's monitor is paused.
//   Invariant         — never retried; the tick fails, state is not touched.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParams { field: &'static str, reason: String },

    #[error("reasoning provider filtered the request")]
    ContentFiltered,

    #[error("reasoning provider returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("credentials missing or rejected: {0}")]
    NeedsCredentials(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry this failure at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }
}

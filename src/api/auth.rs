// =============================================================================
// Operator-token guard for the bridge
// =============================================================================
//
// The bridge is an operator surface, not the end-user product: user accounts,
// sessions, and login all live in the external transport. The only
// authentication the core itself performs is a single shared operator token,
// read from `MERIDIAN_ADMIN_TOKEN` on each request so rotating it needs no
// restart.
//
// Token comparison runs over every byte regardless of where a mismatch
// occurs. Length is the one observable difference, which is acceptable here:
// the operator chooses the token, so its length is not a secret an attacker
// can probe for.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

/// Constant-time token comparison; accumulates differences instead of
/// returning at the first mismatching byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extractor guarding every operator endpoint. Succeeds only when the request
/// carries `Authorization: Bearer <token>` matching the configured operator
/// token; otherwise the handler body never runs.
pub struct OperatorToken;

pub struct OperatorRejection {
    status: StatusCode,
    detail: &'static str,
}

impl IntoResponse for OperatorRejection {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({ "error": self.detail })),
        )
            .into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for OperatorToken
where
    S: Send + Sync,
{
    type Rejection = OperatorRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{TOKEN_ENV} unset — operator endpoints are disabled");
            return Err(OperatorRejection {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: "operator access disabled: no token configured",
            });
        }

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(presented) = presented else {
            return Err(OperatorRejection {
                status: StatusCode::UNAUTHORIZED,
                detail: "operator token required",
            });
        };

        if !token_matches(presented, &expected) {
            warn!("operator token rejected");
            return Err(OperatorRejection {
                status: StatusCode::FORBIDDEN,
                detail: "operator token rejected",
            });
        }

        Ok(OperatorToken)
    }
}

/// WebSocket upgrades carry the token as a `?token=` query parameter, where
/// the extractor cannot run; they validate through this helper instead.
pub fn query_token_valid(token: &str) -> bool {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    !expected.is_empty() && token_matches(token, &expected)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_pass() {
        assert!(token_matches("mer-4f2a", "mer-4f2a"));
        assert!(token_matches("", ""));
    }

    #[test]
    fn mismatches_fail_regardless_of_position() {
        assert!(!token_matches("mer-4f2a", "mer-4f2b")); // last byte
        assert!(!token_matches("Xer-4f2a", "mer-4f2a")); // first byte
        assert!(!token_matches("mer-4f2a", "mer-4f2a-extra")); // length
    }

    #[test]
    fn single_bit_difference_fails() {
        assert!(!token_matches("\u{0}", "\u{1}"));
    }
}

// =============================================================================
// Engine error kinds — stable, matchable error surface for REST/WS callers
// =============================================================================
//
// Internal plumbing still propagates with `anyhow::Context` the way the rest
// of the engine does; this type is reserved for the boundary where a caller
// needs to match on *which* thing went wrong rather than read a message.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize)]
#[serde(tag = "code", content = "message")]
pub enum EngineError {
    #[error("authentication required")]
    AuthenticationRequired,

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("broker limitation: {0}")]
    BrokerLimitation(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("rate limited")]
    RateLimited,

    #[error("risk rejected: {0}")]
    RiskRejected(String),

    #[error("subscription error: {0}")]
    SubscriptionError(String),

    #[error("not subscribed")]
    NotSubscribed,

    /// Dedup-window hit on `place`/`smart_close`. This is not a
    /// rejection — callers get the original result back — so the order
    /// router never actually constructs this variant; it exists so the
    /// error-kind table has a stable code for documentation/REST-shape
    /// purposes and for any caller that wants to branch on it explicitly.
    #[error("duplicate order")]
    DuplicateOrder,

    /// An active trade was missing at the broker on recovery. Not an
    /// error to the caller — the trade monitor logs and marks the trade
    /// closed rather than returning this to anyone — kept here for the same
    /// documentation/REST-shape reason as `DuplicateOrder`.
    #[error("reconciliation warning: {0}")]
    ReconciliationWarning(String),
}

impl EngineError {
    /// Stable machine-readable code, independent of the Display message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::SymbolNotFound(_) => "SYMBOL_NOT_FOUND",
            Self::InvalidParameters(_) => "INVALID_PARAMETERS",
            Self::BrokerLimitation(_) => "BROKER_LIMITATION",
            Self::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::RiskRejected(_) => "RISK_REJECTED",
            Self::SubscriptionError(_) => "SUBSCRIPTION_ERROR",
            Self::NotSubscribed => "NOT_SUBSCRIBED",
            Self::DuplicateOrder => "DUPLICATE_ORDER",
            Self::ReconciliationWarning(_) => "RECONCILIATION_WARNING",
        }
    }

    /// HTTP status the REST layer should map this to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthenticationRequired | Self::InvalidApiKey => 401,
            Self::SymbolNotFound(_) | Self::InvalidParameters(_) => 400,
            Self::BrokerLimitation(_) => 422,
            Self::UpstreamTimeout(_) | Self::UpstreamError(_) => 502,
            Self::RateLimited => 429,
            Self::RiskRejected(_) => 403,
            Self::SubscriptionError(_) | Self::NotSubscribed => 400,
            Self::DuplicateOrder => 200,
            Self::ReconciliationWarning(_) => 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(
            EngineError::SymbolNotFound("X".into()).code(),
            "SYMBOL_NOT_FOUND"
        );
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(EngineError::RateLimited.http_status(), 429);
        assert_eq!(EngineError::InvalidApiKey.http_status(), 401);
        assert_eq!(EngineError::RiskRejected("x".into()).http_status(), 403);
    }
}

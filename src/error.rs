//! Error classification for upstream calls, plus the `anyhow`-wrapping
//! `AppError` used to let axum handlers return `Result<_, AppError>` and
//! propagate with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a single attempt against one model failed: status-code checks first,
/// then keyword matching, then connection-level failures, then an
/// empty-body sentinel.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("超首token限制时长")]
    FirstTokenTimeout,
    #[error("超总限制时长")]
    TotalTimeout,
    #[error("连接超时")]
    ConnectTimeout,
    #[error("触发错误状态码: {0}")]
    StatusCode(u16),
    #[error("错误关键词: {0}")]
    Keyword(String),
    #[error("空返回")]
    EmptyResponse,
    #[error("上游错误: {0}")]
    Other(String),
}

impl UpstreamError {
    /// The localized reason string recorded on the `TraceEvent` and surfaced
    /// to the caller when every model in every round is exhausted.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Whether this failure should hard-exclude the model for the rest of
    /// the request (never retried again, any round) instead of merely
    /// being skipped for the remainder of the current round.
    pub fn is_hard_exclude(&self) -> bool {
        matches!(self, UpstreamError::StatusCode(401 | 403 | 404 | 429))
    }

    /// Low-cardinality label for the `gateway_model_failures_total` metric;
    /// unlike `reason()`, never embeds a dynamic status code or keyword.
    pub fn reason_kind(&self) -> &'static str {
        match self {
            UpstreamError::FirstTokenTimeout => "ttft_timeout",
            UpstreamError::TotalTimeout => "total_timeout",
            UpstreamError::ConnectTimeout => "connect_timeout",
            UpstreamError::StatusCode(_) => "status_code",
            UpstreamError::Keyword(_) => "keyword",
            UpstreamError::EmptyResponse => "empty_response",
            UpstreamError::Other(_) => "other",
        }
    }
}

/// Wraps [`anyhow::Error`] so handlers can return `Result<T, AppError>` and
/// use `?` freely; any error implementing `Into<anyhow::Error>` converts via
/// the blanket [`From`] below.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": self.0.to_string() } })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_exclude_only_for_auth_not_found_and_rate_limit() {
        assert!(UpstreamError::StatusCode(401).is_hard_exclude());
        assert!(UpstreamError::StatusCode(403).is_hard_exclude());
        assert!(UpstreamError::StatusCode(404).is_hard_exclude());
        assert!(UpstreamError::StatusCode(429).is_hard_exclude());
        assert!(!UpstreamError::StatusCode(500).is_hard_exclude());
    }

    #[test]
    fn reason_strings_match_localized_table() {
        assert_eq!(UpstreamError::FirstTokenTimeout.reason(), "超首token限制时长");
        assert_eq!(UpstreamError::TotalTimeout.reason(), "超总限制时长");
        assert_eq!(UpstreamError::ConnectTimeout.reason(), "连接超时");
        assert_eq!(UpstreamError::EmptyResponse.reason(), "空返回");
        assert_eq!(
            UpstreamError::StatusCode(503).reason(),
            "触发错误状态码: 503"
        );
        assert_eq!(
            UpstreamError::Keyword("overloaded".to_string()).reason(),
            "错误关键词: overloaded"
        );
    }
}

//! Axum middleware applying request admission.
//!
//! Admitted requests get `X-RateLimit-*` headers describing their global
//! budget. Rejected requests never reach the inner service and get a 429
//! with a JSON body. Bypassed paths pass through untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::ratelimit::{Admission, Decision, RateLimiter};

/// Budget size header.
pub const RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Remaining budget header.
pub const RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Reset time header, in epoch seconds.
pub const RATELIMIT_RESET: &str = "x-ratelimit-reset";

const REJECTION_MESSAGE: &str = "Rate limit exceeded. Please try again later.";
const REJECTION_CODE: &str = "RATE_LIMIT_EXCEEDED";

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
    pub error_code: String,
    pub details: RejectionDetails,
}

/// The exhausted budget, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionDetails {
    pub limit: u32,
    /// Window length in seconds
    pub window: u64,
    pub retry_after: u64,
}

/// Rate limiting middleware.
///
/// Install with `axum::middleware::from_fn_with_state(limiter, admission_middleware)`.
/// Client identification relies on `ConnectInfo<SocketAddr>` when no proxy
/// header is present, so serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn admission_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let client = client_identifier(&request);
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match limiter.admit(&path, authorization.as_deref(), &client).await {
        Admission::Bypassed => next.run(request).await,
        Admission::Admitted { governing, .. } => {
            let mut response = next.run(request).await;
            if let Some(decision) = governing {
                insert_rate_limit_headers(
                    response.headers_mut(),
                    decision.limit,
                    decision.remaining,
                    limiter.reset_epoch(&decision),
                );
            }
            response
        }
        Admission::Rejected { decision, .. } => rejection_response(&limiter, &decision),
    }
}

/// Identify the client a request's budgets are keyed by.
///
/// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
/// address.
pub fn client_identifier(request: &Request) -> String {
    let headers = request.headers();

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn rejection_response(limiter: &RateLimiter, decision: &Decision) -> Response {
    let retry_after = decision
        .retry_after
        .unwrap_or_else(|| decision.window.as_secs());

    let body = RejectionBody {
        success: false,
        message: REJECTION_MESSAGE.to_string(),
        error_code: REJECTION_CODE.to_string(),
        details: RejectionDetails {
            limit: decision.limit,
            window: decision.window.as_secs(),
            retry_after,
        },
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    insert_rate_limit_headers(headers, decision.limit, 0, limiter.reset_epoch(decision));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: i64) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(reset));
}

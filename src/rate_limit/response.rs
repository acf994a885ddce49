use super::CheckResult;
use crate::headers;
use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Build the 429 response for a rejecting result
pub fn rejection_response(result: &CheckResult) -> Response {
    let action = result.action();

    let message = match &result.block_info {
        Some(info) => format!(
            "IP temporarily blocked (level {}); retry after {} seconds",
            info.level, result.retry_after
        ),
        None => format!(
            "Rate limit exceeded for {} tier; retry after {} seconds",
            result.tier, result.retry_after
        ),
    };

    let mut body = json!({
        "error": result.error_code(),
        "message": message,
        "retryAfter": result.retry_after,
        "action": action.as_str(),
        "limit": result.limit,
        "current": result.current,
        "resetTime": result.reset_time,
    });
    if let Some(info) = &result.block_info {
        body["blockInfo"] = json!({
            "level": info.level,
            "expiresAt": info.expires_at,
        });
    }

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    let map = response.headers_mut();
    apply_limit_headers(map, result);
    insert(map, HeaderName::from_static(headers::RATE_LIMIT_RETRY_AFTER), result.retry_after);
    insert(map, RETRY_AFTER, result.retry_after);
    insert(map, HeaderName::from_static(headers::ACTION), action.as_str());
    insert(map, HeaderName::from_static(headers::RATE_LIMIT_TIER), result.tier.as_str());

    response
}

/// `X-Rate-Limit-{Limit,Remaining,Reset}` for any result
pub fn apply_limit_headers(map: &mut HeaderMap, result: &CheckResult) {
    insert(map, HeaderName::from_static(headers::RATE_LIMIT_LIMIT), result.limit);
    insert(map, HeaderName::from_static(headers::RATE_LIMIT_REMAINING), result.remaining);
    insert(map, HeaderName::from_static(headers::RATE_LIMIT_RESET), result.reset_time);
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

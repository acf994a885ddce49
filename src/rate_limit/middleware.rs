use super::{first_rejection, rejection_response, response::apply_limit_headers, tightest, Identifier, RateLimiter};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Admission check in front of the ingestion endpoint
///
/// Rejected requests get a 429 and never reach the handler. Admitted
/// requests carry the tightest tier's limit headers.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let trust_proxy_headers = limiter.config().trust_proxy_headers;
    let identifier = Identifier::from_request(req.headers(), peer, trust_proxy_headers);

    let Some(results) = limiter.check_rate_limit(&identifier).await else {
        req.extensions_mut().insert(identifier);
        return next.run(req).await;
    };

    if let Some(rejection) = first_rejection(&results) {
        tracing::debug!(
            ip = %identifier.ip,
            tier = %rejection.tier,
            blocked = rejection.is_blocked,
            "Request rejected by rate limiter"
        );
        return rejection_response(rejection);
    }

    let informational = tightest(&results).cloned();
    req.extensions_mut().insert(identifier);
    let mut response = next.run(req).await;

    if let Some(result) = informational {
        apply_limit_headers(response.headers_mut(), &result);
    }
    response
}

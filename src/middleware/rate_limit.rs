use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::auth::CurrentUser;
use crate::rate_limit::{RateLimitDecision, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&req, limiter.config().trust_proxy);
    let decision = limiter.hit(&key).await;

    let mut response = if decision.allowed() {
        next.run(req).await
    } else {
        tracing::warn!(key = %key, count = decision.count, limit = decision.limit, "rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(limiter.config().message.clone()),
        )
            .into_response()
    };

    insert_headers(response.headers_mut(), &decision);
    response
}

/// `user:<id>` when signed in, else `ip:<address>`, else `"unknown"`.
/// The prefixes keep a user id from sharing a counter with an address.
pub fn client_key<B>(req: &Request<B>, trust_proxy: bool) -> String {
    if let Some(user) = req.extensions().get::<CurrentUser>() {
        return format!("user:{}", user.id);
    }

    let forwarded = trust_proxy
        .then(|| forwarded_ip(req.headers()))
        .flatten();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    forwarded
        .or(peer)
        .map(|ip| format!("ip:{}", ip))
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

fn insert_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request<()> {
        Request::builder().uri("/").body(()).expect("request")
    }

    #[test]
    fn user_id_wins_over_address() {
        let mut req = request();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        req.extensions_mut().insert(CurrentUser { id: "u-1".into() });
        assert_eq!(client_key(&req, false), "user:u-1");
    }

    #[test]
    fn falls_back_to_peer_then_unknown() {
        let mut req = request();
        assert_eq!(client_key(&req, false), "unknown");

        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        assert_eq!(client_key(&req, false), "ip:10.0.0.1");
    }

    #[test]
    fn user_id_that_looks_like_an_address_gets_its_own_key() {
        let mut anonymous = request();
        anonymous
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        let mut signed_in = request();
        signed_in.extensions_mut().insert(CurrentUser {
            id: "10.0.0.1".into(),
        });

        assert_ne!(client_key(&anonymous, false), client_key(&signed_in, false));
    }

    #[test]
    fn proxy_headers_only_when_trusted() {
        let mut req = request();
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static(" , 203.0.113.9, 10.0.0.2"));
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        assert_eq!(client_key(&req, false), "ip:10.0.0.1");
        assert_eq!(client_key(&req, true), "ip:203.0.113.9");

        req.headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_key(&req, true), "ip:198.51.100.7");
    }
}

// Rate limiting for the auth surface. Signup, token, verify and
// magic-link requests are counted per resolved caller (user id when the
// request carries one, role otherwise) and client IP, over a fixed
// window sized by RATE_LIMIT_MAX / RATE_LIMIT_WINDOW_SECS.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use tokio::sync::RwLock;

use crate::features::rest::error::ApiError;
use crate::middleware::auth::AuthContext;

struct Bucket {
    window_start: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    /// Count one request against the caller's bucket. A bucket older than
    /// the window starts over.
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count += 1;
        bucket.count <= self.max_requests
    }

    /// Drop buckets whose window has lapsed so idle callers do not
    /// accumulate.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        self.buckets
            .write()
            .await
            .retain(|_, bucket| now.duration_since(bucket.window_start) < self.window);
    }
}

fn is_limited_path(path: &str) -> bool {
    matches!(
        path,
        "/auth/v1/signup" | "/auth/v1/token" | "/auth/v1/magiclink" | "/auth/v1/verify"
    )
}

/// The identity half of the bucket key: the authenticated user when
/// there is one, the resolved role otherwise.
fn caller_identity(request: &Request) -> String {
    match request.extensions().get::<AuthContext>() {
        Some(ctx) if !ctx.user_id.is_empty() => ctx.user_id.clone(),
        Some(ctx) => ctx.role.clone(),
        None => "anon".to_string(),
    }
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    Extension(limiter): Extension<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !is_limited_path(path) {
        return next.run(request).await;
    }

    let ip = client_ip(&request);
    let identity = caller_identity(&request);
    let key = format!("{}:{}:{}", ip, identity, path);

    if !limiter.check(&key).await {
        tracing::warn!(
            ip = %ip,
            identity = %identity,
            path = %path,
            "Rate limit exceeded"
        );
        return ApiError::rate_limited().into_response();
    }

    next.run(request).await
}

/// Background task dropping lapsed buckets once a minute.
pub async fn cleanup_task(limiter: Arc<RateLimiter>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        limiter.cleanup().await;
    }
}

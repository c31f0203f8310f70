use crate::api::ErrorResponse;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-client sliding window request limit.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}
impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }
    /// Records a request from `client` unless it is over the limit.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let window = self.window;
        hits.retain(|_, times| {
            times.retain(|t| now.duration_since(*t) < window);
            !times.is_empty()
        });
        let times = hits.entry(client.to_string()).or_default();
        if times.len() >= self.max_requests {
            return false;
        }
        times.push(now);
        true
    }
}

fn client_ip<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit<B>(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let ip = client_ip(&req);
    if !limiter.check(&ip) {
        warn!("Rate limit exceeded for {}", ip);
        let body = ErrorResponse {
            error: "Too many requests, please slow down".to_string(),
            field: None,
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    next.run(req).await
}

pub async fn log_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = client_ip(&req);
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        "{} {} {} {:?} {}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed(),
        ip
    );
    response
}

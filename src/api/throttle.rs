//! Per-client HTTP request throttling.
//!
//! Every client address gets one token bucket per endpoint class. A bucket
//! holds a minute's allowance and refills continuously. Responses carry
//! `X-RateLimit-*` headers; rejected requests get 429 `RATE_LIMIT_EXCEEDED`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::error_response;
use crate::clock::Clock;
use crate::config::RequestLimits;
use crate::error::Error;
use crate::ratelimit::TokenBucket;

const WINDOW_SECS: u32 = 60;

/// Refilled buckets are dropped every this many checks.
const PRUNE_EVERY: u64 = 1024;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Which allowance a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    General,
    Upload,
    Send,
}

impl EndpointClass {
    pub fn of(path: &str) -> Self {
        if path.contains("/upload") {
            Self::Upload
        } else if path.contains("/send") || path.contains("/messages") {
            Self::Send
        } else {
            Self::General
        }
    }
}

/// Outcome of one check, in the shape of the response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds when the allowance is full again.
    pub reset_at: i64,
    /// Seconds until the next request would pass. Zero when allowed.
    pub retry_after: u64,
}

type ClientKey = (Option<IpAddr>, EndpointClass);

pub struct RequestThrottle {
    limits: RequestLimits,
    clock: Arc<dyn Clock>,
    buckets: DashMap<ClientKey, Arc<TokenBucket>>,
    checks: AtomicU64,
}

impl RequestThrottle {
    pub fn new(limits: RequestLimits, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            limits,
            clock,
            buckets: DashMap::new(),
            checks: AtomicU64::new(0),
        })
    }

    pub fn limit_for(&self, class: EndpointClass) -> u32 {
        match class {
            EndpointClass::General => self.limits.general_per_minute,
            EndpointClass::Upload => self.limits.upload_per_minute,
            EndpointClass::Send => self.limits.send_per_minute,
        }
    }

    /// Count one request from `client` against `class`.
    pub fn check(&self, client: Option<IpAddr>, class: EndpointClass) -> Verdict {
        let limit = self.limit_for(class);
        let now = self.clock.now();
        let bucket = self
            .buckets
            .entry((client, class))
            .or_insert_with(|| Arc::new(TokenBucket::per_minute(limit, limit)))
            .clone();
        let take = bucket.take(now);

        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }

        Verdict {
            allowed: take.granted,
            limit,
            remaining: take.remaining,
            reset_at: now.timestamp() + ceil_secs(take.full_in) as i64,
            retry_after: ceil_secs(take.wait),
        }
    }

    /// Drop buckets that have refilled completely. A fresh bucket behaves the same.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.available(now) < bucket.capacity());
        let dropped = before.saturating_sub(self.buckets.len());
        if dropped > 0 {
            debug!(dropped, "Pruned idle request buckets");
        }
        dropped
    }

    /// Number of client/class pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

fn set_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(verdict.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(verdict.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(verdict.reset_at));
}

/// Middleware: throttle by client address and endpoint class.
///
/// Needs `ConnectInfo<SocketAddr>` to tell clients apart; without it every
/// request shares one allowance.
pub async fn limit_requests(
    State(throttle): State<Arc<RequestThrottle>>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let class = EndpointClass::of(request.uri().path());
    let verdict = throttle.check(client, class);

    let mut response = if verdict.allowed {
        next.run(request).await
    } else {
        warn!(client = ?client, class = ?class, limit = verdict.limit, "Request rate limit exceeded");
        let err = Error::RateLimited {
            limit: verdict.limit,
            window_secs: WINDOW_SECS,
        };
        let mut response = error_response(&err).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(verdict.retry_after));
        response
    };
    set_headers(response.headers_mut(), &verdict);
    response
}

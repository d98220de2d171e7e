//! Per-address request throttling.
//!
//! Each client address gets its own token bucket sized from the throttle
//! config, or from its entry in the override table. An override with a zero
//! rate lets that address through unthrottled.
//!
//! The address is the socket peer. `x-forwarded-for` is only read when
//! `trust_forwarded` is set, and then only its last hop, which is the one the
//! fronting proxy appended. Buckets that sat idle long enough to refill are
//! swept out, since a fresh bucket would behave the same.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
};
use tracing::{debug, warn};

use crate::config::{ThrottleConfig, ThrottleRule};

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Checks between two idle sweeps
const SWEEP_EVERY: u64 = 1024;

/// Shortest idle time before a bucket may be evicted
const DEFAULT_IDLE_AFTER: Duration = Duration::from_secs(60);

/// One address's bucket and when it was last used.
struct Tracked {
    bucket: Option<Bucket>,
    refill: Duration,
    last_seen: Instant,
}

impl Tracked {
    fn new(rule: ThrottleRule) -> Self {
        let refill = if rule.is_unlimited() {
            Duration::ZERO
        } else {
            let burst = if rule.burst == 0 { rule.rate } else { rule.burst };
            Duration::from_secs_f64(f64::from(burst) / f64::from(rule.rate))
        };
        Self {
            bucket: bucket_for(rule),
            refill,
            last_seen: Instant::now(),
        }
    }

    fn is_idle(&self, now: Instant, idle_after: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > idle_after.max(self.refill)
    }
}

/// Token buckets keyed by client address.
pub struct Throttle {
    config: ThrottleConfig,
    buckets: DashMap<IpAddr, Tracked>,
    clock: DefaultClock,
    idle_after: Duration,
    checks: AtomicU64,
}

impl Throttle {
    /// Throttle using `config` limits
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock: DefaultClock::default(),
            idle_after: DEFAULT_IDLE_AFTER,
            checks: AtomicU64::new(0),
        }
    }

    /// Evict buckets idle for longer than `idle_after` (or their refill time, if longer).
    #[must_use]
    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    /// Admit one request from `ip`, or return how long to wait.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        // Sweep before taking an entry; retain locks every shard.
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle();
        }

        let mut tracked = self.buckets.entry(ip).or_insert_with(|| {
            let rule = self.config.rule_for(&ip.to_string());
            debug!(ip = %ip, rate = rule.rate, burst = rule.burst, "Creating throttle bucket");
            Tracked::new(rule)
        });
        tracked.last_seen = Instant::now();

        match &tracked.bucket {
            None => Ok(()),
            Some(limiter) => limiter
                .check()
                .map_err(|not_until| not_until.wait_time_from(self.clock.now())),
        }
    }

    /// Drop buckets that have been idle long enough to be full again.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, tracked| !tracked.is_idle(now, self.idle_after));
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "Evicted idle throttle buckets");
        }
        evicted
    }

    /// Number of tracked addresses
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Whether `x-forwarded-for` decides the client address
    #[must_use]
    pub const fn trusts_forwarded(&self) -> bool {
        self.config.trust_forwarded
    }
}

fn bucket_for(rule: ThrottleRule) -> Option<Bucket> {
    if rule.is_unlimited() {
        return None;
    }
    let rate = NonZeroU32::new(rule.rate)?;
    let burst = NonZeroU32::new(rule.burst).unwrap_or(rate);
    Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

/// Axum middleware rejecting requests over the address's limit with 429.
pub async fn throttle_middleware(
    State(throttle): State<Arc<Throttle>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request, throttle.trusts_forwarded());

    match throttle.check(ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(ip = %ip, retry_after_secs = retry_secs, "Throttled request");

            let mut response = StatusCode::TOO_MANY_REQUESTS.into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Client address: the socket peer, or the last `x-forwarded-for` hop when trusted.
fn client_ip<B>(request: &axum::http::Request<B>, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        let forwarded = request
            .headers()
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .last()
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::from([127, 0, 0, 1]), |info| info.0.ip())
}

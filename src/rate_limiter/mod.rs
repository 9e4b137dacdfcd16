/*!
 * # Rate Limiting Module
 *
 * In-process token bucket rate limiting for the public API.
 *
 * - One bucket per client key (API key, then user, then IP)
 * - Path prefix policies overriding the default capacity and window
 * - Standard rate limit headers (X-RateLimit-*)
 * - Idle bucket eviction on a background task
 *
 * ## Usage
 *
 * ```ignore
 * let limiter = RateLimiter::new(RateLimitConfig {
 *     requests_per_window: 100,
 *     window_duration: Duration::from_secs(60),
 *     ..Default::default()
 * });
 * let _eviction = limiter.spawn_eviction(Duration::from_secs(60));
 *
 * let app = Router::new()
 *     .route("/", get(handler))
 *     .layer(RateLimitLayer::new(limiter));
 * ```
 */
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::Request,
    http::{Response, StatusCode},
};
use dashmap::DashMap;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Paths never subject to rate limiting.
pub const DEFAULT_EXEMPT_PREFIXES: &[&str] = &["/health", "/api/v1/payments/webhook"];

fn num_to_header_value<T: ToString>(n: T) -> http::HeaderValue {
    http::HeaderValue::from_str(&n.to_string())
        .unwrap_or_else(|_| http::HeaderValue::from_static("0"))
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity; also the number of tokens refilled per window.
    pub requests_per_window: u32,
    pub window_duration: Duration,
    pub enable_headers: bool,
    /// Buckets untouched for this long are dropped by eviction.
    pub idle_ttl: Duration,
    pub path_policies: Vec<PathPolicy>,
    pub exempt_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_duration: Duration::from_secs(60),
            enable_headers: true,
            idle_ttl: Duration::from_secs(600),
            path_policies: Vec::new(),
            exempt_prefixes: DEFAULT_EXEMPT_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl From<&crate::config::AppConfig> for RateLimitConfig {
    fn from(cfg: &crate::config::AppConfig) -> Self {
        let path_policies = match cfg.rate_limit_path_policies.as_deref() {
            Some(raw) => {
                let (policies, warnings) = parse_path_policies(raw);
                for warning in warnings {
                    warn!("{}", warning);
                }
                policies
            }
            None => Vec::new(),
        };
        Self {
            requests_per_window: cfg.rate_limit_requests_per_window,
            window_duration: Duration::from_secs(cfg.rate_limit_window_seconds),
            enable_headers: cfg.rate_limit_enable_headers,
            idle_ttl: Duration::from_secs(cfg.rate_limit_idle_ttl_secs),
            path_policies,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PathPolicy {
    pub prefix: String,
    pub requests_per_window: u32,
    pub window_duration: Duration,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(limit.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(1.0),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    fn until_full(&self) -> Duration {
        Duration::from_secs_f64((self.capacity - self.tokens).max(0.0) / self.refill_per_sec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until a denied caller may retry, or until an allowed caller's bucket is full.
    pub reset_after: Duration,
}

/// Token buckets keyed by client, shared by every clone.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Takes a token for `key` under the policy matching `path`.
    pub fn check(&self, key: &str, path: &str) -> RateLimitResult {
        self.check_at(key, path, Instant::now())
    }

    fn check_at(&self, key: &str, path: &str, now: Instant) -> RateLimitResult {
        let (limit, window, scope) = match self
            .config
            .path_policies
            .iter()
            .find(|p| path.starts_with(p.prefix.as_str()))
        {
            Some(policy) => (
                policy.requests_per_window,
                policy.window_duration,
                policy.prefix.as_str(),
            ),
            None => (
                self.config.requests_per_window,
                self.config.window_duration,
                "*",
            ),
        };

        let mut bucket = self
            .buckets
            .entry(format!("{}|{}", scope, key))
            .or_insert_with(|| TokenBucket::new(limit, window, now));
        let allowed = bucket.try_take(now);

        RateLimitResult {
            allowed,
            limit,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_after: if allowed {
                bucket.until_full()
            } else {
                bucket.until_next_token()
            },
        }
    }

    /// Drops buckets idle for longer than `idle_ttl`. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < ttl);
        let evicted = before.saturating_sub(self.buckets.len());
        gauge!("marketplace_rate_limit_buckets", self.buckets.len() as f64);
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn spawn_eviction(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;
                let evicted = limiter.evict_idle();
                debug!(evicted, "Rate limiter eviction completed");
            }
        })
    }
}

// Key extraction functions
pub fn extract_ip_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(ip) = forwarded_str.split(',').next() {
                return format!("ip:{}", ip.trim());
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return format!("ip:{}", ip_str.trim());
        }
    }

    "ip:unknown".to_string()
}

pub fn extract_user_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|user| format!("user:{}", user.trim()))
}

pub fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| format!("api_key:{}", key.trim()))
}

/// API key first, then user, then client IP.
pub fn extract_key(request: &Request) -> String {
    extract_api_key(request)
        .or_else(|| extract_user_key(request))
        .unwrap_or_else(|| extract_ip_key(request))
}

fn key_type(key: &str) -> &'static str {
    if key.starts_with("api_key:") {
        "api_key"
    } else if key.starts_with("user:") {
        "user"
    } else {
        "ip"
    }
}

fn apply_headers(response: &mut Response<Body>, result: &RateLimitResult) {
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", num_to_header_value(result.limit));
    headers.insert("X-RateLimit-Remaining", num_to_header_value(result.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        num_to_header_value(result.reset_after.as_secs()),
    );
}

fn too_many_requests(result: &RateLimitResult, with_headers: bool) -> Response<Body> {
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "code": "rate_limited",
        "message": "Rate limit exceeded",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        http::header::RETRY_AFTER,
        num_to_header_value(result.reset_after.as_secs().max(1)),
    );
    if with_headers {
        apply_headers(&mut response, result);
    }
    response
}

// Layer implementation for tower
#[derive(Clone)]
pub struct RateLimitLayer {
    rate_limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self { rate_limiter }
    }
}

impl<S> tower::Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rate_limiter: RateLimiter,
}

impl<S> tower::Service<Request> for RateLimitService<S>
where
    S: tower::Service<Request, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let rate_limiter = self.rate_limiter.clone();
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if rate_limiter.is_exempt(&path) {
                return inner.call(request).await;
            }

            let key = extract_key(&request);
            let result = rate_limiter.check(&key, &path);
            let with_headers = rate_limiter.config().enable_headers;

            if !result.allowed {
                warn!(key = %key, path = %path, "Rate limit exceeded");
                counter!(
                    "marketplace_rate_limit_denied_total",
                    1,
                    "key_type" => key_type(&key),
                );
                return Ok(too_many_requests(&result, with_headers));
            }

            let mut response = inner.call(request).await?;
            if with_headers {
                apply_headers(&mut response, &result);
            }
            Ok(response)
        })
    }
}

/// Errors that can occur when parsing rate limit policy strings
#[derive(Debug, Error)]
pub enum PolicyParseError {
    #[error("Invalid policy format for '{spec}': expected 'path:limit:window_secs', got {parts} parts")]
    InvalidFormat { spec: String, parts: usize },

    #[error("Invalid limit value '{value}' in policy '{spec}': {reason}")]
    InvalidLimit {
        spec: String,
        value: String,
        reason: String,
    },

    #[error("Invalid window duration '{value}' in policy '{spec}': {reason}")]
    InvalidWindow {
        spec: String,
        value: String,
        reason: String,
    },

    #[error("Empty policy specification")]
    EmptySpec,

    #[error("Path policy must start with '/': got '{path}'")]
    InvalidPathFormat { path: String },

    #[error("Window duration must be at least 1 second, got {window_secs}")]
    WindowTooSmall { window_secs: u64 },

    #[error("Limit must be at least 1, got {limit}")]
    LimitTooSmall { limit: u32 },
}

/// Parse a path policy specification string.
///
/// Format: "path:limit:window_secs", e.g. "/api/v1/checkout:30:60"
pub fn parse_path_policy(spec: &str) -> Result<PathPolicy, PolicyParseError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(PolicyParseError::EmptySpec);
    }

    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        return Err(PolicyParseError::InvalidFormat {
            spec: spec.to_string(),
            parts: parts.len(),
        });
    }

    let path = parts[0].trim();
    if !path.starts_with('/') {
        return Err(PolicyParseError::InvalidPathFormat {
            path: path.to_string(),
        });
    }

    let limit: u32 = parts[1]
        .trim()
        .parse()
        .map_err(|e| PolicyParseError::InvalidLimit {
            spec: spec.to_string(),
            value: parts[1].to_string(),
            reason: format!("{}", e),
        })?;
    if limit < 1 {
        return Err(PolicyParseError::LimitTooSmall { limit });
    }

    let window_secs: u64 =
        parts[2]
            .trim()
            .parse()
            .map_err(|e| PolicyParseError::InvalidWindow {
                spec: spec.to_string(),
                value: parts[2].to_string(),
                reason: format!("{}", e),
            })?;
    if window_secs < 1 {
        return Err(PolicyParseError::WindowTooSmall { window_secs });
    }

    Ok(PathPolicy {
        prefix: path.to_string(),
        requests_per_window: limit,
        window_duration: Duration::from_secs(window_secs),
    })
}

/// Parses a comma-separated policy list, skipping invalid entries with a warning each.
pub fn parse_path_policies(policies_str: &str) -> (Vec<PathPolicy>, Vec<String>) {
    let mut policies = Vec::new();
    let mut warnings = Vec::new();

    for spec in policies_str
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        match parse_path_policy(spec) {
            Ok(policy) => policies.push(policy),
            Err(e) => warnings.push(format!("Skipping invalid path policy '{}': {}", spec, e)),
        }
    }

    // Longest prefix wins.
    policies.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    (policies, warnings)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_window: limit,
            window_duration: Duration::from_secs(60),
            ..Default::default()
        })
    }

    #[test]
    fn bucket_denies_after_capacity() {
        let limiter = limiter(2);
        let now = Instant::now();
        assert!(limiter.check_at("ip:1", "/api/v1/orders", now).allowed);
        let second = limiter.check_at("ip:1", "/api/v1/orders", now);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let denied = limiter.check_at("ip:1", "/api/v1/orders", now);
        assert!(!denied.allowed);
        assert!((denied.reset_after.as_secs_f64() - 30.0).abs() < 0.01);

        assert!(limiter.check_at("ip:2", "/api/v1/orders", now).allowed);
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = limiter(2);
        let start = Instant::now();
        assert!(limiter.check_at("ip:1", "/", start).allowed);
        assert!(limiter.check_at("ip:1", "/", start).allowed);
        assert!(!limiter.check_at("ip:1", "/", start).allowed);
        assert!(limiter
            .check_at("ip:1", "/", start + Duration::from_secs(31))
            .allowed);
    }

    #[test]
    fn path_policy_overrides_default_and_has_its_own_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_window: 100,
            path_policies: vec![PathPolicy {
                prefix: "/api/v1/checkout".into(),
                requests_per_window: 1,
                window_duration: Duration::from_secs(60),
            }],
            ..Default::default()
        });
        let now = Instant::now();
        assert!(limiter.check_at("ip:1", "/api/v1/checkout/sessions", now).allowed);
        let denied = limiter.check_at("ip:1", "/api/v1/checkout/sessions", now);
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 1);
        assert!(limiter.check_at("ip:1", "/api/v1/orders", now).allowed);
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(RateLimitConfig {
            idle_ttl: Duration::from_secs(10),
            ..Default::default()
        });
        let start = Instant::now();
        limiter.check_at("ip:old", "/", start);
        limiter.check_at("ip:new", "/", start + Duration::from_secs(8));
        assert_eq!(limiter.evict_idle_at(start + Duration::from_secs(12)), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn health_and_webhook_are_exempt() {
        let limiter = limiter(1);
        assert!(limiter.is_exempt("/health"));
        assert!(limiter.is_exempt("/api/v1/payments/webhook"));
        assert!(!limiter.is_exempt("/api/v1/orders"));
    }

    #[test]
    fn key_prefers_api_key_then_user_then_ip() {
        let request = Request::builder()
            .header("x-api-key", "k1")
            .header("x-user-id", "u1")
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_key(&request), "api_key:k1");

        let request = Request::builder()
            .header("x-user-id", "u1")
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_key(&request), "user:u1");

        let request = Request::builder()
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_key(&request), "ip:10.0.0.1");
    }
}

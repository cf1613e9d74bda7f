//! The retryable fetch primitive.
//!
//! [`ConnectionSelector`] is shared by every crawler component. Its two
//! pieces of mutable state are the proxy pool cursor and the sticky
//! local-only flag; once that flag is set it never clears for the rest of
//! the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::classify::{BlockKind, Classifier, ResponseClass};
use super::policy::{CyclePhase, CycleWindows, FallbackPolicy, FetchMode, DEFAULT_MAX_PROXY_RETRIES};
use super::{FetchOutcome, PageBody, PageFetcher, Route};
use crate::http_client::{PageRequest, Transport};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::session::Session;

/// Result of one request on one route.
enum Attempt {
    Page(PageBody),
    Forbidden,
    Blocked(BlockKind),
    Failed(String),
}

impl Attempt {
    fn reason(&self) -> String {
        match self {
            Attempt::Page(_) => "ok".to_string(),
            Attempt::Forbidden => "proxy forbidden".to_string(),
            Attempt::Blocked(kind) => format!("blocked by {}", kind),
            Attempt::Failed(reason) => reason.clone(),
        }
    }
}

pub struct ConnectionSelector {
    transport: Arc<dyn Transport>,
    pool: ProxyPool,
    classifier: Classifier,
    policy: FallbackPolicy,
    timeout: Duration,
    local_only: AtomicBool,
    started: Instant,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionSelector {
    pub fn new(transport: Arc<dyn Transport>, pool: ProxyPool, policy: FallbackPolicy) -> Self {
        Self {
            transport,
            pool,
            classifier: Classifier::default(),
            policy,
            timeout: Duration::from_secs(15),
            local_only: AtomicBool::new(false),
            started: Instant::now(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Per-request timeout. A timeout consumes one retry slot.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Mode to use when the caller has no preference.
    pub fn default_mode(&self) -> FetchMode {
        if self.pool.is_empty() {
            FetchMode::LocalOnly
        } else {
            self.policy.default_mode()
        }
    }

    /// Whether the sticky local-only fallback has fired.
    pub fn is_local_only(&self) -> bool {
        self.local_only.load(Ordering::Acquire)
    }

    fn switch_to_local(&self, reason: &str) {
        if !self.local_only.swap(true, Ordering::AcqRel) {
            warn!(
                "Switching to local connection for the rest of the run: {}",
                reason
            );
            self.metrics.increment("fetch.fallback_to_local", 1);
        }
    }

    async fn attempt(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        session: Option<&Session>,
    ) -> Attempt {
        let route = proxy
            .map(|p| Route::Proxy(p.masked()))
            .unwrap_or(Route::Local);
        let request = PageRequest::direct(url).via(proxy).with_session(session);
        debug!("GET {} via {}", url, route);

        let response = match tokio::time::timeout(self.timeout, self.transport.get(request)).await
        {
            Err(_) => {
                self.metrics.increment("fetch.timeouts", 1);
                return Attempt::Failed(format!("timed out after {:?}", self.timeout));
            }
            Ok(Err(e)) => {
                self.metrics.increment("fetch.transport_errors", 1);
                return Attempt::Failed(e.to_string());
            }
            Ok(Ok(response)) => response,
        };

        match self.classifier.classify(&response.body) {
            ResponseClass::Blocked(kind) => {
                self.metrics.increment("fetch.challenges", 1);
                Attempt::Blocked(kind)
            }
            _ if !response.is_success() => Attempt::Failed(format!("HTTP {}", response.status)),
            ResponseClass::Forbidden => {
                self.metrics.increment("fetch.forbidden", 1);
                Attempt::Forbidden
            }
            ResponseClass::Ok => Attempt::Page(PageBody {
                url: url.to_string(),
                final_url: response.final_url,
                body: response.body,
                route,
            }),
        }
    }

    /// Single direct request. This is always the last transport, so a block is final.
    async fn fetch_local(&self, url: &str, session: Option<&Session>) -> FetchOutcome {
        match self.attempt(url, None, session).await {
            Attempt::Page(page) => FetchOutcome::Page(page),
            Attempt::Blocked(kind) => {
                error!("Blocked by {} on local connection: {}", kind, url);
                FetchOutcome::Blocked {
                    url: url.to_string(),
                    kind,
                    route: Route::Local,
                }
            }
            failed => {
                warn!("Local fetch failed for {}: {}", url, failed.reason());
                FetchOutcome::Failed {
                    url: url.to_string(),
                    reason: failed.reason(),
                }
            }
        }
    }

    async fn fetch_retry_then_local(
        &self,
        url: &str,
        session: Option<&Session>,
        max_proxy_retries: usize,
        fallback_to_local: bool,
    ) -> FetchOutcome {
        if self.is_local_only() {
            return self.fetch_local(url, session).await;
        }

        let tries = max_proxy_retries.min(self.pool.len());
        let mut last_reason = String::from("no proxy attempted");
        for (attempt_no, proxy) in (1..).zip(self.pool.rotation(tries)) {
            match self.attempt(url, Some(proxy), session).await {
                Attempt::Page(page) => return FetchOutcome::Page(page),
                failed => {
                    warn!(
                        "Proxy {} failed for {} (attempt {}/{}): {}",
                        proxy,
                        url,
                        attempt_no,
                        tries,
                        failed.reason()
                    );
                    last_reason = failed.reason();
                }
            }
        }

        if fallback_to_local {
            self.switch_to_local(&format!("{} proxies failed for {}", tries, url));
            self.fetch_local(url, session).await
        } else {
            FetchOutcome::Failed {
                url: url.to_string(),
                reason: format!("{} proxies failed, last error: {}", tries, last_reason),
            }
        }
    }

    async fn fetch_sticky(&self, url: &str, session: Option<&Session>) -> FetchOutcome {
        if self.is_local_only() {
            return self.fetch_local(url, session).await;
        }
        let Some(proxy) = self.pool.first() else {
            return self.fetch_local(url, session).await;
        };
        match self.attempt(url, Some(proxy), session).await {
            Attempt::Page(page) => FetchOutcome::Page(page),
            failed => {
                self.switch_to_local(&format!("proxy {} {}", proxy, failed.reason()));
                self.fetch_local(url, session).await
            }
        }
    }

    async fn fetch_cycling(
        &self,
        url: &str,
        session: Option<&Session>,
        windows: CycleWindows,
    ) -> FetchOutcome {
        if windows.phase_at(self.started.elapsed()) == CyclePhase::Local {
            return self.fetch_local(url, session).await;
        }

        let attempts = windows.proxy_attempts.max(1);
        let mut last_reason = String::from("no proxy attempted");
        for (attempt_no, proxy) in (1..).zip(self.pool.rotation(attempts)) {
            match self.attempt(url, Some(proxy), session).await {
                Attempt::Page(page) => return FetchOutcome::Page(page),
                Attempt::Blocked(kind) if attempt_no == attempts => {
                    error!("Blocked by {} on final proxy attempt: {}", kind, url);
                    return FetchOutcome::Blocked {
                        url: url.to_string(),
                        kind,
                        route: Route::Proxy(proxy.masked()),
                    };
                }
                failed => {
                    warn!(
                        "Proxy {} failed for {} in proxy window: {}",
                        proxy,
                        url,
                        failed.reason()
                    );
                    last_reason = failed.reason();
                }
            }
        }
        FetchOutcome::Failed {
            url: url.to_string(),
            reason: last_reason,
        }
    }
}

#[async_trait]
impl PageFetcher for ConnectionSelector {
    async fn fetch(&self, url: &str, session: Option<&Session>, mode: FetchMode) -> FetchOutcome {
        let mode = if self.pool.is_empty() {
            FetchMode::LocalOnly
        } else {
            mode
        };
        self.metrics.increment("fetch.requests", 1);

        let outcome = match mode {
            FetchMode::LocalOnly => self.fetch_local(url, session).await,
            FetchMode::ProxyPreferred => match &self.policy {
                FallbackPolicy::RetryThenLocal {
                    max_proxy_retries,
                    fallback_to_local,
                } => {
                    self.fetch_retry_then_local(url, session, *max_proxy_retries, *fallback_to_local)
                        .await
                }
                FallbackPolicy::StickySingle => self.fetch_sticky(url, session).await,
                FallbackPolicy::TimeBoxedCycle { .. } => {
                    self.fetch_retry_then_local(url, session, DEFAULT_MAX_PROXY_RETRIES, true)
                        .await
                }
            },
            FetchMode::Cycling => self.fetch_cycling(url, session, self.policy.cycle()).await,
        };

        match &outcome {
            FetchOutcome::Page(page) => {
                self.metrics.increment("fetch.pages", 1);
                if let Route::Proxy(_) = page.route {
                    self.metrics.increment("fetch.via_proxy", 1);
                }
            }
            FetchOutcome::Blocked { .. } => self.metrics.increment("fetch.blocked", 1),
            FetchOutcome::Failed { url, reason } => {
                self.metrics.increment("fetch.failed", 1);
                info!("Giving up on {}: {}", url, reason);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::http_client::{RawResponse, TransportError};
    use crate::metrics::CounterMetrics;

    const URL: &str = "https://www.njuskalo.hr/prodaja-stanova/zagreb";
    const LISTING: &str = "<html><title>Prodaja stanova</title><body>ok</body></html>";
    const FORBIDDEN: &str = r#"{"errorMsg":"insufficient flow"}"#;
    const CAPTCHA: &str = "<html><title>ShieldSquare Captcha</title></html>";

    enum Reply {
        Body(u16, &'static str),
        Error,
        Hang,
    }

    /// Replies per route key ("local" or the proxy URL) and records every call.
    struct FakeTransport {
        replies: HashMap<String, Reply>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(replies: Vec<(&str, Reply)>) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, request: PageRequest<'_>) -> Result<RawResponse, TransportError> {
            let key = request
                .proxy
                .map(|p| p.url().to_string())
                .unwrap_or_else(|| "local".to_string());
            self.calls.lock().unwrap().push(key.clone());
            match self.replies.get(&key) {
                Some(Reply::Body(status, body)) => Ok(RawResponse::new(*status, request.url, *body)),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(TransportError::Connection("hung".into()))
                }
                Some(Reply::Error) | None => Err(TransportError::Connection("refused".into())),
            }
        }
    }

    fn pool(n: usize) -> ProxyPool {
        ProxyPool::new(
            (1..=n)
                .map(|i| ProxyEndpoint::new(format!("http://p{}:80", i)))
                .collect(),
        )
    }

    fn retry_policy(fallback_to_local: bool) -> FallbackPolicy {
        FallbackPolicy::RetryThenLocal {
            max_proxy_retries: 3,
            fallback_to_local,
        }
    }

    #[tokio::test]
    async fn test_three_forbidden_proxies_fall_back_to_local() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Body(200, FORBIDDEN)),
            ("http://p2:80", Reply::Body(200, FORBIDDEN)),
            ("http://p3:80", Reply::Body(200, FORBIDDEN)),
            ("local", Reply::Body(200, LISTING)),
        ]);
        let selector = ConnectionSelector::new(transport.clone(), pool(3), retry_policy(true));

        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        match outcome {
            FetchOutcome::Page(page) => {
                assert_eq!(page.route, Route::Local);
                assert!(page.body.contains("ok"));
            }
            other => panic!("expected page, got {:?}", other),
        }
        assert_eq!(
            transport.calls(),
            vec!["http://p1:80", "http://p2:80", "http://p3:80", "local"]
        );
        assert!(selector.is_local_only());
    }

    #[tokio::test]
    async fn test_local_switch_is_permanent() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, LISTING))]);
        let selector = ConnectionSelector::new(transport.clone(), pool(3), retry_policy(true));

        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;
        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[4], "local");
    }

    #[tokio::test]
    async fn test_no_fallback_gives_up_single_request() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, LISTING))]);
        let selector = ConnectionSelector::new(transport.clone(), pool(3), retry_policy(false));

        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        assert!(matches!(outcome, FetchOutcome::Failed { .. }));
        assert!(!transport.calls().contains(&"local".to_string()));
        assert!(!selector.is_local_only());
    }

    #[tokio::test]
    async fn test_blocked_on_final_local_attempt() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Body(200, CAPTCHA)),
            ("local", Reply::Body(200, CAPTCHA)),
        ]);
        let selector = ConnectionSelector::new(transport, pool(1), retry_policy(true));

        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        match outcome {
            FetchOutcome::Blocked { kind, route, .. } => {
                assert_eq!(kind, BlockKind::ShieldSquare);
                assert_eq!(route, Route::Local);
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_page_with_error_status_still_blocked() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(403, CAPTCHA))]);
        let selector = ConnectionSelector::new(transport, ProxyPool::default(), retry_policy(true));

        let outcome = selector.fetch(URL, None, FetchMode::LocalOnly).await;
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_forbidden_local_is_not_fatal() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, FORBIDDEN))]);
        let selector = ConnectionSelector::new(transport, ProxyPool::default(), retry_policy(true));

        let outcome = selector.fetch(URL, None, FetchMode::LocalOnly).await;
        assert!(matches!(outcome, FetchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_timeout_consumes_retry_slot() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Hang),
            ("http://p2:80", Reply::Body(200, LISTING)),
        ]);
        let metrics = Arc::new(CounterMetrics::new());
        let selector = ConnectionSelector::new(transport.clone(), pool(2), retry_policy(true))
            .with_timeout(Duration::from_millis(50))
            .with_metrics(metrics.clone());

        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        assert!(matches!(outcome, FetchOutcome::Page(_)));
        assert_eq!(transport.calls(), vec!["http://p1:80", "http://p2:80"]);
        assert_eq!(metrics.get("fetch.timeouts"), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Body(502, "bad gateway")),
            ("local", Reply::Body(200, LISTING)),
        ]);
        let selector = ConnectionSelector::new(transport.clone(), pool(1), retry_policy(true));

        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;
        assert!(matches!(outcome, FetchOutcome::Page(_)));
        assert_eq!(transport.calls(), vec!["http://p1:80", "local"]);
    }

    #[tokio::test]
    async fn test_sticky_single_never_reverts() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Error),
            ("local", Reply::Body(200, LISTING)),
        ]);
        let selector =
            ConnectionSelector::new(transport.clone(), pool(2), FallbackPolicy::StickySingle);

        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;
        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        assert_eq!(transport.calls(), vec!["http://p1:80", "local", "local"]);
    }

    #[tokio::test]
    async fn test_sticky_single_keeps_working_proxy() {
        let transport = FakeTransport::new(vec![("http://p1:80", Reply::Body(200, LISTING))]);
        let selector =
            ConnectionSelector::new(transport.clone(), pool(2), FallbackPolicy::StickySingle);

        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;
        selector.fetch(URL, None, FetchMode::ProxyPreferred).await;

        assert_eq!(transport.calls(), vec!["http://p1:80", "http://p1:80"]);
    }

    #[tokio::test]
    async fn test_cycling_starts_local() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, LISTING))]);
        let policy = FallbackPolicy::TimeBoxedCycle {
            local_window_secs: 600,
            proxy_window_secs: 300,
            proxy_attempts: 2,
        };
        let selector = ConnectionSelector::new(transport.clone(), pool(2), policy);

        assert_eq!(selector.default_mode(), FetchMode::Cycling);
        let outcome = selector.fetch(URL, None, FetchMode::Cycling).await;
        assert!(matches!(outcome, FetchOutcome::Page(_)));
        assert_eq!(transport.calls(), vec!["local"]);
    }

    #[tokio::test]
    async fn test_cycling_proxy_window_block_is_final() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Body(200, FORBIDDEN)),
            ("http://p2:80", Reply::Body(200, CAPTCHA)),
        ]);
        let policy = FallbackPolicy::TimeBoxedCycle {
            local_window_secs: 0,
            proxy_window_secs: 300,
            proxy_attempts: 2,
        };
        let selector = ConnectionSelector::new(transport.clone(), pool(2), policy);

        let outcome = selector.fetch(URL, None, FetchMode::Cycling).await;
        assert!(matches!(outcome, FetchOutcome::Blocked { .. }));
        assert_eq!(transport.calls(), vec!["http://p1:80", "http://p2:80"]);
    }

    #[tokio::test]
    async fn test_cycling_local_window_block_is_fatal() {
        let transport = FakeTransport::new(vec![
            ("http://p1:80", Reply::Body(200, LISTING)),
            ("local", Reply::Body(200, CAPTCHA)),
        ]);
        let policy = FallbackPolicy::TimeBoxedCycle {
            local_window_secs: 600,
            proxy_window_secs: 300,
            proxy_attempts: 2,
        };
        let selector = ConnectionSelector::new(transport.clone(), pool(2), policy);

        let outcome = selector.fetch(URL, None, FetchMode::Cycling).await;

        match &outcome {
            FetchOutcome::Blocked { kind, route, .. } => {
                assert_eq!(*kind, BlockKind::ShieldSquare);
                assert_eq!(*route, Route::Local);
            }
            other => panic!("expected block, got {:?}", other),
        }
        assert!(outcome.into_result().unwrap_err().is_fatal_block());
        assert_eq!(transport.calls(), vec!["local"]);
    }

    /// Every proxy refuses; requests to different URLs take different times.
    struct SlowForbiddenTransport {
        tried: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Transport for SlowForbiddenTransport {
        async fn get(&self, request: PageRequest<'_>) -> Result<RawResponse, TransportError> {
            let proxy = request.proxy.map(|p| p.url().to_string()).unwrap_or_default();
            self.tried
                .lock()
                .unwrap()
                .entry(request.url.to_string())
                .or_default()
                .push(proxy);
            let delay = if request.url.ends_with("/1") { 10 } else { 25 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(RawResponse::new(200, request.url, FORBIDDEN))
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_try_distinct_proxies() {
        let transport = Arc::new(SlowForbiddenTransport {
            tried: Mutex::new(HashMap::new()),
        });
        let selector = ConnectionSelector::new(transport.clone(), pool(3), retry_policy(false));

        let (a, b) = tokio::join!(
            selector.fetch("https://a/1", None, FetchMode::ProxyPreferred),
            selector.fetch("https://a/2", None, FetchMode::ProxyPreferred),
        );
        assert!(matches!(a, FetchOutcome::Failed { .. }));
        assert!(matches!(b, FetchOutcome::Failed { .. }));

        let tried = transport.tried.lock().unwrap().clone();
        for url in ["https://a/1", "https://a/2"] {
            let proxies = &tried[url];
            let distinct: std::collections::HashSet<&String> = proxies.iter().collect();
            assert_eq!(proxies.len(), 3, "{} tried {:?}", url, proxies);
            assert_eq!(distinct.len(), 3, "{} tried {:?}", url, proxies);
        }
    }

    #[tokio::test]
    async fn test_empty_pool_goes_local() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, LISTING))]);
        let selector =
            ConnectionSelector::new(transport.clone(), ProxyPool::default(), retry_policy(false));

        assert_eq!(selector.default_mode(), FetchMode::LocalOnly);
        let outcome = selector.fetch(URL, None, FetchMode::ProxyPreferred).await;
        assert!(matches!(outcome, FetchOutcome::Page(_)));
        assert_eq!(transport.calls(), vec!["local"]);
    }

    #[tokio::test]
    async fn test_local_only_mode_skips_proxies() {
        let transport = FakeTransport::new(vec![("local", Reply::Body(200, LISTING))]);
        let selector = ConnectionSelector::new(transport.clone(), pool(3), retry_policy(true));

        selector.fetch(URL, None, FetchMode::LocalOnly).await;
        assert_eq!(transport.calls(), vec!["local"]);
        assert!(!selector.is_local_only());
    }
}

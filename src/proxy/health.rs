//! Proxy health check against a live listing page.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use super::ProxyEndpoint;
use crate::fetch::{BlockKind, Classifier, ResponseClass};
use crate::http_client::{PageRequest, Transport};

pub const DEFAULT_CHECK_URL: &str = "https://www.njuskalo.hr/prodaja-stanova/bjelovar";
pub const DEFAULT_CHECK_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Working,
    Forbidden,
    Blocked(BlockKind),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub proxy: ProxyEndpoint,
    pub outcome: CheckOutcome,
    pub elapsed: Duration,
}

impl CheckResult {
    pub fn is_working(&self) -> bool {
        self.outcome == CheckOutcome::Working
    }
}

/// Fetch `test_url` through every proxy, `concurrency` at a time.
///
/// Results come back in the order of `proxies`.
pub async fn check_proxies(
    transport: Arc<dyn Transport>,
    classifier: &Classifier,
    proxies: &[ProxyEndpoint],
    test_url: &str,
    concurrency: usize,
    timeout: Duration,
) -> Vec<CheckResult> {
    let mut results: Vec<(usize, CheckResult)> = stream::iter(proxies.iter().enumerate())
        .map(|(idx, proxy)| {
            let transport = transport.clone();
            async move {
                let started = Instant::now();
                let request = PageRequest::direct(test_url).via(Some(proxy));
                let outcome = match tokio::time::timeout(timeout, transport.get(request)).await {
                    Err(_) => CheckOutcome::Failed(format!("timed out after {:?}", timeout)),
                    Ok(Err(e)) => CheckOutcome::Failed(e.to_string()),
                    Ok(Ok(response)) => match classifier.classify(&response.body) {
                        ResponseClass::Blocked(kind) => CheckOutcome::Blocked(kind),
                        _ if !response.is_success() => {
                            CheckOutcome::Failed(format!("HTTP {}", response.status))
                        }
                        ResponseClass::Forbidden => CheckOutcome::Forbidden,
                        ResponseClass::Ok => CheckOutcome::Working,
                    },
                };
                debug!("Checked {} -> {:?}", proxy, outcome);
                (
                    idx,
                    CheckResult {
                        proxy: proxy.clone(),
                        outcome,
                        elapsed: started.elapsed(),
                    },
                )
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(idx, _)| *idx);
    let working = results.iter().filter(|(_, r)| r.is_working()).count();
    info!("{}/{} proxies working", working, results.len());
    results.into_iter().map(|(_, r)| r).collect()
}

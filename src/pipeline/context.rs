//! Shared collaborators for one run.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::error::{CrawlError, Result};
use crate::fetch::{Classifier, ConnectionSelector, FetchMode};
use crate::http_client::{browser_headers, resolve_user_agent, HttpClient, Transport};
use crate::metrics::CounterMetrics;
use crate::proxy::{fetch_webshare_proxies, load_proxy_file, ProxyEndpoint, ProxyPool};
use crate::repository::PhoneRepository;
use crate::session::{AuthProvider, CommandAuthProvider, SessionHandle, StaticAuthProvider};
use crate::storage::{today, StorageLayout};

/// Everything a stage needs, built once per process.
pub struct CrawlContext {
    pub settings: Settings,
    pub layout: StorageLayout,
    pub date: NaiveDate,
    /// Direct transport, also used by the phone API.
    pub transport: Arc<dyn Transport>,
    pub selector: Arc<ConnectionSelector>,
    pub checkpoints: Arc<CheckpointStore>,
    pub page_permits: Arc<Semaphore>,
    pub metrics: Arc<CounterMetrics>,
    pub mode: FetchMode,
}

impl CrawlContext {
    /// Build the transport, proxy pool, selector and checkpoint store.
    ///
    /// `mode` overrides the configured routing mode.
    pub async fn build(settings: Settings, mode: Option<FetchMode>) -> Result<Self> {
        let layout = settings.layout();
        settings
            .ensure_directories()
            .map_err(|e| CrawlError::io(&settings.data_dir, e))?;

        let user_agent = resolve_user_agent(settings.user_agent.as_deref());
        let client = HttpClient::builder()
            .user_agent(&user_agent)
            .timeout(settings.request_timeout())
            .default_headers(browser_headers())
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        let transport: Arc<dyn Transport> = Arc::new(client);

        let proxies = load_proxies(&settings).await?;
        let metrics = Arc::new(CounterMetrics::new());
        let selector = ConnectionSelector::new(
            transport.clone(),
            ProxyPool::new(proxies),
            settings.fallback.clone(),
        )
        .with_classifier(Classifier::new(settings.classifier.clone()))
        .with_timeout(settings.request_timeout())
        .with_metrics(metrics.clone());

        let mut mode = mode
            .or(settings.mode)
            .unwrap_or_else(|| selector.default_mode());
        if selector.pool().is_empty() && mode != FetchMode::LocalOnly {
            warn!("No proxies configured, using the local connection only");
            mode = FetchMode::LocalOnly;
        }
        info!(
            "Routing mode {} with {} proxies, user agent {}",
            mode,
            selector.pool().len(),
            user_agent
        );

        let date = today();
        let checkpoints = CheckpointStore::open(layout.checkpoint_dir(), date)?;
        checkpoints.purge_stale(date)?;

        Ok(Self {
            page_permits: Arc::new(Semaphore::new(settings.page_concurrency.max(1))),
            settings,
            layout,
            date,
            transport,
            selector: Arc::new(selector),
            checkpoints: Arc::new(checkpoints),
            metrics,
            mode,
        })
    }

    pub fn phones(&self) -> Result<PhoneRepository> {
        Ok(PhoneRepository::new(&self.layout.phones_db())?)
    }

    /// Session source: the helper command if configured, else static credentials.
    pub fn auth_provider(&self) -> Option<Arc<dyn AuthProvider>> {
        if let Some((program, args)) = &self.settings.auth_command {
            let provider = CommandAuthProvider::new(program.clone(), args.clone())
                .with_timeout(Duration::from_secs(self.settings.auth_timeout_secs));
            return Some(Arc::new(provider));
        }
        StaticAuthProvider::from_config_or_env(
            self.settings.bearer_token.as_deref(),
            &self.settings.cookies,
        )
        .map(|p| Arc::new(p) as Arc<dyn AuthProvider>)
    }

    pub fn session_handle(&self) -> Option<Arc<SessionHandle>> {
        self.auth_provider()
            .map(|provider| Arc::new(SessionHandle::new(provider)))
    }
}

/// Proxies from the configured file plus the Webshare API, de-duplicated.
pub async fn load_proxies(settings: &Settings) -> Result<Vec<ProxyEndpoint>> {
    let mut proxies = Vec::new();
    if let Some(path) = &settings.proxy_file {
        if path.exists() {
            proxies.extend(load_proxy_file(path)?);
        } else {
            warn!("Proxy file {} not found", path.display());
        }
    }

    if let Some(token) = &settings.webshare_token {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| CrawlError::Config(format!("HTTP client: {}", e)))?;
        match fetch_webshare_proxies(&client, token, settings.webshare_page_size).await {
            Ok(list) => proxies.extend(list),
            // A dead API should not stop a run that can go local.
            Err(e) => warn!("{}", e),
        }
    }

    let mut seen = std::collections::HashSet::new();
    proxies.retain(|p| seen.insert(p.url().to_string()));
    Ok(proxies)
}

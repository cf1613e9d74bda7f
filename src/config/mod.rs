//! Configuration management for njuskalo using the prefer crate.
//!
//! The file layer ([`Config`]) is all optional fields; [`Settings`] is what
//! the rest of the crate consumes, with every default resolved.

mod settings;

pub use settings::Settings;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fetch::{ClassifierConfig, FallbackPolicy, FetchMode};
use crate::session::parse_cookie_header;

/// Basename used for config discovery.
pub const CONFIG_NAME: &str = "njuskalo";

/// Proxy sources and routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// `ip:port:user:pass` lines or proxy URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Webshare API token. Proxies from the API are appended to the file list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webshare_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webshare_page_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<FallbackPolicy>,
    /// Routing mode when the command line does not pick one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<FetchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_url: Option<String>,
}

/// Category tree crawl.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Global cap on concurrent page fetches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_after_subcategories: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcategory_cooldown_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antibot_phrases: Option<Vec<String>>,
}

/// Leaf pagination and entry downloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failed_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_delay_min_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_delay_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_refresh_every: Option<usize>,
}

/// Authenticated phone lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_refreshes_per_batch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rescrape_nulls: Option<bool>,
}

/// Where sessions come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Helper program printing `{"token": ..., "cookies": ...}` on stdout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Static bearer token, used when no helper command is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
}

/// Configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Fixed User-Agent; a browser one is picked per run otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    /// Sleep before exiting on a fatal block, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_cooldown_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_workers: Option<usize>,
    pub proxy: ProxyConfig,
    pub crawl: CrawlConfig,
    pub leaves: LeafConfig,
    pub phones: PhoneConfig,
    pub auth: AuthConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<ClassifierConfig>,

    /// Path of the file this config was read from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Discover and load the config file, falling back to defaults.
    pub async fn load() -> Self {
        // prefer finds the file; serde parses it.
        match prefer::load(CONFIG_NAME).await {
            Ok(found) => match found.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Self::default()
                }),
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path, format by extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let mut config: Config = match ext {
            "json" => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory relative paths are resolved against.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are joined to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Copy every configured value onto `settings`.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(secs) = self.block_cooldown_secs {
            settings.block_cooldown_secs = secs;
        }
        if let Some(workers) = self.parse_workers {
            settings.parse_workers = workers;
        }

        let proxy = &self.proxy;
        if let Some(ref file) = proxy.file {
            settings.proxy_file = Some(self.resolve_path(file, base_dir));
        }
        if proxy.webshare_token.is_some() {
            settings.webshare_token = proxy.webshare_token.clone();
        }
        if let Some(size) = proxy.webshare_page_size {
            settings.webshare_page_size = size;
        }
        if let Some(ref policy) = proxy.policy {
            settings.fallback = policy.clone();
        }
        if proxy.mode.is_some() {
            settings.mode = proxy.mode;
        }
        if let Some(ref url) = proxy.check_url {
            settings.check_url = url.clone();
        }

        let crawl = &self.crawl;
        if !crawl.categories.is_empty() {
            settings.categories = crawl.categories.clone();
        }
        if let Some(ref base_url) = crawl.base_url {
            settings.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(n) = crawl.concurrency {
            settings.page_concurrency = n;
        }
        if let Some(n) = crawl.category_concurrency {
            settings.category_concurrency = n;
        }
        if let Some(depth) = crawl.max_depth {
            settings.max_depth = depth;
        }
        if let Some(n) = crawl.sleep_after_subcategories {
            settings.sleep_after_subcategories = n;
        }
        if let Some(secs) = crawl.subcategory_cooldown_secs {
            settings.subcategory_cooldown_secs = secs;
        }
        if let Some(ref phrases) = crawl.antibot_phrases {
            settings.antibot_phrases = phrases.clone();
        }

        let leaves = &self.leaves;
        if let Some(n) = leaves.entry_concurrency {
            settings.entry_concurrency = n;
        }
        if let Some(n) = leaves.page_size {
            settings.page_size = n;
        }
        if leaves.max_failed_pages.is_some() {
            settings.max_failed_pages = leaves.max_failed_pages;
        }
        if let Some(ms) = leaves.page_delay_min_ms {
            settings.page_delay_min_ms = ms;
        }
        if let Some(ms) = leaves.page_delay_max_ms {
            settings.page_delay_max_ms = ms;
        }
        if let Some(n) = leaves.session_refresh_every {
            settings.session_refresh_every = n;
        }

        let phones = &self.phones;
        if let Some(n) = phones.batch_size {
            settings.phone_batch_size = n;
        }
        if let Some(n) = phones.parallelism {
            settings.phone_parallelism = n;
        }
        if let Some(n) = phones.max_refreshes_per_batch {
            settings.max_refreshes_per_batch = n;
        }
        if let Some(flag) = phones.rescrape_nulls {
            settings.rescrape_nulls = flag;
        }

        let auth = &self.auth;
        if let Some(ref command) = auth.command {
            settings.auth_command = Some((command.clone(), auth.args.clone()));
        }
        if let Some(secs) = auth.timeout_secs {
            settings.auth_timeout_secs = secs;
        }
        if auth.bearer_token.is_some() {
            settings.bearer_token = auth.bearer_token.clone();
        }
        if !auth.cookies.is_empty() {
            settings.cookies = auth.cookies.clone();
        }

        if let Some(ref classifier) = self.classifier {
            settings.classifier = classifier.clone();
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (--config flag).
    pub config_path: Option<PathBuf>,
    /// Resolve relative paths from CWD instead of the config file location.
    pub use_cwd: bool,
    /// Data directory override (--target flag).
    pub target: Option<PathBuf>,
}

/// Look for `njuskalo.*` or `config.*` inside a data directory.
fn find_config_next_to_data(data_dir: &Path) -> Option<PathBuf> {
    let extensions = ["toml", "yaml", "yml", "json"];
    let basenames = [CONFIG_NAME, "config"];

    for basename in basenames {
        for ext in extensions {
            let path = data_dir.join(format!("{}.{}", basename, ext));
            if path.exists() {
                return Some(path);
            }
        }
    }
    None
}

async fn load_file_config(options: &LoadOptions) -> Config {
    // Priority 1: Explicit --config flag
    if let Some(ref config_path) = options.config_path {
        return Config::load_from_path(config_path)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("{}", e);
                Config::default()
            });
    }

    // Priority 2: Config inside the target directory
    if let Some(ref target) = options.target {
        if let Some(config_path) = find_config_next_to_data(target) {
            tracing::debug!("Found config in data dir: {}", config_path.display());
            return Config::load_from_path(&config_path)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("{}", e);
                    Config::default()
                });
        }
    }

    // Priority 3: Auto-discover via prefer
    Config::load().await
}

/// Environment variables that take precedence over the config file.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

    if let Some(dir) = var("NJUSKALO_DATA_DIR") {
        tracing::debug!("Using NJUSKALO_DATA_DIR from environment: {}", dir);
        settings.data_dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
    }
    if let Some(file) = var("NJUSKALO_PROXY_FILE") {
        tracing::debug!("Using NJUSKALO_PROXY_FILE from environment: {}", file);
        settings.proxy_file = Some(PathBuf::from(shellexpand::tilde(&file).as_ref()));
    }
    if let Some(token) = var("WEBSHARE_API_TOKEN") {
        tracing::debug!("Using WEBSHARE_API_TOKEN from environment");
        settings.webshare_token = Some(token);
    }
    if let Some(token) = var("NJUSKALO_BEARER_TOKEN") {
        tracing::debug!("Using NJUSKALO_BEARER_TOKEN from environment");
        settings.bearer_token = Some(token);
    }
    if let Some(raw) = var("NJUSKALO_COOKIES") {
        settings.cookies = parse_cookie_header(&raw);
    }
}

/// Load settings and the raw config they came from.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let config = load_file_config(&options).await;
    let mut settings = Settings::default();

    let base_dir = if options.use_cwd {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        config
            .base_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    };

    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());

    // --target wins over both file and environment
    if let Some(ref target) = options.target {
        settings.data_dir = config.resolve_path(&target.to_string_lossy(), &base_dir);
    }

    (settings, config)
}

//! Fallback policies and fetch modes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PROXY_RETRIES: usize = 3;
pub const DEFAULT_LOCAL_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PROXY_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CYCLE_PROXY_ATTEMPTS: usize = 2;

/// How a request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FetchMode {
    /// Never use a proxy.
    LocalOnly,
    /// Proxies first, per the retry-then-local or sticky policy.
    ProxyPreferred,
    /// Alternate local and proxy windows on a fixed schedule.
    Cycling,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchMode::LocalOnly => write!(f, "local-only"),
            FetchMode::ProxyPreferred => write!(f, "proxy-preferred"),
            FetchMode::Cycling => write!(f, "cycling"),
        }
    }
}

/// What to do when a transport fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Try up to `max_proxy_retries` proxies, then optionally go local for good.
    RetryThenLocal {
        #[serde(default = "default_max_proxy_retries")]
        max_proxy_retries: usize,
        #[serde(default = "default_true")]
        fallback_to_local: bool,
    },
    /// Alternate fixed local and proxy windows regardless of outcomes.
    TimeBoxedCycle {
        #[serde(default = "default_local_window_secs")]
        local_window_secs: u64,
        #[serde(default = "default_proxy_window_secs")]
        proxy_window_secs: u64,
        #[serde(default = "default_cycle_proxy_attempts")]
        proxy_attempts: usize,
    },
    /// One proxy until its first failure, then local for the rest of the run.
    StickySingle,
}

fn default_max_proxy_retries() -> usize {
    DEFAULT_MAX_PROXY_RETRIES
}

fn default_true() -> bool {
    true
}

fn default_local_window_secs() -> u64 {
    DEFAULT_LOCAL_WINDOW.as_secs()
}

fn default_proxy_window_secs() -> u64 {
    DEFAULT_PROXY_WINDOW.as_secs()
}

fn default_cycle_proxy_attempts() -> usize {
    DEFAULT_CYCLE_PROXY_ATTEMPTS
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::RetryThenLocal {
            max_proxy_retries: DEFAULT_MAX_PROXY_RETRIES,
            fallback_to_local: true,
        }
    }
}

impl FallbackPolicy {
    /// The mode this policy is meant to be driven with.
    pub fn default_mode(&self) -> FetchMode {
        match self {
            FallbackPolicy::TimeBoxedCycle { .. } => FetchMode::Cycling,
            _ => FetchMode::ProxyPreferred,
        }
    }

    /// Cycle windows and per-window proxy attempts; defaults for other policies.
    pub fn cycle(&self) -> CycleWindows {
        match self {
            FallbackPolicy::TimeBoxedCycle {
                local_window_secs,
                proxy_window_secs,
                proxy_attempts,
            } => CycleWindows {
                local: Duration::from_secs(*local_window_secs),
                proxy: Duration::from_secs(*proxy_window_secs),
                proxy_attempts: (*proxy_attempts).max(1),
            },
            _ => CycleWindows::default(),
        }
    }
}

/// Which transport a cycling schedule currently selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Local,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindows {
    pub local: Duration,
    pub proxy: Duration,
    pub proxy_attempts: usize,
}

impl Default for CycleWindows {
    fn default() -> Self {
        Self {
            local: DEFAULT_LOCAL_WINDOW,
            proxy: DEFAULT_PROXY_WINDOW,
            proxy_attempts: DEFAULT_CYCLE_PROXY_ATTEMPTS,
        }
    }
}

impl CycleWindows {
    /// Phase at `elapsed` since the schedule started; every period opens with the local window.
    pub fn phase_at(&self, elapsed: Duration) -> CyclePhase {
        let period = self.local + self.proxy;
        if period.is_zero() || self.proxy.is_zero() {
            return CyclePhase::Local;
        }
        if self.local.is_zero() {
            return CyclePhase::Proxy;
        }
        let offset = elapsed.as_millis() % period.as_millis();
        if offset < self.local.as_millis() {
            CyclePhase::Local
        } else {
            CyclePhase::Proxy
        }
    }
}

//! Shipped [`AuthProvider`] implementations.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{AuthError, AuthProvider, Session};
use crate::http_client::snippet;

/// Fixed credentials from config or the environment.
#[derive(Debug, Clone)]
pub struct StaticAuthProvider {
    session: Session,
}

impl StaticAuthProvider {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Credentials from config, falling back to `NJUSKALO_BEARER_TOKEN` and
    /// `NJUSKALO_COOKIES` (a `name=value; name=value` string).
    pub fn from_config_or_env(
        token: Option<&str>,
        cookies: &BTreeMap<String, String>,
    ) -> Option<Self> {
        let token = token
            .map(str::to_string)
            .or_else(|| std::env::var("NJUSKALO_BEARER_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())?;
        let cookies = if cookies.is_empty() {
            std::env::var("NJUSKALO_COOKIES")
                .map(|raw| parse_cookie_header(&raw))
                .unwrap_or_default()
        } else {
            cookies.clone()
        };
        Some(Self::new(Session::new(token, cookies)))
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn get_session(&self) -> Result<Session, AuthError> {
        Ok(self.session.clone())
    }
}

/// Parse `a=1; b=2` into a cookie map. Pairs without `=` are ignored.
pub fn parse_cookie_header(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// JSON printed by the helper command.
#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(alias = "bearer_token")]
    token: String,
    #[serde(default)]
    cookies: HelperCookies,
}

/// Either a plain map or a browser cookie export.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HelperCookies {
    Map(BTreeMap<String, String>),
    List(Vec<BrowserCookie>),
}

impl Default for HelperCookies {
    fn default() -> Self {
        HelperCookies::Map(BTreeMap::new())
    }
}

#[derive(Debug, Deserialize)]
struct BrowserCookie {
    name: String,
    #[serde(default)]
    value: String,
}

impl HelperCookies {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            HelperCookies::Map(map) => map,
            HelperCookies::List(list) => list
                .into_iter()
                .filter(|c| !c.name.is_empty() && !c.value.is_empty())
                .map(|c| (c.name, c.value))
                .collect(),
        }
    }
}

/// Parse helper stdout into a session.
pub(crate) fn parse_helper_output(stdout: &str) -> Result<Session, AuthError> {
    let output: HelperOutput = serde_json::from_str(stdout.trim())?;
    if output.token.trim().is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(Session::new(output.token, output.cookies.into_map()))
}

/// Runs an external helper (typically a headless browser script) that
/// prints `{"token": "...", "cookies": {...}}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandAuthProvider {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAuthProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl AuthProvider for CommandAuthProvider {
    async fn get_session(&self) -> Result<Session, AuthError> {
        debug!("Running auth helper: {}", self.display_command());
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| AuthError::Timeout(self.timeout))?
            .map_err(|source| AuthError::Spawn {
                command: self.display_command(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::Provider(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                snippet(&stderr, 300)
            )));
        }

        parse_helper_output(&String::from_utf8_lossy(&output.stdout))
    }
}

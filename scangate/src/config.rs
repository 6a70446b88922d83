use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::gate::GatePolicy;
use crate::orchestrator::PollPolicy;
use crate::token::IdentityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Sast,
    Sca,
}

impl Vendor {
    fn default_client_id(self) -> &'static str {
        match self {
            Vendor::Sast => "resource_owner_client",
            Vendor::Sca => "sca_resource_owner",
        }
    }
}

/// Everything one lifecycle needs to know about its vendor and gate.
///
/// Loaded from YAML; field names follow the keys of the configuration file.
#[derive(Clone, Deserialize)]
pub struct EngineConfig {
    pub vendor: Vendor,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub auth_url: String,
    pub api_url: String,
    /// Base of the vendor web UI, used only for result links.
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub proxy: Option<String>,
    /// SCA account name.
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Skip TLS certificate verification (self-hosted SAST servers).
    #[serde(default)]
    pub insecure_tls: bool,
    /// Team a new SAST project falls back to when the requested team is unknown.
    #[serde(default = "default_team_id")]
    pub default_team_id: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    /// Highest tolerated number of high-severity findings; negative disables gating.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: i64,
    #[serde(default)]
    pub medium_threshold: Option<i64>,
}

fn default_team_id() -> String {
    "1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_max_attempts() -> u32 {
    120
}

fn default_high_threshold() -> i64 {
    -1
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("vendor", &self.vendor)
            .field("username", &self.username)
            .field("auth_url", &self.auth_url)
            .field("api_url", &self.api_url)
            .field("web_url", &self.web_url)
            .field("proxy", &self.proxy)
            .field("tenant", &self.tenant)
            .field("high_threshold", &self.high_threshold)
            .field("medium_threshold", &self.medium_threshold)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(text).context("failed to parse configuration")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.username.trim().is_empty() {
            bail!("username is required");
        }
        if self.password.is_empty() {
            bail!("password is required");
        }
        for (key, value) in [("auth_url", &self.auth_url), ("api_url", &self.api_url)] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                bail!("{key} must be an http(s) URL, got '{value}'");
            }
        }
        if self.vendor == Vendor::Sca && self.tenant.as_deref().is_none_or(str::is_empty) {
            bail!("tenant is required for the sca vendor");
        }
        if self.poll_max_attempts == 0 {
            bail!("poll_max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn identity(&self) -> IdentityConfig {
        IdentityConfig {
            auth_url: self.auth_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| self.vendor.default_client_id().to_string()),
            client_secret: self.client_secret.clone(),
            tenant: self.tenant.clone(),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.poll_max_attempts,
        }
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            high_threshold: self.high_threshold,
            medium_threshold: self.medium_threshold,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// API base without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn web_base(&self) -> &str {
        self.web_url.trim_end_matches('/')
    }
}

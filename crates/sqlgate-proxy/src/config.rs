use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub proxy_auth: ProxyAuthConfig,
    pub tls: TlsConfig,
    pub metrics: MetricsConfig,
    pub audit: AuditConfig,
    /// Extra ParameterStatus entries emitted to the client after
    /// authentication, overlaying whatever the backend reported.
    #[serde(default)]
    pub session_params: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to the backend username when empty.
    #[serde(default)]
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Credentials the client authenticates against. These belong to the proxy
/// and are distinct from the backend credentials above.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
}

fn default_idle_timeout_secs() -> u64 {
    900
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_connections == 0 {
            return Err(anyhow::anyhow!("server.max_connections must be positive"));
        }
        if self.tls.enabled {
            if self.tls.cert_path.is_none() || self.tls.key_path.is_none() {
                return Err(anyhow::anyhow!("tls enabled but cert_path or key_path missing"));
            }
        }
        if self.proxy_auth.username.is_empty() {
            return Err(anyhow::anyhow!("proxy_auth.username must not be empty"));
        }
        if self.backend.username.is_empty() {
            return Err(anyhow::anyhow!("backend.username must not be empty"));
        }
        Ok(())
    }

    pub fn backend_database(&self) -> &str {
        if self.backend.database.is_empty() {
            &self.backend.username
        } else {
            &self.backend.database
        }
    }
}

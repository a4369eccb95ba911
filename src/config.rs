use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Rules engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub analyzer: AnalyzerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum accepted request body in bytes
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite database file, used by the sqlite backend
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token verification endpoint
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Deadline for one `/analyze` call
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_body_bytes: 64 * 1024,
            },
            store: StoreConfig {
                backend: StoreBackend::Sqlite,
                path: "./data/rules.db".to_string(),
            },
            auth: AuthConfig {
                url: "http://127.0.0.1:8081/verify".to_string(),
                timeout_ms: 2000,
            },
            analyzer: AnalyzerConfig { timeout_ms: 3000 },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        if self.server.max_body_bytes == 0 {
            anyhow::bail!("Invalid max_body_bytes: must be > 0");
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.trim().is_empty() {
            anyhow::bail!("Invalid store path: required for the sqlite backend");
        }

        if !self.auth.url.starts_with("http://") && !self.auth.url.starts_with("https://") {
            anyhow::bail!("Invalid auth url: {}", self.auth.url);
        }

        if self.auth.timeout_ms == 0 || self.analyzer.timeout_ms == 0 {
            anyhow::bail!("Invalid timeout: must be > 0");
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth.timeout_ms)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer.timeout_ms)
    }
}

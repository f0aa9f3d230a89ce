use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Exchange base URL, e.g. "https://exchange.example.com/exchange".
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind address; all interfaces when unset.
    #[serde(default)]
    pub bind_address: Option<String>,
    /// Listen port; 0 selects the per-protocol default.
    #[serde(default)]
    pub port: u16,
    /// Client read timeout in seconds (default 300).
    #[serde(default = "default_client_so_timeout")]
    pub client_so_timeout: u64,
    /// Accept connections from non-loopback peers.
    #[serde(default)]
    pub allow_remote: bool,
}

fn default_client_so_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle holding the certificate chain and the PKCS#8 or RSA key.
    pub keystore_file: String,
    /// Only "PEM" is supported.
    #[serde(default = "default_keystore_type")]
    pub keystore_type: String,
    /// Accepted for compatibility; PEM keystores must be unencrypted.
    #[serde(default)]
    pub keystore_pass: Option<String>,
    #[serde(default)]
    pub key_pass: Option<String>,
    /// PEM CA bundle used to verify client certificates.
    #[serde(default)]
    pub truststore_file: Option<String>,
    #[serde(default)]
    pub truststore_type: Option<String>,
    #[serde(default)]
    pub truststore_pass: Option<String>,
    /// Require a client certificate on handshake.
    #[serde(default)]
    pub need_client_auth: bool,
}

fn default_keystore_type() -> String {
    "PEM".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enable_proxy: bool,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    /// Proxy user; a "DOMAIN\\user" form is recognized.
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                url: "http://localhost/exchange".to_string(),
            },
            listen: ListenConfig {
                bind_address: None,
                port: 0,
                client_so_timeout: default_client_so_timeout(),
                allow_remote: false,
            },
            tls: None,
            proxy: None,
        }
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

/// Transport level settings shared by every request of a probe: authentication,
/// TLS, proxying and redirect handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub basic_auth: Option<BasicAuth>,

    pub bearer_token: Option<String>,

    pub bearer_token_file: Option<PathBuf>,

    pub proxy_url: Option<Url>,

    pub follow_redirects: bool,

    /// Offer h2 through ALPN on TLS connections.
    pub enable_http2: bool,

    pub tls_config: TlsConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            basic_auth: None,
            bearer_token: None,
            bearer_token_file: None,
            proxy_url: None,
            follow_redirects: true,
            enable_http2: true,
            tls_config: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,

    pub cert_file: Option<PathBuf>,

    pub key_file: Option<PathBuf>,

    /// Name presented through SNI and used for certificate verification.
    /// Empty means "derive it from the target".
    pub server_name: String,

    pub insecure_skip_verify: bool,

    pub min_version: Option<TlsVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLS12")]
    Tls12,
    #[serde(rename = "TLS13")]
    Tls13,
}

/// Credentials resolved from inline values or files, ready to become an
/// `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl HttpClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        let bearer_sources =
            usize::from(self.bearer_token.is_some()) + usize::from(self.bearer_token_file.is_some());
        if bearer_sources > 1 {
            return Err("at most one of bearer_token & bearer_token_file must be configured".into());
        }
        if let Some(basic) = &self.basic_auth {
            if bearer_sources > 0 {
                return Err(
                    "at most one of basic_auth, bearer_token & bearer_token_file must be configured"
                        .into(),
                );
            }
            if basic.password.is_some() && basic.password_file.is_some() {
                return Err(
                    "at most one of basic_auth password & password_file must be configured".into(),
                );
            }
        }
        if self.tls_config.cert_file.is_some() != self.tls_config.key_file.is_some() {
            return Err("tls_config requires both cert_file and key_file for client auth".into());
        }
        if let Some(proxy) = &self.proxy_url {
            if proxy.scheme() != "http" {
                return Err(format!(
                    "unsupported proxy scheme {:?}, only http proxies are supported",
                    proxy.scheme()
                ));
            }
            if proxy.host_str().is_none() {
                return Err(format!("proxy_url {proxy} has no host"));
            }
        }
        Ok(())
    }

    /// Reads token and password files. Called once per probe so that rotated
    /// secrets are picked up without a reload.
    pub fn credentials(&self) -> std::io::Result<Option<Credentials>> {
        if let Some(basic) = &self.basic_auth {
            let password = match (&basic.password, &basic.password_file) {
                (Some(password), _) => password.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)?.trim().to_string(),
                (None, None) => String::new(),
            };
            return Ok(Some(Credentials::Basic {
                username: basic.username.clone(),
                password,
            }));
        }
        if let Some(token) = &self.bearer_token {
            return Ok(Some(Credentials::Bearer(token.clone())));
        }
        if let Some(path) = &self.bearer_token_file {
            let token = std::fs::read_to_string(path)?;
            return Ok(Some(Credentials::Bearer(token.trim().to_string())));
        }
        Ok(None)
    }
}

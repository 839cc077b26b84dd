use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::client_config::HttpClientConfig;
use super::matchers::{HeaderMatch, RegexRule};
use super::units::{ByteSize, deserialize_duration, serialize_duration};

pub const HTTP_PROBER: &str = "http";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const SUPPORTED_COMPRESSION: &[&str] = &["", "identity", "gzip", "deflate"];

/// The full set of probe modules, keyed by module name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modules: HashMap<String, Module>,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        for (name, module) in &self.modules {
            module
                .validate()
                .map_err(|e| format!("module {name:?}: {e}"))?;
        }
        Ok(())
    }
}

/// A named probe specification.
/// Modules are immutable once loaded; a reload replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// The prober kind. Only `http` is supported.
    pub prober: String,

    /// Overall deadline of a probe, covering resolution and the HTTP exchange.
    /// Defaults to 5 seconds.
    #[serde(
        default = "default_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,

    #[serde(default)]
    pub http: HttpProbeConfig,
}

impl Default for Module {
    fn default() -> Self {
        Self {
            prober: HTTP_PROBER.to_string(),
            timeout: DEFAULT_TIMEOUT,
            http: HttpProbeConfig::default(),
        }
    }
}

impl Module {
    /// The deadline actually applied to a probe; a zero timeout falls back to the default.
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.prober != HTTP_PROBER {
            return Err(format!("unsupported prober {:?}", self.prober));
        }
        self.http.validate()
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Address family preference used when resolving a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    #[serde(rename = "ip4", alias = "ipv4")]
    Ip4,
    #[default]
    #[serde(rename = "ip6", alias = "ipv6")]
    Ip6,
}

impl IpProtocol {
    /// The value exported as `probe_ip_protocol`.
    pub fn as_gauge(&self) -> f64 {
        match self {
            IpProtocol::Ip4 => 4.0,
            IpProtocol::Ip6 => 6.0,
        }
    }

    pub fn matches(&self, ip: &std::net::IpAddr) -> bool {
        match self {
            IpProtocol::Ip4 => ip.is_ipv4(),
            IpProtocol::Ip6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Ip4 => f.write_str("ip4"),
            IpProtocol::Ip6 => f.write_str("ip6"),
        }
    }
}

/// Request shaping and pass/fail policy of an HTTP probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbeConfig {
    /// Accepted status codes. Empty accepts any 2xx.
    pub valid_status_codes: Vec<u16>,

    /// Accepted protocol versions such as `HTTP/1.1` or `HTTP/2.0`. Empty accepts any.
    pub valid_http_versions: Vec<String>,

    pub preferred_ip_protocol: IpProtocol,

    pub ip_protocol_fallback: bool,

    /// Leave name resolution to the proxy when one is configured.
    pub skip_resolve_phase_with_proxy: bool,

    /// Overrides `http_client_config.follow_redirects` when set to true.
    pub no_follow_redirects: Option<bool>,

    pub fail_if_ssl: bool,

    pub fail_if_not_ssl: bool,

    pub method: String,

    pub headers: HashMap<String, String>,

    pub body: String,

    pub body_size_limit: ByteSize,

    /// Expected content encoding of the response, used to decompress the body
    /// before the body rules run.
    pub compression: String,

    pub fail_if_body_matches_regexp: Vec<RegexRule>,

    pub fail_if_body_not_matches_regexp: Vec<RegexRule>,

    pub fail_if_header_matches: Vec<HeaderMatch>,

    pub fail_if_header_not_matches: Vec<HeaderMatch>,

    pub http_client_config: HttpClientConfig,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            valid_status_codes: Vec::new(),
            valid_http_versions: Vec::new(),
            preferred_ip_protocol: IpProtocol::Ip6,
            ip_protocol_fallback: true,
            skip_resolve_phase_with_proxy: false,
            no_follow_redirects: None,
            fail_if_ssl: false,
            fail_if_not_ssl: false,
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: String::new(),
            body_size_limit: ByteSize::default(),
            compression: String::new(),
            fail_if_body_matches_regexp: Vec::new(),
            fail_if_body_not_matches_regexp: Vec::new(),
            fail_if_header_matches: Vec::new(),
            fail_if_header_not_matches: Vec::new(),
            http_client_config: HttpClientConfig::default(),
        }
    }
}

impl HttpProbeConfig {
    pub fn follow_redirects(&self) -> bool {
        !self.no_follow_redirects.unwrap_or(false) && self.http_client_config.follow_redirects
    }

    /// The value of a configured `Host` header, matched case-insensitively.
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, value)| name.eq_ignore_ascii_case("host") && !value.is_empty())
            .map(|(_, value)| value.as_str())
    }

    pub fn validate(&self) -> Result<(), String> {
        if !SUPPORTED_COMPRESSION.contains(&self.compression.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "unsupported compression {:?}, expected one of gzip, deflate, identity",
                self.compression
            ));
        }
        if hyper::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(format!("invalid HTTP method {:?}", self.method));
        }
        for (name, value) in &self.headers {
            hyper::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name {name:?}"))?;
            hyper::header::HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header {name:?}"))?;
        }
        for rule in self
            .fail_if_header_matches
            .iter()
            .chain(&self.fail_if_header_not_matches)
        {
            hyper::header::HeaderName::from_bytes(rule.header.as_bytes())
                .map_err(|_| format!("invalid header name {:?} in header rule", rule.header))?;
        }
        self.http_client_config.validate()
    }
}

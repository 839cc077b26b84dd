pub mod app_config;
pub mod client_config;
pub mod matchers;
pub mod probe_config;
pub mod store;
pub mod units;

pub use client_config::{BasicAuth, Credentials, HttpClientConfig, TlsConfig, TlsVersion};
pub use matchers::{HeaderMatch, RegexRule};
pub use probe_config::{Config, HttpProbeConfig, IpProtocol, Module};
pub use store::{ConfigStore, ReloadHealth};

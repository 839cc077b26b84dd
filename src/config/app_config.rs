use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{
        LookupIpStrategy, NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig,
        ResolverOpts,
    },
};

/// Process level settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub config_file: PathBuf,
    pub dns_hosts: Vec<String>,
    pub mimir_endpoint: Option<String>,
    pub mimir_tenant: Option<String>,
}

/// Load the application configuration from environment variables.
/// `CONFIG_FILE` points at the module definitions (default `config.yml`),
/// `DNS_HOSTS` is an optional comma separated list of nameserver IPs, and
/// `MIMIR_ENDPOINT` / `MIMIR_TENANT` enable pushing results to Mimir.
pub fn load_config() -> AppConfig {
    let _ = dotenvy::dotenv();

    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yml".to_string());

    let dns_hosts = env::var("DNS_HOSTS")
        .map(|hosts| parse_dns_hosts(&hosts))
        .unwrap_or_default();

    AppConfig {
        config_file: PathBuf::from(config_file),
        dns_hosts,
        mimir_endpoint: env::var("MIMIR_ENDPOINT").ok().filter(|s| !s.is_empty()),
        mimir_tenant: env::var("MIMIR_TENANT").ok().filter(|s| !s.is_empty()),
    }
}

fn parse_dns_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Setup a DNS resolver.
/// With no `dns_hosts` the system resolver configuration is used. Otherwise the
/// listed nameservers are queried over TCP. Both variants ask for A and AAAA
/// records together so the protocol fallback can pick from the full answer.
pub fn setup_resolver(
    dns_hosts: &[String],
) -> Result<TokioAsyncResolver, Box<dyn std::error::Error + Send + Sync>> {
    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_secs(2);
    opts.cache_size = 1024;
    opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

    if dns_hosts.is_empty() {
        let (config, _) = trust_dns_resolver::system_conf::read_system_conf()?;
        return Ok(TokioAsyncResolver::tokio(config, opts));
    }

    let mut name_servers = NameServerConfigGroup::new();
    for host in dns_hosts {
        let ip: IpAddr = host.parse()?;
        name_servers.push(NameServerConfig {
            socket_addr: (ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(TokioAsyncResolver::tokio(resolver_config, opts))
}

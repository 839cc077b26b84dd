use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::DateTime;
use hyper::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, HOST, HeaderMap, HeaderName, HeaderValue,
    LAST_MODIFIED, USER_AGENT,
};
use hyper::Method;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info};
use url::Url;

use super::body;
use super::client::ProbeClient;
use super::connector::HyperTransport;
use super::result::{ProbeResult, http_version_name};
use super::tls::{self, TlsSummary};
use super::transport::{InstrumentedTransport, ProbeRequest, ProbeResponse, RoundTrip, authority};
use super::validate::{self, ResponseFacts};
use crate::config::{Credentials, HttpProbeConfig, Module};
use crate::error::ProbeError;
use crate::resolver::{AddressFamily, HostLookup, ProtocolResolver};

fn user_agent() -> String {
    format!("Oxyprobe/{}", env!("CARGO_PKG_VERSION"))
}

/// Runs HTTP probes. One prober can serve any number of concurrent probes;
/// each probe builds its own transports and traces.
pub struct HttpProber {
    resolver: ProtocolResolver,
}

impl HttpProber {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            resolver: ProtocolResolver::new(lookup),
        }
    }

    /// Probes `target` with the module's timeout as deadline.
    pub async fn probe(&self, target: &str, module: &Module) -> ProbeResult {
        let deadline = Instant::now() + module.effective_timeout();
        self.probe_with_deadline(deadline, target, module).await
    }

    /// Probes `target`, giving up at `deadline`. Never fails: problems end up
    /// in the returned result.
    pub async fn probe_with_deadline(
        &self,
        deadline: Instant,
        target: &str,
        module: &Module,
    ) -> ProbeResult {
        let start = Instant::now();
        let mut result = ProbeResult {
            target: target.to_string(),
            ..ProbeResult::default()
        };

        info!(url = %target, "Beginning probe");
        if let Err(e) = self.run(deadline, target, &module.http, &mut result).await {
            error!(url = %target, kind = e.kind().as_str(), err = %e, "Probe failed");
            result.fail(e);
        } else {
            info!(url = %target, duration_seconds = start.elapsed().as_secs_f64(), "Probe succeeded");
        }
        result.total_probe_time = start.elapsed();
        result
    }

    async fn run(
        &self,
        deadline: Instant,
        target: &str,
        http: &HttpProbeConfig,
        result: &mut ProbeResult,
    ) -> Result<(), ProbeError> {
        let client_config = &http.http_client_config;

        let mut url = Url::parse(&normalize_target(target)).map_err(|source| {
            ProbeError::TargetParse {
                target: target.to_string(),
                source,
            }
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::TargetParse {
                target: target.to_string(),
                source: url::ParseError::EmptyHost,
            })?
            .to_string();
        let original_authority = authority(&url);

        let mut family = AddressFamily::Any;
        let skip_resolve = http.skip_resolve_phase_with_proxy && client_config.proxy_url.is_some();
        if !skip_resolve {
            let outcome = self
                .resolver
                .resolve(
                    &host,
                    Some(http.preferred_ip_protocol),
                    http.ip_protocol_fallback,
                    deadline,
                )
                .await;
            result.dns_lookup_time = outcome.elapsed;
            result.durations.resolve = outcome.elapsed;
            let resolved = outcome.result?;
            result.resolved = Some(resolved);
            family = resolved.protocol.into();

            url.set_ip_host(resolved.ip)
                .map_err(|_| ProbeError::TargetParse {
                    target: target.to_string(),
                    source: url::ParseError::SetHostOnCannotBeABaseUrl,
                })?;
        }

        let server_name = tls_server_name(http, &host);
        let tls = tls::client_config(&client_config.tls_config, client_config.enable_http2)?;
        let proxy = client_config.proxy_url.as_ref();
        let lookup = self.resolver.lookup();
        let primary = HyperTransport::new(tls.clone(), Some(server_name), lookup.clone(), family, proxy)?;
        let no_server_name = HyperTransport::new(tls, None, lookup, family, proxy)?;

        let request = build_request(http, url, &original_authority)?;
        let mut client = ProbeClient::new(
            InstrumentedTransport::new(primary, no_server_name),
            http.follow_redirects(),
        );

        let outcome = timeout_at(deadline, exchange(&mut client, request, http, result)).await;

        result.redirects = client.redirects();
        let durations = client.transport().last_durations();
        result.durations = super::trace::PhaseDurations {
            resolve: result.dns_lookup_time + durations.resolve,
            ..durations
        };

        match outcome {
            Ok(exchanged) => exchanged,
            Err(_) => Err(ProbeError::RequestExecution("probe timed out".into())),
        }
    }
}

/// Targets without a scheme are probed over plain HTTP.
fn normalize_target(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

/// The configured server name, else the target host. A `Host` header
/// replaces either.
fn tls_server_name(http: &HttpProbeConfig, target_host: &str) -> String {
    let configured = &http.http_client_config.tls_config.server_name;
    let name = match http.host_header() {
        Some(host) => host,
        None if !configured.is_empty() => configured.as_str(),
        None => target_host,
    };
    strip_port(name)
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (host.ends_with(']') || !host.contains(':')) =>
        {
            host
        }
        _ => authority,
    }
}

fn build_request(
    http: &HttpProbeConfig,
    url: Url,
    original_authority: &str,
) -> Result<ProbeRequest, ProbeError> {
    let method = if http.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(http.method.as_bytes())
            .map_err(|_| ProbeError::TransportConstruction(format!("invalid HTTP method {:?}", http.method)))?
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &http.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProbeError::TransportConstruction(format!("invalid header name {name:?}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| ProbeError::TransportConstruction(format!("invalid value for header {name:?}")))?;
        if header_name == HOST && value.is_empty() {
            continue;
        }
        headers.insert(header_name, header_value);
    }

    if !headers.contains_key(HOST) {
        let value = HeaderValue::from_str(original_authority)
            .map_err(|_| ProbeError::TransportConstruction(format!("invalid host {original_authority:?}")))?;
        headers.insert(HOST, value);
    }
    if !headers.contains_key(USER_AGENT) {
        let value = HeaderValue::from_str(&user_agent())
            .map_err(|e| ProbeError::TransportConstruction(e.to_string()))?;
        headers.insert(USER_AGENT, value);
    }
    if !http.compression.is_empty() && !headers.contains_key(ACCEPT_ENCODING) {
        let value = HeaderValue::from_str(&http.compression)
            .map_err(|_| ProbeError::TransportConstruction(format!("invalid compression {:?}", http.compression)))?;
        headers.insert(ACCEPT_ENCODING, value);
    }
    if !headers.contains_key(AUTHORIZATION) {
        let credentials = http.http_client_config.credentials().map_err(|e| {
            ProbeError::TransportConstruction(format!("error reading credentials: {e}"))
        })?;
        if let Some(value) = credentials.map(authorization_value).transpose()? {
            headers.insert(AUTHORIZATION, value);
        }
    }

    Ok(ProbeRequest {
        method,
        url,
        headers,
        body: Bytes::from(http.body.clone()),
    })
}

fn authorization_value(credentials: Credentials) -> Result<HeaderValue, ProbeError> {
    let value = match credentials {
        Credentials::Basic { username, password } => {
            format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
        }
        Credentials::Bearer(token) => format!("Bearer {token}"),
    };
    HeaderValue::from_str(&value)
        .map_err(|_| ProbeError::TransportConstruction("credentials are not a valid header value".into()))
}

/// Runs the request and evaluates the final response into `result`.
async fn exchange<T: RoundTrip>(
    client: &mut ProbeClient<T>,
    request: ProbeRequest,
    http: &HttpProbeConfig,
    result: &mut ProbeResult,
) -> Result<(), ProbeError> {
    let ProbeResponse {
        status,
        version,
        headers,
        body,
        tls,
    } = client.execute(request).await?;

    info!(status_code = status.as_u16(), "Received HTTP response");
    let version = http_version_name(version);
    result.http_status = Some(status.as_u16());
    result.http_version = Some(version.to_string());
    result.is_ssl = tls.is_some();
    result.tls = tls.as_ref().map(TlsSummary::from_info);
    result.last_modified = last_modified(&headers);

    let raw = body::read_raw(body, http.body_size_limit).await;
    client.transport().mark_response_end();
    let raw = raw?;
    result.content_length = raw.len() as u64;

    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok());
    let decoded = body::decode(raw, encoding, &http.compression)?;
    result.uncompressed_body_length = decoded.len() as u64;

    let verdict = validate::evaluate(
        http,
        &ResponseFacts {
            status: status.as_u16(),
            version,
            headers: &headers,
            body: &decoded,
            is_ssl: result.is_ssl,
        },
    );
    result.failed_due_to_regex = verdict.failed_due_to_regex;
    if !verdict.success {
        return Err(ProbeError::Validation(
            "response did not pass validation".into(),
        ));
    }
    result.success = true;
    Ok(())
}

fn last_modified(headers: &HeaderMap) -> Option<f64> {
    let value = headers.get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|ts| ts.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeaderMatch, IpProtocol, RegexRule};
    use crate::error::ProbeErrorKind;
    use crate::testing::{StaticLookup, serve, serve_tls, silent_server};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn prober() -> (HttpProber, Arc<StaticLookup>) {
        let lookup = Arc::new(StaticLookup::new().with_host("example.org", &["127.0.0.1"]));
        (HttpProber::new(lookup.clone()), lookup)
    }

    fn module(http: HttpProbeConfig) -> Module {
        Module {
            timeout: Duration::from_secs(2),
            http,
            ..Module::default()
        }
    }

    fn ip4() -> HttpProbeConfig {
        HttpProbeConfig {
            preferred_ip_protocol: IpProtocol::Ip4,
            ..HttpProbeConfig::default()
        }
    }

    fn target(addr: SocketAddr, path: &str) -> String {
        format!("example.org:{}{path}", addr.port())
    }

    fn https_target(addr: SocketAddr, path: &str) -> String {
        format!("https://example.org:{}{path}", addr.port())
    }

    fn insecure_ip4() -> HttpProbeConfig {
        let mut http = ip4();
        http.http_client_config.tls_config.insecure_skip_verify = true;
        http
    }

    #[test]
    fn test_normalize_target() {
        assert_eq!(normalize_target("example.org"), "http://example.org");
        assert_eq!(normalize_target("https://example.org"), "https://example.org");
    }

    #[test]
    fn test_tls_server_name_precedence() {
        let mut http = HttpProbeConfig::default();
        assert_eq!(tls_server_name(&http, "example.org"), "example.org");

        http.http_client_config.tls_config.server_name = "sni.example.org".into();
        assert_eq!(tls_server_name(&http, "example.org"), "sni.example.org");

        // a Host header overrides the configured name too
        http.headers.insert("host".into(), "api.example.org:8443".into());
        assert_eq!(tls_server_name(&http, "example.org"), "api.example.org");

        assert_eq!(strip_port("[2001:db8::1]:443"), "[2001:db8::1]");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_request_defaults() {
        let mut http = HttpProbeConfig::default();
        http.compression = "gzip".into();
        http.http_client_config.bearer_token = Some("t0ken".into());
        let url = Url::parse("http://127.0.0.1:8080/").unwrap();

        let request = build_request(&http, url, "example.org:8080").unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.headers[HOST], "example.org:8080");
        assert!(request.headers[USER_AGENT].to_str().unwrap().starts_with("Oxyprobe/"));
        assert_eq!(request.headers[ACCEPT_ENCODING], "gzip");
        assert_eq!(request.headers[AUTHORIZATION], "Bearer t0ken");
    }

    #[test]
    fn test_invalid_request_settings_are_construction_errors() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        let http = HttpProbeConfig {
            method: "GE T".into(),
            ..HttpProbeConfig::default()
        };
        let err = build_request(&http, url.clone(), "example.org").unwrap_err();
        assert_eq!(err.kind(), ProbeErrorKind::TransportConstruction);

        let mut http = HttpProbeConfig::default();
        http.headers.insert("X-Bad".into(), "line\nbreak".into());
        let err = build_request(&http, url, "example.org").unwrap_err();
        assert_eq!(err.kind(), ProbeErrorKind::TransportConstruction);
    }

    #[test]
    fn test_last_modified_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(last_modified(&headers), Some(1_445_412_480.0));
    }

    #[tokio::test]
    async fn test_probe_success_against_local_server() {
        let addr = serve().await;
        let (prober, _) = prober();

        let result = prober.probe(&target(addr, "/health"), &module(ip4())).await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.error, None);
        assert_eq!(result.http_status, Some(200));
        assert_eq!(result.http_version.as_deref(), Some("HTTP/1.1"));
        assert_eq!(result.resolved.unwrap().ip, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(result.content_length, "healthy".len() as u64);
        assert_eq!(result.redirects, 0);
        assert!(!result.is_ssl);
        assert!(result.durations.resolve >= result.dns_lookup_time);
        assert!(result.total_probe_time >= result.durations.processing);
    }

    #[tokio::test]
    async fn test_host_header_reaches_server() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            fail_if_body_not_matches_regexp: vec![RegexRule::new("^host=example.org:").unwrap()],
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/echo-host"), &module(http)).await;
        assert!(result.success, "{:?}", result.error_message);
    }

    #[tokio::test]
    async fn test_fail_if_not_ssl_on_plain_http() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            fail_if_not_ssl: true,
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/health"), &module(http)).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ProbeErrorKind::Validation));
        assert_eq!(result.http_status, Some(200));
    }

    #[tokio::test]
    async fn test_valid_status_codes() {
        let addr = serve().await;
        let (prober, _) = prober();

        let result = prober.probe(&target(addr, "/missing"), &module(ip4())).await;
        assert!(!result.success);
        assert_eq!(result.http_status, Some(404));

        let http = HttpProbeConfig {
            valid_status_codes: vec![404],
            ..ip4()
        };
        let result = prober.probe(&target(addr, "/missing"), &module(http)).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_body_regex_failure_is_flagged() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            fail_if_body_matches_regexp: vec![RegexRule::new("heal").unwrap()],
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/health"), &module(http)).await;
        assert!(!result.success);
        assert!(result.failed_due_to_regex);
    }

    #[tokio::test]
    async fn test_header_rule() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            fail_if_header_not_matches: vec![HeaderMatch {
                header: "X-Probe".into(),
                regexp: RegexRule::new("^ok$").unwrap(),
                allow_missing: false,
            }],
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/health"), &module(http)).await;
        assert!(result.success, "{:?}", result.error_message);
    }

    #[tokio::test]
    async fn test_redirect_is_followed_and_counted() {
        let addr = serve().await;
        let (prober, _) = prober();

        let result = prober.probe(&target(addr, "/old"), &module(ip4())).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.redirects, 1);
        assert_eq!(result.http_status, Some(200));

        let http = HttpProbeConfig {
            no_follow_redirects: Some(true),
            valid_status_codes: vec![302],
            ..ip4()
        };
        let result = prober.probe(&target(addr, "/old"), &module(http)).await;
        assert!(result.success);
        assert_eq!(result.http_status, Some(302));
    }

    #[tokio::test]
    async fn test_session_cookie_survives_redirect() {
        let addr = serve().await;
        let (prober, _) = prober();

        let result = prober.probe(&target(addr, "/login"), &module(ip4())).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.redirects, 1);
        assert_eq!(result.http_status, Some(200));
    }

    #[tokio::test]
    async fn test_https_records_tls_details() {
        let (addr, _) = serve_tls().await;
        let (prober, _) = prober();

        let result = prober.probe(&https_target(addr, "/health"), &module(insecure_ip4())).await;

        assert!(result.success, "{:?}", result.error_message);
        assert!(result.is_ssl);
        assert!(result.durations.tls > Duration::ZERO);
        assert_eq!(result.http_version.as_deref(), Some("HTTP/2.0"));
        let tls = result.tls.unwrap();
        assert!(tls.version.starts_with("TLS 1."), "{}", tls.version);
        assert!(tls.earliest_cert_expiry.unwrap() > chrono::Utc::now().timestamp() as f64);
        assert_eq!(tls.last_chain_expiry, tls.earliest_cert_expiry);
        assert_eq!(tls.fingerprint_sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_https_without_http2_speaks_http1() {
        let (addr, _) = serve_tls().await;
        let (prober, _) = prober();
        let mut http = insecure_ip4();
        http.http_client_config.enable_http2 = false;

        let result = prober.probe(&https_target(addr, "/health"), &module(http)).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.http_version.as_deref(), Some("HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_fail_if_ssl_on_https() {
        let (addr, _) = serve_tls().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            fail_if_ssl: true,
            ..insecure_ip4()
        };

        let result = prober.probe(&https_target(addr, "/health"), &module(http)).await;
        assert!(!result.success);
        assert!(result.is_ssl);
        assert_eq!(result.error, Some(ProbeErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_fails() {
        let (addr, _) = serve_tls().await;
        let (prober, _) = prober();

        let result = prober.probe(&https_target(addr, "/health"), &module(ip4())).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ProbeErrorKind::RequestExecution));
        assert!(result.http_status.is_none());
    }

    #[tokio::test]
    async fn test_host_header_sets_the_sni() {
        let (addr, server_names) = serve_tls().await;
        let (prober, _) = prober();
        let mut http = insecure_ip4();
        http.http_client_config.tls_config.server_name = "sni.example.org".into();

        let result = prober.probe(&https_target(addr, "/health"), &module(http.clone())).await;
        assert!(result.success, "{:?}", result.error_message);

        http.headers.insert("Host".into(), "api.example.org".into());
        let result = prober.probe(&https_target(addr, "/health"), &module(http)).await;
        assert!(result.success, "{:?}", result.error_message);

        assert_eq!(*server_names.lock(), vec!["sni.example.org", "api.example.org"]);
    }

    #[tokio::test]
    async fn test_redirect_to_other_host_uses_its_own_sni() {
        let (addr, server_names) = serve_tls().await;
        let lookup = Arc::new(
            StaticLookup::new()
                .with_host("example.org", &["127.0.0.1"])
                .with_host("other.test", &["127.0.0.1"]),
        );
        let prober = HttpProber::new(lookup);

        let result = prober.probe(&https_target(addr, "/elsewhere"), &module(insecure_ip4())).await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.redirects, 1);
        assert_eq!(*server_names.lock(), vec!["example.org", "other.test"]);
        assert!(result.durations.tls > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_gzip_body_is_decompressed() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            compression: "gzip".into(),
            fail_if_body_not_matches_regexp: vec![RegexRule::new("^a{1000}$").unwrap()],
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/gzip"), &module(http)).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.uncompressed_body_length, 1000);
        assert!(result.content_length < 1000);
    }

    #[tokio::test]
    async fn test_body_size_limit() {
        let addr = serve().await;
        let (prober, _) = prober();
        let http = HttpProbeConfig {
            body_size_limit: crate::config::units::ByteSize(3),
            ..ip4()
        };

        let result = prober.probe(&target(addr, "/health"), &module(http)).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ProbeErrorKind::RequestExecution));
        assert_eq!(result.http_status, Some(200));
    }

    #[tokio::test]
    async fn test_unparsable_target() {
        let (prober, lookup) = prober();
        let result = prober.probe("http://[::1", &module(ip4())).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(ProbeErrorKind::TargetParse));
        assert!(result.resolved.is_none());
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let (prober, _) = prober();
        let result = prober.probe("unknown.test", &module(ip4())).await;

        assert_eq!(result.error, Some(ProbeErrorKind::Resolution));
        assert!(result.http_status.is_none());
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_timing() {
        let addr = silent_server().await;
        let (prober, _) = prober();
        let module = Module {
            timeout: Duration::from_millis(200),
            ..module(ip4())
        };

        let result = prober.probe(&target(addr, "/"), &module).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ProbeErrorKind::RequestExecution));
        assert!(result.error_message.unwrap().contains("timed out"));
        assert!(result.resolved.is_some());
        assert!(result.total_probe_time >= Duration::from_millis(190));
    }
}

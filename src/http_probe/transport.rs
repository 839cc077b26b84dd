use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::{HeaderMap, Method, StatusCode, Version};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use tracing::debug;
use url::Url;

use super::trace::{PhaseDurations, TraceHandle, TraceLog};
use crate::error::ProbeError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming response body as handed out by a [`RoundTrip`].
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// One HTTP request of a probe. `headers` carries the `Host` override, if any.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Connection details of a response that arrived over TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// Negotiated protocol, e.g. `TLS 1.3`.
    pub version: String,
    /// Chain as presented by the peer, leaf first.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

pub struct ProbeResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub tls: Option<TlsInfo>,
}

impl std::fmt::Debug for ProbeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Performs a single request without following redirects.
///
/// Implementations report phase timestamps through the given [`TraceHandle`]
/// as they reach them.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(
        &self,
        request: ProbeRequest,
        trace: TraceHandle,
    ) -> Result<ProbeResponse, ProbeError>;
}

/// Remembers the host of the first request of a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostRoute {
    #[default]
    Unset,
    FirstHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    First,
    SameHost,
    DifferentHost,
}

impl HostRoute {
    pub fn decide(&mut self, host: &str) -> RouteDecision {
        match self {
            HostRoute::Unset => {
                *self = HostRoute::FirstHost(host.to_string());
                RouteDecision::First
            }
            HostRoute::FirstHost(first) if first == host => RouteDecision::SameHost,
            HostRoute::FirstHost(_) => RouteDecision::DifferentHost,
        }
    }
}

/// `host[:port]` of a URL, with the port only when it is explicit.
pub(crate) fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Records one trace per round trip and picks the transport for each request.
///
/// Requests to the host of the first request go through `primary`, which
/// presents the configured TLS server name. Requests that a redirect sent
/// elsewhere go through `no_server_name`, which derives it from the URL.
pub struct InstrumentedTransport<T> {
    primary: T,
    no_server_name: T,
    route: Mutex<HostRoute>,
    traces: TraceLog,
}

impl<T: RoundTrip> InstrumentedTransport<T> {
    pub fn new(primary: T, no_server_name: T) -> Self {
        Self {
            primary,
            no_server_name,
            route: Mutex::new(HostRoute::Unset),
            traces: TraceLog::default(),
        }
    }

    pub async fn round_trip(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let trace = self.traces.begin(request.url.scheme() == "https");
        let host = authority(&request.url);
        let decision = self.route.lock().decide(&host);

        match decision {
            RouteDecision::First | RouteDecision::SameHost => {
                debug!(host = %host, ?decision, "Using primary transport");
                self.primary.round_trip(request, trace).await
            }
            RouteDecision::DifferentHost => {
                debug!(host = %host, "Redirected to another host, not sending the configured server name");
                self.no_server_name.round_trip(request, trace).await
            }
        }
    }

    /// Closes the transfer phase of the newest trace once its body was read.
    pub fn mark_response_end(&self) {
        self.traces.current().end();
    }

    /// Phase durations of the newest round trip; zero before the first one.
    pub fn last_durations(&self) -> PhaseDurations {
        self.traces
            .last()
            .map(|trace| trace.durations())
            .unwrap_or_default()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    fn get(url: &str) -> ProbeRequest {
        ProbeRequest {
            method: Method::GET,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_host_route_state_machine() {
        let mut route = HostRoute::default();
        assert_eq!(route.decide("a.test"), RouteDecision::First);
        assert_eq!(route, HostRoute::FirstHost("a.test".into()));
        assert_eq!(route.decide("a.test"), RouteDecision::SameHost);
        assert_eq!(route.decide("b.test"), RouteDecision::DifferentHost);
        // the first host never moves
        assert_eq!(route.decide("a.test"), RouteDecision::SameHost);
    }

    #[test]
    fn test_authority_keeps_explicit_port() {
        assert_eq!(authority(&Url::parse("http://a.test/x").unwrap()), "a.test");
        assert_eq!(authority(&Url::parse("http://a.test:80/x").unwrap()), "a.test");
        assert_eq!(
            authority(&Url::parse("https://[2001:db8::1]:8443/").unwrap()),
            "[2001:db8::1]:8443"
        );
    }

    #[tokio::test]
    async fn test_redirect_to_other_host_uses_no_server_name_transport() {
        let primary = RecordingTransport::new();
        let fallback = RecordingTransport::new();
        let transport = InstrumentedTransport::new(primary.clone(), fallback.clone());

        transport.round_trip(get("https://a.test/")).await.unwrap();
        transport.round_trip(get("https://b.test/landing")).await.unwrap();

        assert_eq!(primary.urls(), vec!["https://a.test/".to_string()]);
        assert_eq!(fallback.urls(), vec!["https://b.test/landing".to_string()]);
        assert_eq!(transport.trace_count(), 2);
    }

    #[tokio::test]
    async fn test_same_host_stays_on_primary() {
        let primary = RecordingTransport::new();
        let fallback = RecordingTransport::new();
        let transport = InstrumentedTransport::new(primary.clone(), fallback.clone());

        transport.round_trip(get("http://a.test/")).await.unwrap();
        transport.round_trip(get("http://a.test/next")).await.unwrap();

        assert_eq!(primary.urls().len(), 2);
        assert!(fallback.urls().is_empty());
    }

    #[tokio::test]
    async fn test_durations_come_from_the_last_trace() {
        let transport =
            InstrumentedTransport::new(RecordingTransport::new(), RecordingTransport::new());
        assert_eq!(transport.last_durations(), PhaseDurations::default());

        transport.round_trip(get("http://a.test/")).await.unwrap();
        transport.mark_response_end();
        let durations = transport.last_durations();
        // the recording transport connects to an address, so no lookup is timed
        assert_eq!(durations.resolve, std::time::Duration::ZERO);
        assert_eq!(durations.tls, std::time::Duration::ZERO);
    }
}

//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_ENCODING, COOKIE, HOST, HeaderName, HeaderValue, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::error::ProbeError;
use crate::http_probe::trace::TraceHandle;
use crate::http_probe::transport::{BoxError, ProbeRequest, ProbeResponse, ResponseBody, RoundTrip};
use crate::resolver::{AddressFamily, HostLookup};

/// In-memory name table. Unknown names fail like an NXDOMAIN would.
#[derive(Default)]
pub struct StaticLookup {
    hosts: HashMap<String, Vec<IpAddr>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, name: &str, addrs: &[&str]) -> Self {
        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.hosts.insert(name.to_string(), addrs);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostLookup for StaticLookup {
    async fn lookup(&self, host: &str, family: AddressFamily) -> Result<Vec<IpAddr>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let addrs = self
            .hosts
            .get(host)
            .ok_or_else(|| ProbeError::resolution(host, "no such host"))?;
        Ok(addrs
            .iter()
            .copied()
            .filter(|ip| match family {
                AddressFamily::V4 => ip.is_ipv4(),
                AddressFamily::V6 => ip.is_ipv6(),
                AddressFamily::Any => true,
            })
            .collect())
    }
}

pub fn body_from(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed_unsync()
}

#[derive(Default)]
struct Recorded {
    routes: HashMap<String, (u16, Vec<(String, String)>)>,
    requests: Vec<ProbeRequest>,
}

/// A transport that answers from a path table and remembers every request.
/// Clones share their state.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `path` with `status` and `headers`; other paths get `200 ok`.
    pub fn route(self, path: &str, status: u16, headers: &[(&str, &str)]) -> Self {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.inner
            .lock()
            .routes
            .insert(path.to_string(), (status, headers));
        self
    }

    pub fn requests(&self) -> Vec<ProbeRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().iter().map(|r| r.url.to_string()).collect()
    }
}

#[async_trait]
impl RoundTrip for RecordingTransport {
    async fn round_trip(
        &self,
        request: ProbeRequest,
        trace: TraceHandle,
    ) -> Result<ProbeResponse, ProbeError> {
        trace.connect_start();
        trace.connect_done();
        trace.got_conn();

        let (status, header_pairs) = {
            let mut inner = self.inner.lock();
            inner.requests.push(request.clone());
            inner
                .routes
                .get(request.url.path())
                .cloned()
                .unwrap_or((200, Vec::new()))
        };
        let mut headers = HeaderMap::new();
        for (name, value) in header_pairs {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(&value).unwrap(),
            );
        }
        trace.first_byte();

        Ok(ProbeResponse {
            status: StatusCode::from_u16(status).unwrap(),
            version: Version::HTTP_11,
            headers,
            body: body_from("ok"),
            tls: None,
        })
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn handle(request: Request<Incoming>, port: u16) -> Response<Full<Bytes>> {
    let builder = Response::builder();
    let response = match request.uri().path() {
        "/health" => builder.header("X-Probe", "ok").body(Full::from("healthy")),
        "/echo-host" => {
            let host = request
                .headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            builder.body(Full::from(format!("host={host}")))
        }
        "/old" => builder
            .status(StatusCode::FOUND)
            .header(LOCATION, "/health")
            .body(Full::default()),
        "/elsewhere" => builder
            .status(StatusCode::FOUND)
            .header(LOCATION, format!("https://other.test:{port}/health"))
            .body(Full::default()),
        "/login" => builder
            .status(StatusCode::FOUND)
            .header(LOCATION, "/private")
            .header(SET_COOKIE, "session=abc; Path=/")
            .body(Full::default()),
        "/private" => {
            let logged_in = request
                .headers()
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|value| value.split("; ").any(|pair| pair == "session=abc"));
            if logged_in {
                builder.body(Full::from("welcome"))
            } else {
                builder.status(StatusCode::FORBIDDEN).body(Full::default())
            }
        }
        "/gzip" => builder
            .header(CONTENT_ENCODING, "gzip")
            .body(Full::from(gzip(&[b'a'; 1000]))),
        _ => builder
            .status(StatusCode::NOT_FOUND)
            .body(Full::from("not found")),
    };
    response.unwrap()
}

/// Starts an HTTP/1 server on a random local port with a few fixed routes.
pub async fn serve() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |request| async move {
                    Ok::<_, Infallible>(handle(request, port))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// A self-signed certificate for `example.org` and `other.test`, offering h2
/// and http/1.1.
fn tls_acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["example.org".to_string(), "other.test".to_string()])
            .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

/// Starts an HTTPS server with the routes of [`serve`], speaking HTTP/1 or
/// HTTP/2 as negotiated. Also returns the SNI of every accepted handshake.
pub async fn serve_tls() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();
    let acceptor = tls_acceptor();
    let server_names = Arc::new(Mutex::new(Vec::new()));
    let seen = server_names.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                let sni = stream.get_ref().1.server_name().unwrap_or_default().to_string();
                seen.lock().push(sni);
                let service = service_fn(move |request| async move {
                    Ok::<_, Infallible>(handle(request, port))
                });
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, server_names)
}

/// Accepts connections and never answers.
pub async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

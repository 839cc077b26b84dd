use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HOST, HeaderValue, PROXY_AUTHORIZATION};
use hyper::rt::{Read, Write};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::{Position, Url};

use super::tls::version_name;
use super::trace::TraceHandle;
use super::transport::{BoxError, ProbeRequest, ProbeResponse, RoundTrip, TlsInfo};
use crate::error::ProbeError;
use crate::resolver::{AddressFamily, HostLookup, parse_ip_literal};

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// An HTTP proxy the requests are sent through.
#[derive(Debug, Clone)]
struct Proxy {
    host: String,
    port: u16,
    authorization: Option<HeaderValue>,
}

impl Proxy {
    fn from_url(url: &Url) -> Result<Self, ProbeError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::TransportConstruction(format!("proxy {url} has no host")))?
            .to_string();
        let authorization = if url.username().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            let value = format!("Basic {}", STANDARD.encode(credentials));
            Some(HeaderValue::from_str(&value).map_err(|e| {
                ProbeError::TransportConstruction(format!("invalid proxy credentials: {e}"))
            })?)
        };
        Ok(Self {
            host,
            port: url.port_or_known_default().unwrap_or(80),
            authorization,
        })
    }
}

/// Opens a fresh connection per request and performs a single exchange on it.
///
/// Nothing is pooled, so every round trip goes through the connect and TLS
/// phases again.
pub struct HyperTransport {
    tls: Arc<ClientConfig>,
    /// SNI and verification name. `None` derives it from the request URL.
    server_name: Option<String>,
    lookup: Arc<dyn HostLookup>,
    family: AddressFamily,
    proxy: Option<Proxy>,
}

impl HyperTransport {
    pub fn new(
        tls: Arc<ClientConfig>,
        server_name: Option<String>,
        lookup: Arc<dyn HostLookup>,
        family: AddressFamily,
        proxy: Option<&Url>,
    ) -> Result<Self, ProbeError> {
        Ok(Self {
            tls,
            server_name,
            lookup,
            family,
            proxy: proxy.map(Proxy::from_url).transpose()?,
        })
    }

    async fn connect_addr(
        &self,
        host: &str,
        port: u16,
        trace: &TraceHandle,
    ) -> Result<SocketAddr, ProbeError> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(SocketAddr::new(ip, port));
        }

        trace.dns_start();
        let addrs = self.lookup.lookup(host, self.family).await;
        trace.dns_done();

        let ip = addrs
            .map_err(|e| ProbeError::RequestExecution(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| ProbeError::RequestExecution(format!("no address found for {host}")))?;
        Ok(SocketAddr::new(ip, port))
    }

    async fn tunnel(
        &self,
        stream: &mut TcpStream,
        authority: &str,
        proxy: &Proxy,
    ) -> Result<(), ProbeError> {
        let mut connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(auth) = &proxy.authorization {
            connect.push_str("Proxy-Authorization: ");
            connect.push_str(auth.to_str().unwrap_or_default());
            connect.push_str("\r\n");
        }
        connect.push_str("\r\n");
        stream
            .write_all(connect.as_bytes())
            .await
            .map_err(|e| ProbeError::request(&e))?;

        let mut response = Vec::with_capacity(512);
        let mut chunk = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            if response.len() > MAX_CONNECT_RESPONSE {
                return Err(ProbeError::RequestExecution(
                    "proxy CONNECT response too large".into(),
                ));
            }
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| ProbeError::request(&e))?;
            if n == 0 {
                return Err(ProbeError::RequestExecution(
                    "proxy closed the connection during CONNECT".into(),
                ));
            }
            response.extend_from_slice(&chunk[..n]);
        }

        let status_line = String::from_utf8_lossy(&response);
        let status_line = status_line.lines().next().unwrap_or_default();
        let status = status_line.split_whitespace().nth(1).unwrap_or_default();
        if status != "200" {
            return Err(ProbeError::RequestExecution(format!(
                "proxy refused CONNECT to {authority}: {status_line}"
            )));
        }
        debug!(proxy = %proxy.host, tunnel = authority, "Established proxy tunnel");
        Ok(())
    }

    async fn exchange<I>(
        &self,
        io: I,
        request: ProbeRequest,
        h2: bool,
        absolute_form: bool,
        trace: &TraceHandle,
    ) -> Result<hyper::Response<Incoming>, ProbeError>
    where
        I: Read + Write + Unpin + Send + 'static,
    {
        let request = build_request(request, h2, absolute_form, self.proxy.as_ref())?;

        let response = if h2 {
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                    .await
                    .map_err(|e| ProbeError::request(&e))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(err = %e, "HTTP/2 connection closed with error");
                }
            });
            trace.got_conn();
            sender
                .send_request(request)
                .await
                .map_err(|e| ProbeError::request(&e))?
        } else {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProbeError::request(&e))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(err = %e, "HTTP/1 connection closed with error");
                }
            });
            trace.got_conn();
            sender
                .send_request(request)
                .await
                .map_err(|e| ProbeError::request(&e))?
        };
        trace.first_byte();
        Ok(response)
    }
}

/// Turns a probe request into a hyper request for the negotiated protocol.
///
/// HTTP/1 requests use the origin form, or the absolute form when sent to an
/// HTTP proxy. HTTP/2 carries the `Host` value as `:authority`.
fn build_request(
    request: ProbeRequest,
    h2: bool,
    absolute_form: bool,
    proxy: Option<&Proxy>,
) -> Result<hyper::Request<Full<Bytes>>, ProbeError> {
    let ProbeRequest {
        method,
        url,
        mut headers,
        body,
    } = request;

    let authority = match headers.get(HOST) {
        Some(host) => host
            .to_str()
            .map_err(|e| ProbeError::RequestExecution(format!("invalid Host header: {e}")))?
            .to_string(),
        None => url[Position::BeforeHost..Position::AfterPort].to_string(),
    };
    let path_and_query = &url[Position::BeforePath..Position::AfterQuery];

    let uri = if h2 {
        headers.remove(HOST);
        format!("{}://{authority}{path_and_query}", url.scheme())
    } else if absolute_form {
        url[..Position::AfterQuery].to_string()
    } else {
        path_and_query.to_string()
    };

    if !h2 {
        if !headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| ProbeError::RequestExecution(format!("invalid Host header: {e}")))?;
            headers.insert(HOST, value);
        }
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        if absolute_form {
            if let Some(auth) = proxy.and_then(|p| p.authorization.clone()) {
                headers.insert(PROXY_AUTHORIZATION, auth);
            }
        }
    }

    let mut builder = hyper::Request::builder().method(method).uri(uri);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    builder
        .body(Full::new(body))
        .map_err(|e| ProbeError::request(&e))
}

#[async_trait]
impl RoundTrip for HyperTransport {
    async fn round_trip(
        &self,
        request: ProbeRequest,
        trace: TraceHandle,
    ) -> Result<ProbeResponse, ProbeError> {
        let https = match request.url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ProbeError::RequestExecution(format!(
                    "unsupported protocol scheme {other:?}"
                )));
            }
        };
        let host = request
            .url
            .host_str()
            .ok_or_else(|| ProbeError::RequestExecution(format!("no host in {}", request.url)))?
            .to_string();
        let port = request
            .url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });

        let addr = match &self.proxy {
            Some(proxy) => self.connect_addr(&proxy.host, proxy.port, &trace).await?,
            None => self.connect_addr(&host, port, &trace).await?,
        };

        trace.connect_start();
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeError::request(&e))?;
        trace.connect_done();
        debug!(%addr, url = %request.url, "Connected");

        let response = if https {
            if let Some(proxy) = &self.proxy {
                self.tunnel(&mut stream, &format!("{host}:{port}"), proxy)
                    .await?;
            }

            let name = self
                .server_name
                .clone()
                .unwrap_or_else(|| host.trim_start_matches('[').trim_end_matches(']').to_string());
            let server_name = ServerName::try_from(name.clone()).map_err(|e| {
                ProbeError::RequestExecution(format!("invalid TLS server name {name:?}: {e}"))
            })?;

            trace.tls_start();
            let stream = TlsConnector::from(self.tls.clone())
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeError::request(&e))?;
            trace.tls_done();

            let (_, session) = stream.get_ref();
            let tls = TlsInfo {
                version: session
                    .protocol_version()
                    .map(version_name)
                    .unwrap_or_default(),
                peer_certificates: session
                    .peer_certificates()
                    .map(|chain| chain.iter().map(|c| c.clone().into_owned()).collect())
                    .unwrap_or_default(),
            };
            let h2 = session.alpn_protocol() == Some(b"h2".as_slice());

            let response = self
                .exchange(TokioIo::new(stream), request, h2, false, &trace)
                .await?;
            (response, Some(tls))
        } else {
            let absolute_form = self.proxy.is_some();
            let response = self
                .exchange(TokioIo::new(stream), request, false, absolute_form, &trace)
                .await?;
            (response, None)
        };

        let (response, tls) = response;
        let (parts, body) = response.into_parts();
        Ok(ProbeResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: body.map_err(|e| Box::new(e) as BoxError).boxed_unsync(),
            tls,
        })
    }
}

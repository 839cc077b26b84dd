use hyper::header::{AUTHORIZATION, COOKIE, HOST, HeaderMap, HeaderValue, LOCATION, SET_COOKIE};
use hyper::{Method, StatusCode};
use reqwest::cookie::{CookieStore, Jar};
use tracing::{debug, info};
use url::Url;

use super::body;
use super::transport::{InstrumentedTransport, ProbeRequest, ProbeResponse, RoundTrip, authority};
use crate::error::ProbeError;

/// A redirect is refused once this many requests have been made.
pub const MAX_REDIRECTS: usize = 10;

/// Executes a probe request and follows its redirects.
///
/// The client lives for one probe. Counters are updated before every await,
/// so they stay meaningful when the probe deadline cancels an exchange.
/// Cookies set by any hop are kept in a jar that also lives for one probe.
pub struct ProbeClient<T> {
    transport: InstrumentedTransport<T>,
    follow_redirects: bool,
    requests: usize,
    redirects: usize,
    cookies: Jar,
}

impl<T: RoundTrip> ProbeClient<T> {
    pub fn new(transport: InstrumentedTransport<T>, follow_redirects: bool) -> Self {
        Self {
            transport,
            follow_redirects,
            requests: 0,
            redirects: 0,
            cookies: Jar::default(),
        }
    }

    pub fn transport(&self) -> &InstrumentedTransport<T> {
        &self.transport
    }

    /// Number of requests made so far at the last redirect decision.
    pub fn redirects(&self) -> usize {
        self.redirects
    }

    /// Returns the final response. A refused redirect is not an error: the
    /// 3xx response itself becomes the final one.
    pub async fn execute(&mut self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let mut request = request;
        loop {
            let response = self.transport.round_trip(self.with_cookies(&request)).await?;
            self.requests += 1;
            self.store_cookies(&request.url, &response.headers);

            if !response.status.is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
            else {
                return Ok(response);
            };
            let next_url = match request.url.join(&location) {
                Ok(url) => url,
                Err(e) => {
                    info!(location = %location, err = %e, "Not following redirect, invalid Location");
                    return Ok(response);
                }
            };

            self.redirects = self.requests;
            if !self.follow_redirects {
                info!(location = %location, "Not following redirect");
                return Ok(response);
            }
            if self.requests > MAX_REDIRECTS {
                info!(location = %location, redirects = self.requests, "Not following redirect, too many redirects");
                return Ok(response);
            }

            let status = response.status;
            debug!(status = status.as_u16(), location = %location, "Following redirect");
            body::discard(response.body).await;
            let relative = Url::parse(&location).is_err();
            request = redirect_request(request, status, next_url, relative);
        }
    }

    /// The request as sent: its own `Cookie` header followed by the jar's
    /// cookies for the URL. The jar's cookies never flow back into `request`.
    fn with_cookies(&self, request: &ProbeRequest) -> ProbeRequest {
        let mut outgoing = request.clone();
        if let Some(stored) = self.cookies.cookies(&request.url) {
            let value = match outgoing.headers.get(COOKIE) {
                Some(own) => {
                    let mut merged = own.as_bytes().to_vec();
                    merged.extend_from_slice(b"; ");
                    merged.extend_from_slice(stored.as_bytes());
                    HeaderValue::from_bytes(&merged).unwrap_or(stored)
                }
                None => stored,
            };
            outgoing.headers.insert(COOKIE, value);
        }
        outgoing
    }

    fn store_cookies(&self, url: &Url, headers: &HeaderMap) {
        let mut set_cookies = headers.get_all(SET_COOKIE).iter();
        self.cookies.set_cookies(&mut set_cookies, url);
    }
}

fn redirect_request(
    previous: ProbeRequest,
    status: StatusCode,
    url: Url,
    relative: bool,
) -> ProbeRequest {
    let ProbeRequest {
        mut method,
        url: previous_url,
        mut headers,
        mut body,
    } = previous;

    let switch_to_get = match status {
        StatusCode::SEE_OTHER => method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => method == Method::POST,
        _ => false,
    };
    if switch_to_get {
        method = Method::GET;
        body = bytes::Bytes::new();
    }

    if !relative {
        headers.remove(HOST);
    }
    if authority(&url) != authority(&previous_url) {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }

    ProbeRequest {
        method,
        url,
        headers,
        body,
    }
}

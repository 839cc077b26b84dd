use std::time::Duration;

use hyper::Version;

use super::tls::TlsSummary;
use super::trace::PhaseDurations;
use crate::error::{ProbeError, ProbeErrorKind};
use crate::resolver::ResolvedAddr;

/// Everything one probe observed. Produced once at the end of a probe and not
/// modified afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub target: String,
    pub success: bool,
    pub error: Option<ProbeErrorKind>,
    pub error_message: Option<String>,
    pub resolved: Option<ResolvedAddr>,
    pub dns_lookup_time: Duration,
    pub durations: PhaseDurations,
    pub total_probe_time: Duration,
    pub http_status: Option<u16>,
    /// `HTTP/1.1`, `HTTP/2.0`, ...
    pub http_version: Option<String>,
    /// Bytes read off the wire for the final response.
    pub content_length: u64,
    pub uncompressed_body_length: u64,
    pub redirects: usize,
    pub is_ssl: bool,
    pub tls: Option<TlsSummary>,
    /// Unix seconds from the `Last-Modified` header.
    pub last_modified: Option<f64>,
    pub failed_due_to_regex: bool,
}

impl ProbeResult {
    pub(crate) fn fail(&mut self, err: ProbeError) {
        self.success = false;
        self.error = Some(err.kind());
        self.error_message = Some(err.to_string());
    }

    /// Numeric form of the HTTP version, 0 when no response arrived.
    pub fn http_version_number(&self) -> f64 {
        match self.http_version.as_deref() {
            Some("HTTP/0.9") => 0.9,
            Some("HTTP/1.0") => 1.0,
            Some("HTTP/1.1") => 1.1,
            Some("HTTP/2.0") => 2.0,
            Some("HTTP/3.0") => 3.0,
            _ => 0.0,
        }
    }
}

pub fn http_version_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "UNKNOWN",
    }
}

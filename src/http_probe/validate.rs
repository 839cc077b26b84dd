//! Pass/fail predicates applied to the final response of a probe.
//!
//! Every predicate is evaluated on its own and the verdict is their
//! conjunction. Header and body rules only run once the status check passed.

use hyper::HeaderMap;
use tracing::info;

use crate::config::{HeaderMatch, HttpProbeConfig, RegexRule};

/// What the validator gets to see of the final response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseFacts<'a> {
    pub status: u16,
    /// `HTTP/1.1`, `HTTP/2.0`, ...
    pub version: &'a str,
    pub headers: &'a HeaderMap,
    /// Decompressed body.
    pub body: &'a [u8],
    pub is_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub failed_due_to_regex: bool,
}

pub fn evaluate(config: &HttpProbeConfig, facts: &ResponseFacts<'_>) -> Verdict {
    let status = status_ok(facts.status, &config.valid_status_codes);

    let mut regex_ok = true;
    if status {
        regex_ok &= headers_ok(
            facts.headers,
            &config.fail_if_header_matches,
            &config.fail_if_header_not_matches,
        );
        regex_ok &= body_ok(
            facts.body,
            &config.fail_if_body_matches_regexp,
            &config.fail_if_body_not_matches_regexp,
        );
    }

    let checks = [
        status,
        regex_ok,
        version_ok(facts.version, &config.valid_http_versions),
        tls_ok(facts.is_ssl, config.fail_if_ssl, config.fail_if_not_ssl),
    ];

    Verdict {
        success: checks.iter().all(|ok| *ok),
        failed_due_to_regex: !regex_ok,
    }
}

/// Membership in `valid`, or `200..300` when nothing is configured.
pub fn status_ok(status: u16, valid: &[u16]) -> bool {
    let ok = if valid.is_empty() {
        (200..300).contains(&status)
    } else {
        valid.contains(&status)
    };
    if !ok {
        if valid.is_empty() {
            info!(status_code = status, "Invalid HTTP response status code, wanted 2xx");
        } else {
            info!(status_code = status, valid_status_codes = ?valid, "Invalid HTTP response status code");
        }
    }
    ok
}

pub fn version_ok(version: &str, valid: &[String]) -> bool {
    if valid.is_empty() || valid.iter().any(|v| v == version) {
        return true;
    }
    info!(version, valid_http_versions = ?valid, "Invalid HTTP version number");
    false
}

pub fn tls_ok(is_ssl: bool, fail_if_ssl: bool, fail_if_not_ssl: bool) -> bool {
    if fail_if_ssl && is_ssl {
        info!("Final request was over SSL");
        return false;
    }
    if fail_if_not_ssl && !is_ssl {
        info!("Final request was not over SSL");
        return false;
    }
    true
}

pub fn body_ok(body: &[u8], fail_if_matches: &[RegexRule], fail_if_not_matches: &[RegexRule]) -> bool {
    if let Some(rule) = fail_if_matches.iter().find(|rule| rule.is_match_bytes(body)) {
        info!(regexp = rule.as_str(), "Body matched regular expression");
        return false;
    }
    if let Some(rule) = fail_if_not_matches.iter().find(|rule| !rule.is_match_bytes(body)) {
        info!(regexp = rule.as_str(), "Body did not match regular expression");
        return false;
    }
    true
}

pub fn headers_ok(
    headers: &HeaderMap,
    fail_if_matches: &[HeaderMatch],
    fail_if_not_matches: &[HeaderMatch],
) -> bool {
    for rule in fail_if_matches {
        let values = header_values(headers, &rule.header);
        if values.is_empty() {
            if rule.allow_missing {
                continue;
            }
            info!(header = %rule.header, "Missing required header");
            return false;
        }
        if values.iter().any(|value| rule.regexp.is_match(value)) {
            info!(header = %rule.header, regexp = rule.regexp.as_str(), "Header matched regular expression");
            return false;
        }
    }

    for rule in fail_if_not_matches {
        let values = header_values(headers, &rule.header);
        if values.is_empty() {
            if rule.allow_missing {
                continue;
            }
            info!(header = %rule.header, "Missing required header");
            return false;
        }
        if !values.iter().any(|value| rule.regexp.is_match(value)) {
            info!(header = %rule.header, regexp = rule.regexp.as_str(), "Header did not match regular expression");
            return false;
        }
    }
    true
}

/// All values of a header, case-insensitively. Values that are not valid
/// UTF-8 are matched lossily.
fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name.to_ascii_lowercase().as_str())
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect()
}

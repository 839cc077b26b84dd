use super::Registry;
use crate::http_probe::result::ProbeResult;

const PROBE_SUCCESS_METRIC: &str = "probe_success";
const PROBE_DURATION_METRIC: &str = "probe_duration_seconds";
const PROBE_DNS_LOOKUP_TIME_METRIC: &str = "probe_dns_lookup_time_seconds";
const PROBE_IP_PROTOCOL_METRIC: &str = "probe_ip_protocol";
const PROBE_IP_ADDR_HASH_METRIC: &str = "probe_ip_addr_hash";
const PROBE_HTTP_DURATION_METRIC: &str = "probe_http_duration_seconds";
const PROBE_HTTP_CONTENT_LENGTH_METRIC: &str = "probe_http_content_length";
const PROBE_HTTP_UNCOMPRESSED_BODY_LENGTH_METRIC: &str = "probe_http_uncompressed_body_length";
const PROBE_HTTP_REDIRECTS_METRIC: &str = "probe_http_redirects";
const PROBE_HTTP_SSL_METRIC: &str = "probe_http_ssl";
const PROBE_HTTP_STATUS_METRIC: &str = "probe_http_status_code";
const PROBE_HTTP_VERSION_METRIC: &str = "probe_http_version";
const PROBE_FAILED_DUE_TO_REGEX_METRIC: &str = "probe_failed_due_to_regex";
const PROBE_HTTP_LAST_MODIFIED_METRIC: &str = "probe_http_last_modified_timestamp_seconds";
const PROBE_SSL_EARLIEST_EXPIRY_METRIC: &str = "probe_ssl_earliest_cert_expiry";
const PROBE_SSL_LAST_CHAIN_EXPIRY_METRIC: &str = "probe_ssl_last_chain_expiry_timestamp_seconds";
const PROBE_SSL_LAST_CHAIN_INFO_METRIC: &str = "probe_ssl_last_chain_info";
const PROBE_TLS_VERSION_METRIC: &str = "probe_tls_version_info";

fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

impl ProbeResult {
    /// Records the result as gauges on `registry`.
    ///
    /// Phase durations are always present, zero for phases that never ran.
    /// Resolution and TLS gauges only appear when there was something to report.
    pub fn record(&self, registry: &Registry) {
        registry
            .gauge(PROBE_SUCCESS_METRIC, "Displays whether or not the probe was a success")
            .set(flag(self.success));
        registry
            .gauge(PROBE_DURATION_METRIC, "Returns how long the probe took to complete in seconds")
            .set(self.total_probe_time.as_secs_f64());
        registry
            .gauge(
                PROBE_DNS_LOOKUP_TIME_METRIC,
                "Returns the time taken for probe dns lookup in seconds",
            )
            .set(self.dns_lookup_time.as_secs_f64());

        if let Some(resolved) = &self.resolved {
            registry
                .gauge(PROBE_IP_PROTOCOL_METRIC, "Specifies whether probe ip protocol is IP4 or IP6")
                .set(resolved.protocol.as_gauge());
            registry
                .gauge(PROBE_IP_ADDR_HASH_METRIC, "Specifies the hash of IP address. It's useful to detect if the IP address changes.")
                .set(resolved.hash());
        }

        let durations = registry.gauge_vec(
            PROBE_HTTP_DURATION_METRIC,
            "Duration of the final http request by phase",
            "phase",
        );
        for (phase, seconds) in self.durations.phases() {
            durations.with_label_value(phase).set(seconds);
        }

        registry
            .gauge(PROBE_HTTP_CONTENT_LENGTH_METRIC, "Length of http content response")
            .set(self.content_length as f64);
        registry
            .gauge(
                PROBE_HTTP_UNCOMPRESSED_BODY_LENGTH_METRIC,
                "Length of uncompressed response body",
            )
            .set(self.uncompressed_body_length as f64);
        registry
            .gauge(PROBE_HTTP_REDIRECTS_METRIC, "The number of redirects")
            .set(self.redirects as f64);
        registry
            .gauge(PROBE_HTTP_SSL_METRIC, "Indicates if SSL was used for the final redirect")
            .set(flag(self.is_ssl));
        registry
            .gauge(PROBE_HTTP_STATUS_METRIC, "Response HTTP status code")
            .set(self.http_status.map(f64::from).unwrap_or_default());
        registry
            .gauge(PROBE_HTTP_VERSION_METRIC, "Returns the version of HTTP of the probe response")
            .set(self.http_version_number());
        registry
            .gauge(
                PROBE_FAILED_DUE_TO_REGEX_METRIC,
                "Indicates if probe failed due to regex",
            )
            .set(flag(self.failed_due_to_regex));

        if let Some(last_modified) = self.last_modified {
            registry
                .gauge(
                    PROBE_HTTP_LAST_MODIFIED_METRIC,
                    "Returns the Last-Modified HTTP response header in unixtime",
                )
                .set(last_modified);
        }

        if let Some(tls) = &self.tls {
            if let Some(expiry) = tls.earliest_cert_expiry {
                registry
                    .gauge(
                        PROBE_SSL_EARLIEST_EXPIRY_METRIC,
                        "Returns earliest SSL cert expiry in unixtime",
                    )
                    .set(expiry);
            }
            if let Some(expiry) = tls.last_chain_expiry {
                registry
                    .gauge(
                        PROBE_SSL_LAST_CHAIN_EXPIRY_METRIC,
                        "Returns last SSL chain expiry in timestamp",
                    )
                    .set(expiry);
            }
            registry
                .gauge_vec(
                    PROBE_SSL_LAST_CHAIN_INFO_METRIC,
                    "Contains SSL leaf certificate information",
                    "fingerprint_sha256",
                )
                .with_label_value(&tls.fingerprint_sha256)
                .set(1.0);
            registry
                .gauge_vec(
                    PROBE_TLS_VERSION_METRIC,
                    "Returns the TLS version used or NaN when unknown",
                    "version",
                )
                .with_label_value(&tls.version)
                .set(1.0);
        }
    }
}

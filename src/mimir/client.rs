use chrono::Utc;
use reqwest::{
    Client, StatusCode,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, InvalidHeaderValue},
};
use snap::raw::Encoder;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::prompb::{Label, Sample, TimeSeries, WriteRequest};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to encode write request: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to compress write request: {0}")]
    Compress(#[from] snap::Error),

    #[error("invalid tenant id: {0}")]
    Tenant(#[from] InvalidHeaderValue),

    #[error("failed to reach Mimir: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mimir rejected the push: {status} - {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Sends Prometheus metrics to a Mimir remote write endpoint.
///
/// # Arguments
///
/// * `mimir_endpoint` - The base URL of your Mimir instance (e.g., "http://localhost:9009").
/// * `tenant_id` - An optional tenant ID string for multi-tenant Mimir setups.
/// * `metrics` - A vector of `TimeSeries` to send.
pub async fn send_to_mimir(
    mimir_endpoint: &str,
    tenant_id: Option<&str>,
    metrics: Vec<TimeSeries>,
) -> Result<(), PushError> {
    if metrics.is_empty() {
        warn!("No metrics to send.");
        return Ok(());
    }

    let count = metrics.len();
    let write_request = WriteRequest {
        timeseries: metrics,
    };

    let mut buf = Vec::new();
    prost::Message::encode(&write_request, &mut buf)?;

    let mut encoder = Encoder::new();
    let compressed_data = encoder.compress_vec(&buf)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("snappy"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-protobuf"),
    );
    headers.insert(
        "X-Prometheus-Remote-Write-Version",
        HeaderValue::from_static("0.1.0"),
    );
    if let Some(id) = tenant_id {
        headers.insert("X-Scope-OrgID", HeaderValue::from_str(id)?);
    }

    let client = Client::new();
    let response = client
        .post(format!("{}/api/v1/push", mimir_endpoint.trim_end_matches('/')))
        .headers(headers)
        .body(compressed_data)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(%status, body = %body, "Failed to push to Mimir");
        return Err(PushError::Rejected { status, body });
    }
    debug!(series = count, "Pushed metrics to Mimir");
    Ok(())
}

/// Creates a `TimeSeries` metric with the given metric name, labels, value, and optional timestamp.
/// Labels are sorted by name as remote write requires.
/// # Arguments
/// * `metric_name` - The name of the metric (e.g., "probe_success").
/// * `labels` - A slice of tuples representing labels for the metric (e.g., &[("phase", "connect")]).
/// * `value` - The value of the metric.
/// * `timestamp_ms` - An optional timestamp in milliseconds. If not provided, the current time will be used.
pub fn create_time_series(
    metric_name: &str,
    labels: &[(&str, &str)],
    value: f64,
    timestamp_ms: Option<i64>,
) -> TimeSeries {
    let mut all_labels = Vec::with_capacity(labels.len() + 1);
    all_labels.push(Label {
        name: "__name__".to_string(),
        value: metric_name.to_string(),
    });
    for (name, val) in labels {
        all_labels.push(Label {
            name: name.to_string(),
            value: val.to_string(),
        });
    }
    all_labels.sort_by(|a, b| a.name.cmp(&b.name));

    let sample = Sample {
        value,
        timestamp: timestamp_ms.unwrap_or_else(|| Utc::now().timestamp_millis()),
    };

    TimeSeries {
        labels: all_labels,
        samples: vec![sample],
    }
}

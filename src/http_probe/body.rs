use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::BodyExt;

use super::transport::ResponseBody;
use crate::config::units::ByteSize;
use crate::error::ProbeError;

/// Reads a response body to the end, frame by frame.
///
/// The limit applies to the bytes as they arrive on the wire, before any
/// decompression.
pub async fn read_raw(mut body: ResponseBody, limit: ByteSize) -> Result<Vec<u8>, ProbeError> {
    let mut raw = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProbeError::request(&*e))?;
        if let Ok(data) = frame.into_data() {
            raw.extend_from_slice(&data);
            if !limit.is_unlimited() && raw.len() as u64 > limit.bytes() {
                return Err(ProbeError::RequestExecution(format!(
                    "response body exceeds the size limit of {limit}"
                )));
            }
        }
    }
    Ok(raw)
}

/// Drains a body that nobody is going to look at, e.g. of a followed redirect.
pub async fn discard(mut body: ResponseBody) {
    while let Some(Ok(_)) = body.frame().await {}
}

/// Decompresses `raw` when the response was encoded with the configured
/// compression. Any other combination leaves the bytes untouched.
pub fn decode(
    raw: Vec<u8>,
    content_encoding: Option<&str>,
    compression: &str,
) -> Result<Vec<u8>, ProbeError> {
    let compression = compression.to_ascii_lowercase();
    let encoded = content_encoding
        .map(|encoding| encoding.trim().eq_ignore_ascii_case(&compression))
        .unwrap_or(false);
    if !encoded {
        return Ok(raw);
    }

    let mut decoded = Vec::new();
    let result = match compression.as_str() {
        "gzip" => GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded),
        "deflate" => ZlibDecoder::new(raw.as_slice()).read_to_end(&mut decoded),
        _ => return Ok(raw),
    };
    result.map_err(|e| {
        ProbeError::RequestExecution(format!("failed to decompress {compression} body: {e}"))
    })?;
    Ok(decoded)
}

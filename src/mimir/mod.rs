use crate::metrics::Sample;

pub mod client;
pub mod prompb;

const INSTANCE_LABEL: &str = "instance";
const JOB_LABEL: &str = "job";
const MODULE_LABEL: &str = "module";
const TARGET_LABEL: &str = "target";

const PROBE_JOB: &str = "oxyprobe";

/// Converts gathered samples into remote write series.
/// Every series carries `instance`, `job`, `module` and `target` labels, plus
/// the label of its gauge vector, if any. All series share one timestamp.
/// ## Arguments:
/// - `samples`: a registry snapshot, usually from `Registry::gather`.
/// - `target`: the probed target, used for both `instance` and `target`.
/// - `module`: the name of the module the probe ran with.
pub fn create_probe_metrics(samples: &[Sample], target: &str, module: &str) -> Vec<prompb::TimeSeries> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    samples
        .iter()
        .map(|sample| {
            let mut labels: Vec<(&str, &str)> = vec![
                (INSTANCE_LABEL, target),
                (JOB_LABEL, PROBE_JOB),
                (MODULE_LABEL, module),
                (TARGET_LABEL, target),
            ];
            if let Some((name, value)) = &sample.label {
                labels.push((name.as_str(), value.as_str()));
            }
            client::create_time_series(&sample.name, &labels, sample.value, Some(timestamp))
        })
        .collect()
}

//! A small gauge registry. Probes and the config store record observations here;
//! exporters read them back through [`Registry::gather`].

pub mod probe;

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// One gathered observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    /// At most one label pair; gauge vectors carry a single dimension.
    pub label: Option<(String, String)>,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Gauge {
    bits: Arc<AtomicU64>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// A gauge family partitioned by one label, e.g. `phase`.
#[derive(Debug, Clone)]
pub struct GaugeVec {
    label: String,
    children: Arc<RwLock<BTreeMap<String, Gauge>>>,
}

impl GaugeVec {
    pub fn with_label_value(&self, value: &str) -> Gauge {
        if let Some(gauge) = self.children.read().get(value) {
            return gauge.clone();
        }
        self.children
            .write()
            .entry(value.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone)]
enum Family {
    Scalar(Gauge),
    Vector(GaugeVec),
}

#[derive(Debug, Clone)]
struct Entry {
    help: String,
    family: Family,
}

/// Registration is idempotent: asking twice for the same name returns the same gauge.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge(&self, name: &str, help: &str) -> Gauge {
        let mut entries = self.entries.write();
        let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
            help: help.to_string(),
            family: Family::Scalar(Gauge::default()),
        });
        if let Family::Scalar(gauge) = &entry.family {
            return gauge.clone();
        }
        tracing::warn!(metric = name, "Metric already registered as a vector, replacing it");
        let gauge = Gauge::default();
        entry.family = Family::Scalar(gauge.clone());
        gauge
    }

    pub fn gauge_vec(&self, name: &str, help: &str, label: &str) -> GaugeVec {
        let mut entries = self.entries.write();
        let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
            help: help.to_string(),
            family: Family::Vector(GaugeVec {
                label: label.to_string(),
                children: Arc::default(),
            }),
        });
        if let Family::Vector(vec) = &entry.family {
            if vec.label == label {
                return vec.clone();
            }
        }
        tracing::warn!(metric = name, label, "Metric already registered with another shape, replacing it");
        let vec = GaugeVec {
            label: label.to_string(),
            children: Arc::default(),
        };
        entry.family = Family::Vector(vec.clone());
        vec
    }

    /// Snapshot of every observation, ordered by metric name then label value.
    pub fn gather(&self) -> Vec<Sample> {
        let entries = self.entries.read();
        let mut samples = Vec::new();
        for (name, entry) in entries.iter() {
            match &entry.family {
                Family::Scalar(gauge) => samples.push(Sample {
                    name: name.clone(),
                    help: entry.help.clone(),
                    label: None,
                    value: gauge.get(),
                }),
                Family::Vector(vec) => {
                    for (value, gauge) in vec.children.read().iter() {
                        samples.push(Sample {
                            name: name.clone(),
                            help: entry.help.clone(),
                            label: Some((vec.label.clone(), value.clone())),
                            value: gauge.get(),
                        });
                    }
                }
            }
        }
        samples
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        let mut last_name: Option<String> = None;
        for sample in self.gather() {
            if last_name.as_deref() != Some(sample.name.as_str()) {
                let _ = writeln!(out, "# HELP {} {}", sample.name, sample.help);
                let _ = writeln!(out, "# TYPE {} gauge", sample.name);
                last_name = Some(sample.name.clone());
            }
            match &sample.label {
                Some((label, value)) => {
                    let _ = writeln!(
                        out,
                        "{}{{{}=\"{}\"}} {}",
                        sample.name,
                        label,
                        escape_label_value(value),
                        sample.value
                    );
                }
                None => {
                    let _ = writeln!(out, "{} {}", sample.name, sample.value);
                }
            }
        }
        out
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use super::probe_config::{Config, Module};
use crate::error::ProbeError;
use crate::metrics::{Gauge, Registry};

const RELOAD_SUCCESS_METRIC: &str = "oxyprobe_config_last_reload_successful";
const RELOAD_TIMESTAMP_METRIC: &str = "oxyprobe_config_last_reload_success_timestamp_seconds";

/// Outcome of the most recent reload, as exported through the store's gauges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReloadHealth {
    pub last_reload_successful: bool,
    /// Unix seconds of the last successful reload, 0 if there never was one.
    pub last_success_timestamp_seconds: f64,
}

/// Holds the current module set.
///
/// Readers take a shared lock and get an `Arc` to an immutable module, so they
/// never observe a half applied reload. Reloads are serialised and replace the
/// whole map; nothing is merged. Construct it once and share it by `Arc`.
pub struct ConfigStore {
    modules: RwLock<Arc<HashMap<String, Arc<Module>>>>,
    writer: Mutex<()>,
    registry: Registry,
    reload_success: Gauge,
    reload_timestamp: Gauge,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Registers the reload gauges on an existing registry.
    pub fn with_registry(registry: Registry) -> Self {
        let reload_success = registry.gauge(
            RELOAD_SUCCESS_METRIC,
            "Oxyprobe config loaded successfully.",
        );
        let reload_timestamp = registry.gauge(
            RELOAD_TIMESTAMP_METRIC,
            "Timestamp of the last successful configuration reload.",
        );
        Self {
            modules: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            registry,
            reload_success,
            reload_timestamp,
        }
    }

    /// Parses and validates `source`, then swaps it in as the new module set.
    /// On error the current modules stay in place.
    pub fn reload(&self, source: &[u8]) -> Result<(), ProbeError> {
        let _writer = self.writer.lock();

        match parse_config(source) {
            Ok(config) => {
                let modules: HashMap<String, Arc<Module>> = config
                    .modules
                    .into_iter()
                    .map(|(name, module)| (name, Arc::new(module)))
                    .collect();
                let count = modules.len();
                *self.modules.write() = Arc::new(modules);

                self.reload_success.set(1.0);
                self.reload_timestamp
                    .set(Utc::now().timestamp_millis() as f64 / 1000.0);
                info!(modules = count, "Loaded config file");
                Ok(())
            }
            Err(e) => {
                self.reload_success.set(0.0);
                error!(err = %e, "Error reloading config");
                Err(e)
            }
        }
    }

    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<(), ProbeError> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => self.reload(&bytes),
            Err(e) => {
                self.reload_success.set(0.0);
                let err =
                    ProbeError::ConfigReload(format!("error reading {}: {e}", path.display()));
                error!(err = %err, "Error reloading config");
                Err(err)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().get(name).cloned()
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn health(&self) -> ReloadHealth {
        ReloadHealth {
            last_reload_successful: self.reload_success.get() == 1.0,
            last_success_timestamp_seconds: self.reload_timestamp.get(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn parse_config(source: &[u8]) -> Result<Config, ProbeError> {
    let config: Config = serde_yaml::from_slice(source)
        .map_err(|e| ProbeError::ConfigReload(format!("error parsing config file: {e}")))?;
    config.validate().map_err(ProbeError::ConfigReload)?;
    Ok(config)
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oxyprobe::config::app_config::{load_config, setup_resolver};
use oxyprobe::config::ConfigStore;
use oxyprobe::http_probe::prelude::*;
use oxyprobe::metrics::Registry;
use oxyprobe::mimir::{client::send_to_mimir, create_probe_metrics};

/// Probe a single HTTP target and print the resulting metrics.
#[derive(Debug, Parser)]
#[command(name = "oxyprobe", version, about)]
struct Cli {
    /// Target to probe, e.g. `example.org` or `https://example.org/health`.
    target: String,

    /// Module from the config file to probe with.
    #[arg(short, long, default_value = "http_2xx")]
    module: String,

    /// Module definitions. Overrides `CONFIG_FILE`.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let app_config = load_config();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Registry::new();
    let store = ConfigStore::with_registry(registry.clone());
    let config_file = cli.config.unwrap_or(app_config.config_file);
    store
        .reload_from_file(&config_file)
        .with_context(|| format!("failed to load {}", config_file.display()))?;
    let module = store.get(&cli.module).with_context(|| {
        format!(
            "unknown module {:?}, available: {}",
            cli.module,
            store.module_names().join(", ")
        )
    })?;

    let resolver = setup_resolver(&app_config.dns_hosts)
        .map_err(|e| anyhow!("failed to set up DNS resolver: {e}"))?;
    let prober = HttpProber::new(Arc::new(resolver));

    let result = prober.probe(&cli.target, &module).await;
    result.record(&registry);
    print!("{}", registry.encode_text());

    if let Some(endpoint) = &app_config.mimir_endpoint {
        info!(endpoint = %endpoint, "Pushing results to Mimir");
        let series = create_probe_metrics(&registry.gather(), &cli.target, &cli.module);
        if let Err(e) = send_to_mimir(endpoint, app_config.mimir_tenant.as_deref(), series).await {
            warn!(err = %e, "Failed to send metrics for {}", cli.target);
        }
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

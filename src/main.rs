use anyhow::{bail, Context};
use projector_secrets::config::{AppConfig, RunConfig};
use projector_secrets::secrets::{CaStatus, SecretsProvisioner};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.fill_missing_tokens()?;

    let requested: Vec<String> = std::env::args().skip(1).collect();
    let run_configs = select_run_configs(&config, &requested)?;
    if run_configs.is_empty() {
        info!("No run configs defined, nothing to provision");
        return Ok(());
    }

    let provisioner = Arc::new(SecretsProvisioner::from_app_config(&config)?);
    info!(
        "🔐 Provisioning {} run config(s) under {}",
        run_configs.len(),
        provisioner.paths().root().display()
    );

    let mut tasks = JoinSet::new();
    for run_config in run_configs {
        let provisioner = Arc::clone(&provisioner);
        tasks.spawn_blocking(move || {
            let result = provisioner.generate_server_secrets(&run_config);
            (run_config.name, result)
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (name, result) = joined.context("Provisioning task panicked")?;
        match result {
            Ok(report) => {
                if report.ca_status == CaStatus::Created {
                    info!("📜 '{}' created the installation CA", name);
                }
                info!(
                    "✅ '{}': keystore {}, properties {}",
                    name,
                    report.projector.keystore.display(),
                    report.ssl_properties.display()
                );
            }
            Err(e) => {
                error!("❌ '{}' failed: {}", name, e);
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        failed.sort();
        bail!("Failed to provision: {}", failed.join(", "));
    }

    info!("🎉 All secrets generated");
    Ok(())
}

/// All run configs when no names are given, otherwise exactly the named ones.
fn select_run_configs(config: &AppConfig, names: &[String]) -> anyhow::Result<Vec<RunConfig>> {
    if names.is_empty() {
        return Ok(config.run_configs.clone());
    }

    names
        .iter()
        .map(|name| {
            config
                .run_config(name)
                .cloned()
                .with_context(|| format!("Unknown run config '{}'", name))
        })
        .collect()
}

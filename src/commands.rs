use crate::config::Config;
use crate::error::{ConfigError, GatewayError, Result};
use crate::plugin::{NativeCatalog, PluginLoader};
use tracing::{error, info, warn};

/// Validate the configuration and dry-run every plugin file without
/// touching the discovery directory.
pub async fn run_config_check(config: Config, catalog: NativeCatalog) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");
    info!("  Listen address: {}", config.bind_address());
    info!("  Plugin directory: {}", config.plugins.dir.display());
    info!("  Worker pool: {} slots", config.plugins.worker_pool_size);
    match config.plugins.call_timeout() {
        Some(timeout) => info!("  Call timeout: {:?}", timeout),
        None => warn!("  ! Call timeout disabled"),
    }

    let loader = PluginLoader::new(config.plugins.clone(), catalog);
    let inspections = loader.inspect().await?;
    info!("Checking {} plugin file(s)...", inspections.len());

    let mut failed = 0;
    for inspection in &inspections {
        match &inspection.error {
            None => info!(
                "  ✓ {} -> {} ({})",
                inspection.file,
                inspection.id.as_deref().unwrap_or("?"),
                inspection
                    .kind
                    .map(|kind| kind.to_string())
                    .unwrap_or_default()
            ),
            Some(reason) => {
                failed += 1;
                error!("  ✗ {}: {}", inspection.file, reason);
            }
        }
    }

    if failed == 0 {
        info!("✓ All checks passed");
        Ok(())
    } else {
        Err(GatewayError::Config(ConfigError::Validation(format!(
            "{failed} plugin file(s) would be quarantined"
        ))))
    }
}

//! `berth check` — load and validate a config, print the effective settings.

use std::path::Path;

use tracing::info;

use crate::config::BerthConfig;

pub fn run(path: &Path) -> anyhow::Result<()> {
    let config = BerthConfig::from_file(path)?;
    info!(
        path = %path.display(),
        address = %config.endpoint.address,
        max_connections = config.pool.max_connections,
        "configuration is valid"
    );
    print!("{}", config.to_toml_string()?);
    Ok(())
}

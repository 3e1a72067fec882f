//! The `down` command.

use anyhow::{Context, Result};
use skiff_core::{down, Config, HttpClusterClient};
use std::sync::Arc;

pub async fn run(cfg: Config) -> Result<()> {
    let cluster = Arc::new(
        HttpClusterClient::new(&cfg.kube, &cfg.namespace)
            .context("error setting up the cluster client")?,
    );
    down::run(&cfg, cluster).await?;
    Ok(())
}

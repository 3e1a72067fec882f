//! The `up` command.

use anyhow::{Context, Result};
use skiff_core::{Config, DockerEngine, HttpClusterClient, UpOptions, UpRunner};
use std::sync::Arc;

pub async fn run(cfg: Config, run_as_user: bool, detach: bool) -> Result<()> {
    let cluster = Arc::new(
        HttpClusterClient::new(&cfg.kube, &cfg.namespace)
            .context("error setting up the cluster client")?,
    );
    let engine =
        Arc::new(DockerEngine::connect().context("error connecting to the container engine")?);

    let runner = UpRunner::new(
        cfg,
        cluster,
        engine,
        UpOptions {
            run_as_user,
            detach,
        },
    );
    runner.run().await?;
    Ok(())
}

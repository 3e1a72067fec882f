//! The `down` operation: tear down the fleet's cluster objects.

use crate::cluster::meta::object_name;
use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::error::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Delete the pods and services of every selected service. Individual
/// failures are reported and do not stop the teardown.
pub async fn run(cfg: &Config, cluster: Arc<dyn ClusterClient>) -> Result<()> {
    for (name, service) in &cfg.services {
        if !cfg.matches_filter(name) {
            continue;
        }
        let object = object_name(cfg, service);
        match cluster.delete_pod(&object).await {
            Ok(()) => info!(service = %name, "deleted pod {object}"),
            Err(e) => warn!(service = %name, "failed to delete pod {object}: {e}"),
        }
        if !service.ports.is_empty() {
            match cluster.delete_service(&object).await {
                Ok(()) => info!(service = %name, "deleted service {object}"),
                Err(e) => warn!(service = %name, "failed to delete service {object}: {e}"),
            }
        }
    }
    Ok(())
}

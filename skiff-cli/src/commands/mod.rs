//! Command implementations and shared flag handling.

use crate::kubeconfig;
use anyhow::{bail, Result};
use skiff_core::cluster::meta::is_valid_label_value;
use skiff_core::Config;
use std::path::Path;

pub mod down;
pub mod up;

pub const ENV_ID_VAR: &str = "SKIFF_ENVID";
pub const NAMESPACE_VAR: &str = "SKIFF_NAMESPACE";

/// Assemble the runtime configuration from flags, environment variables and
/// the local cluster config.
pub fn load_config(
    file: Option<&str>,
    env_id: Option<String>,
    namespace: Option<String>,
    services: &[String],
) -> Result<Config> {
    let env_id = match env_id {
        Some(value) => {
            if !is_valid_label_value(&value) || value.is_empty() {
                bail!("the --env-id flag must be a valid label value");
            }
            value
        }
        None => match std::env::var(ENV_ID_VAR) {
            Ok(value) => {
                if !is_valid_label_value(&value) || value.is_empty() {
                    bail!("the environment variable {ENV_ID_VAR} must be a valid label value");
                }
                value
            }
            Err(_) => bail!(
                "either the flag --env-id or the environment variable {ENV_ID_VAR} must be set"
            ),
        },
    };

    let loaded = kubeconfig::load()?;
    let mut cfg = Config::new(file.map(Path::new))?;
    cfg.environment_id = env_id;
    cfg.kube = loaded.kube;
    cfg.namespace = namespace
        .or_else(|| std::env::var(NAMESPACE_VAR).ok().filter(|v| !v.is_empty()))
        .or(loaded.namespace)
        .unwrap_or_else(|| "default".to_string());

    if services.is_empty() {
        let names: Vec<String> = cfg.services.keys().cloned().collect();
        for name in names {
            cfg.add_to_filter(&name);
        }
    } else {
        for name in services {
            if cfg.find_service(name).is_none() {
                bail!("no service named {name:?} exists");
            }
            cfg.add_to_filter(name);
        }
    }
    Ok(cfg)
}

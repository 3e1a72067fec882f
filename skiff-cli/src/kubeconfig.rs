//! Minimal reader for the local cluster client configuration.
//!
//! Reads `$KUBECONFIG` (or `~/.kube/config`), follows `current-context` and
//! extracts the server address, bearer token and default namespace.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use skiff_core::KubeConfig;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
}

/// The settings resolved from the local configuration.
pub struct LoadedKubeconfig {
    pub kube: KubeConfig,
    pub namespace: Option<String>,
}

pub fn load() -> Result<LoadedKubeconfig> {
    let path = config_path()?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("error reading cluster config {path:?}"))?;
    let file: KubeconfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("error parsing cluster config {path:?}"))?;
    resolve(file).with_context(|| format!("error resolving cluster config {path:?}"))
}

fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".kube").join("config"))
}

fn resolve(file: KubeconfigFile) -> Result<LoadedKubeconfig> {
    let Some(current) = &file.current_context else {
        bail!("no current-context is set");
    };
    let Some(context) = file.contexts.iter().find(|c| &c.name == current) else {
        bail!("current-context {current:?} does not exist");
    };
    let Some(cluster) = file
        .clusters
        .iter()
        .find(|c| c.name == context.context.cluster)
    else {
        bail!("cluster {:?} does not exist", context.context.cluster);
    };
    let token = context
        .context
        .user
        .as_ref()
        .and_then(|name| file.users.iter().find(|u| &u.name == name))
        .and_then(|u| u.user.token.clone());

    Ok(LoadedKubeconfig {
        kube: KubeConfig {
            server: cluster.cluster.server.clone(),
            token,
            accept_invalid_certs: cluster.cluster.insecure_skip_tls_verify.unwrap_or(false),
        },
        namespace: context.context.namespace.clone(),
    })
}

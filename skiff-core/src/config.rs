//! Runtime configuration: the resolved service graph plus deployment
//! settings.

use crate::cluster::meta::escape_name;
use crate::cluster::KubeConfig;
use crate::compose::{
    Healthcheck, Healthiness, Loader, PathMapping, PortBinding, RestartPolicy, ServiceDefinition,
};
use crate::error::{Result, SkiffError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Where the cluster finds the images referenced by pods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClusterImageStorage {
    /// Images are already visible to the cluster nodes' container engine.
    #[default]
    Docker,
    /// Images are pushed to this registry before pods are created.
    DockerRegistry { host: String },
}

/// A resolved service, 1:1 with a pod.
#[derive(Debug, Clone, Default)]
pub struct Service {
    pub name: String,
    /// Lowercased DNS-safe derivative of the name, used in object names and
    /// selector labels.
    pub name_escaped: String,
    pub image: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<PathMapping>,
    pub working_dir: Option<String>,
    pub restart: RestartPolicy,
    pub user: Option<String>,
    pub healthcheck: Option<Healthcheck>,
    pub healthcheck_disabled: bool,
    pub depends_on: BTreeMap<String, Healthiness>,
    matches_filter: bool,
}

/// Runtime configuration for one invocation.
#[derive(Debug, Default)]
pub struct Config {
    pub services: BTreeMap<String, Service>,
    pub environment_id: String,
    pub environment_label: String,
    pub namespace: String,
    pub kube: KubeConfig,
    pub cluster_image_storage: ClusterImageStorage,
}

impl Config {
    /// Build a configuration from a compose file. When `file` is `None` the
    /// conventional `docker-compose.yml`/`.yaml` names are probed in the
    /// working directory.
    pub fn new(file: Option<&Path>) -> Result<Config> {
        let mut loader = Loader::new();
        Self::from_loader(&mut loader, file)
    }

    /// Like [`Config::new`] but with a caller-supplied loader, so tests can
    /// inject an environment.
    pub fn from_loader(loader: &mut Loader, file: Option<&Path>) -> Result<Config> {
        let path = match file {
            Some(path) => path.to_path_buf(),
            None => default_compose_file()?,
        };
        let parsed = loader.load_resolved(&path)?;

        let mut cfg = Config {
            environment_label: "env-id".to_string(),
            namespace: "default".to_string(),
            ..Config::default()
        };
        for (name, definition) in &parsed.services {
            let escaped = escape_name(name);
            if escaped.is_empty() {
                return Err(SkiffError::InvalidCompose {
                    path: parsed.path.clone(),
                    reason: format!("service name {name:?} cannot be mapped to a cluster object name"),
                });
            }
            cfg.add_service(name, definition.clone());
        }

        cfg.validate_graph()?;
        cfg.cluster_image_storage = parse_cluster_image_storage(parsed)?;
        Ok(cfg)
    }

    /// Insert a service built from a resolved definition.
    ///
    /// # Panics
    /// Panics when a service with the same name already exists; names are
    /// unique by construction and a duplicate is a programming error.
    pub fn add_service(&mut self, name: &str, definition: ServiceDefinition) -> &mut Service {
        assert!(
            !self.services.contains_key(name),
            "duplicate service name {name:?}"
        );
        let service = Service {
            name: name.to_string(),
            name_escaped: escape_name(name),
            image: definition.image,
            entrypoint: definition.entrypoint,
            command: definition.command,
            environment: definition.environment,
            ports: definition.ports,
            volumes: definition.volumes,
            working_dir: definition.working_dir,
            restart: definition.restart,
            user: definition.user,
            healthcheck: definition.healthcheck,
            healthcheck_disabled: definition.healthcheck_disabled,
            depends_on: definition.depends_on,
            matches_filter: false,
        };
        self.services.entry(name.to_string()).or_insert(service)
    }

    pub fn find_service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Reverse lookup from the escaped form used in cluster labels.
    pub fn find_service_by_escaped_name(&self, escaped: &str) -> Option<&Service> {
        self.services.values().find(|s| s.name_escaped == escaped)
    }

    /// Mark a service and its transitive `depends_on` closure as selected.
    pub fn add_to_filter(&mut self, name: &str) {
        let mut queue = vec![name.to_string()];
        while let Some(name) = queue.pop() {
            let Some(service) = self.services.get_mut(&name) else {
                continue;
            };
            if service.matches_filter {
                continue;
            }
            service.matches_filter = true;
            queue.extend(service.depends_on.keys().cloned());
        }
    }

    pub fn matches_filter(&self, name: &str) -> bool {
        self.services
            .get(name)
            .is_some_and(|s| s.matches_filter)
    }

    pub fn clear_filter(&mut self) {
        for service in self.services.values_mut() {
            service.matches_filter = false;
        }
    }

    /// Validate that every `depends_on` target exists and the graph is
    /// acyclic.
    fn validate_graph(&self) -> Result<()> {
        for (name, service) in &self.services {
            for dependency in service.depends_on.keys() {
                if !self.services.contains_key(dependency) {
                    return Err(SkiffError::MissingDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut visited = HashSet::new();
        for name in self.services.keys() {
            let mut stack = HashSet::new();
            if self.has_cycle(name, &mut visited, &mut stack) {
                return Err(SkiffError::CircularDependency {
                    service: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn has_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
    ) -> bool {
        if stack.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        stack.insert(node.to_string());

        if let Some(service) = self.services.get(node) {
            for dependency in service.depends_on.keys() {
                if self.has_cycle(dependency, visited, stack) {
                    return true;
                }
            }
        }

        stack.remove(node);
        false
    }
}

/// Probe the conventional compose file names in the working directory.
fn default_compose_file() -> Result<PathBuf> {
    for candidate in ["docker-compose.yml", "docker-compose.yaml"] {
        let path = PathBuf::from(candidate);
        match std::fs::metadata(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(SkiffError::FileRead { path, source }),
        }
    }
    Err(SkiffError::FileRead {
        path: PathBuf::from("docker-compose.yml"),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no docker-compose.yml or docker-compose.yaml in the working directory",
        ),
    })
}

#[derive(Debug, Deserialize)]
struct XKubeCompose {
    #[serde(default)]
    cluster_image_storage: Option<ClusterImageStorageShape>,
    #[serde(default)]
    push_images: Option<PushImagesShape>,
}

#[derive(Debug, Deserialize)]
struct ClusterImageStorageShape {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushImagesShape {
    docker_registry: String,
}

/// Read the `x-kube-compose` extension block from a parsed file.
fn parse_cluster_image_storage(parsed: &crate::compose::ParsedFile) -> Result<ClusterImageStorage> {
    let Some(value) = parsed.x_properties.get("x-kube-compose") else {
        return Ok(ClusterImageStorage::default());
    };
    let invalid = |reason: String| SkiffError::InvalidCompose {
        path: parsed.path.clone(),
        reason,
    };
    let x: XKubeCompose = serde_yaml::from_value(value.clone())
        .map_err(|e| invalid(format!("x-kube-compose: {e}")))?;

    match (x.cluster_image_storage, x.push_images) {
        (Some(_), Some(_)) => Err(invalid(
            "cluster_image_storage and push_images are mutually exclusive".to_string(),
        )),
        (None, None) => Ok(ClusterImageStorage::default()),
        (None, Some(push)) => Ok(ClusterImageStorage::DockerRegistry {
            host: push.docker_registry,
        }),
        (Some(storage), None) => match storage.kind.as_str() {
            "docker" => Ok(ClusterImageStorage::Docker),
            "docker_registry" => match storage.host {
                Some(host) => Ok(ClusterImageStorage::DockerRegistry { host }),
                None => Err(invalid(
                    "cluster_image_storage of type docker_registry requires a host".to_string(),
                )),
            },
            other => Err(invalid(format!(
                "unknown cluster_image_storage type {other:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut cfg = Config {
            environment_label: "env-id".to_string(),
            ..Config::default()
        };
        cfg.add_service("a", ServiceDefinition::default());
        cfg.add_service("b", ServiceDefinition::default());
        cfg.add_service("c", ServiceDefinition::default());
        cfg.add_service("d", ServiceDefinition::default());
        cfg.services.get_mut("a").unwrap().depends_on =
            [("b".to_string(), Healthiness::Healthy)].into();
        cfg.services.get_mut("b").unwrap().depends_on = [
            ("c".to_string(), Healthiness::Healthy),
            ("d".to_string(), Healthiness::Healthy),
        ]
        .into();
        cfg
    }

    #[test]
    fn test_add_to_filter_transitive() {
        let mut cfg = test_config();
        cfg.add_to_filter("a");
        assert!(cfg.matches_filter("a"));
        assert!(cfg.matches_filter("b"));
        assert!(cfg.matches_filter("c"));
        assert!(cfg.matches_filter("d"));
    }

    #[test]
    fn test_add_to_filter_partial() {
        let mut cfg = test_config();
        cfg.add_to_filter("b");
        assert!(!cfg.matches_filter("a"));
        assert!(cfg.matches_filter("b"));
        assert!(cfg.matches_filter("c"));
        assert!(cfg.matches_filter("d"));
    }

    #[test]
    fn test_clear_filter() {
        let mut cfg = test_config();
        cfg.add_to_filter("a");
        cfg.clear_filter();
        for name in ["a", "b", "c", "d"] {
            assert!(!cfg.matches_filter(name));
        }
    }

    #[test]
    #[should_panic(expected = "duplicate service name")]
    fn test_add_service_duplicate_panics() {
        let mut cfg = test_config();
        cfg.add_service("a", ServiceDefinition::default());
    }

    #[test]
    fn test_validate_graph_missing_dependency() {
        let mut cfg = Config::default();
        cfg.add_service("a", ServiceDefinition::default());
        cfg.services.get_mut("a").unwrap().depends_on =
            [("ghost".to_string(), Healthiness::Started)].into();
        assert!(matches!(
            cfg.validate_graph().unwrap_err(),
            SkiffError::MissingDependency { .. }
        ));
    }

    #[test]
    fn test_validate_graph_cycle() {
        let mut cfg = Config::default();
        cfg.add_service("a", ServiceDefinition::default());
        cfg.add_service("b", ServiceDefinition::default());
        cfg.services.get_mut("a").unwrap().depends_on =
            [("b".to_string(), Healthiness::Started)].into();
        cfg.services.get_mut("b").unwrap().depends_on =
            [("a".to_string(), Healthiness::Started)].into();
        assert!(matches!(
            cfg.validate_graph().unwrap_err(),
            SkiffError::CircularDependency { .. }
        ));
    }
}

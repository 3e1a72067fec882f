//! Compose file loading and `extends` resolution.
//!
//! Files are parsed once and memoized by absolute path. Inheritance chains
//! are walked with a visited set so cycles across files are detected.

use super::interpolate::interpolate_tree;
use super::normalize;
use super::types::*;
use super::version::SchemaVersion;
use crate::error::{Result, SkiffError};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One parsed compose file.
#[derive(Debug)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub version: SchemaVersion,
    /// Raw values of the top-level `x-*` extension keys (version 2 only).
    pub x_properties: BTreeMap<String, Value>,
    pub services: BTreeMap<String, ServiceDefinition>,
}

/// Memoizing compose file loader.
pub struct Loader {
    files: HashMap<PathBuf, ParsedFile>,
    env: EnvLookup,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    /// A loader that interpolates from the process environment.
    pub fn new() -> Self {
        Self::with_env(|name| std::env::var(name).ok())
    }

    /// A loader with an injected environment, used by tests.
    pub fn with_env<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Loader {
            files: HashMap::new(),
            env: Arc::new(lookup),
        }
    }

    /// Load a file without resolving `extends`. Repeated calls for the same
    /// path return the memoized parse.
    pub fn load(&mut self, path: &Path) -> Result<&ParsedFile> {
        let path = absolutize(path);
        self.ensure_loaded(&path)?;
        Ok(&self.files[&path])
    }

    /// Load a file and resolve every service's `extends` chain.
    pub fn load_resolved(&mut self, path: &Path) -> Result<&ParsedFile> {
        let path = absolutize(path);
        self.ensure_loaded(&path)?;
        let names: Vec<String> = self.files[&path].services.keys().cloned().collect();
        for name in names {
            let mut visited = HashSet::new();
            self.resolve_service(&path, &name, &mut visited)?;
        }
        Ok(&self.files[&path])
    }

    fn ensure_loaded(&mut self, path: &PathBuf) -> Result<()> {
        if !self.files.contains_key(path) {
            let file = self.parse_file(path)?;
            self.files.insert(path.clone(), file);
        }
        Ok(())
    }

    fn parse_file(&self, path: &PathBuf) -> Result<ParsedFile> {
        let content = std::fs::read_to_string(path).map_err(|source| SkiffError::FileRead {
            path: path.clone(),
            source,
        })?;
        let mut tree: Value = serde_yaml::from_str(&content).map_err(|source| SkiffError::Yaml {
            path: path.clone(),
            source,
        })?;
        let env = Arc::clone(&self.env);
        interpolate_tree(&mut tree, &move |name: &str| env(name)).map_err(|e| {
            SkiffError::Interpolation {
                path: path.clone(),
                variable: e.variable,
                message: e.message,
            }
        })?;

        let version_value = tree.get("version").map(scalar_to_string);
        let version =
            SchemaVersion::detect(version_value.as_deref()).ok_or(SkiffError::UnsupportedVersion {
                path: path.clone(),
                version: version_value.unwrap_or_default(),
            })?;

        let mut x_properties = BTreeMap::new();
        let services_tree = match version {
            SchemaVersion::V1 => {
                let mut services = serde_yaml::Mapping::new();
                if let Value::Mapping(mapping) = &tree {
                    for (key, value) in mapping {
                        let name = scalar_to_string(key);
                        if name != "version" {
                            services.insert(key.clone(), value.clone());
                        }
                    }
                }
                services
            }
            SchemaVersion::V2 => {
                if let Value::Mapping(mapping) = &tree {
                    for (key, value) in mapping {
                        let name = scalar_to_string(key);
                        if name.starts_with("x-") {
                            x_properties.insert(name, value.clone());
                        }
                    }
                }
                match tree.get("services") {
                    Some(Value::Mapping(services)) => services.clone(),
                    Some(Value::Null) | None => serde_yaml::Mapping::new(),
                    Some(_) => {
                        return Err(SkiffError::InvalidCompose {
                            path: path.clone(),
                            reason: "services must be a mapping".to_string(),
                        })
                    }
                }
            }
        };

        let mut services = BTreeMap::new();
        for (key, value) in services_tree {
            let name = scalar_to_string(&key);
            validate_service_name(&name).map_err(|reason| SkiffError::InvalidCompose {
                path: path.clone(),
                reason,
            })?;
            let shape: ServiceShape =
                serde_yaml::from_value(value).map_err(|e| SkiffError::InvalidCompose {
                    path: path.clone(),
                    reason: format!("service {name:?}: {e}"),
                })?;
            let definition =
                self.normalize_service(&shape)
                    .map_err(|reason| SkiffError::InvalidCompose {
                        path: path.clone(),
                        reason: format!("service {name:?}: {reason}"),
                    })?;
            services.insert(name, definition);
        }

        Ok(ParsedFile {
            path: path.clone(),
            version,
            x_properties,
            services,
        })
    }

    fn normalize_service(
        &self,
        shape: &ServiceShape,
    ) -> std::result::Result<ServiceDefinition, String> {
        let env = Arc::clone(&self.env);
        let lookup = move |name: &str| env(name);
        let environment = match &shape.environment {
            Some(e) => normalize::environment(e, &lookup)?,
            None => BTreeMap::new(),
        };
        let (healthcheck, healthcheck_disabled) = match &shape.healthcheck {
            Some(h) => normalize::healthcheck(h)?,
            None => (None, false),
        };
        Ok(ServiceDefinition {
            image: shape.image.clone(),
            entrypoint: shape
                .entrypoint
                .as_ref()
                .map(normalize::command)
                .transpose()?,
            command: shape.command.as_ref().map(normalize::command).transpose()?,
            environment,
            ports: match &shape.ports {
                Some(p) => normalize::ports(p)?,
                None => Vec::new(),
            },
            volumes: match &shape.volumes {
                Some(v) => normalize::volumes(v)?,
                None => Vec::new(),
            },
            working_dir: shape.working_dir.clone(),
            restart: normalize::restart(shape.restart.as_deref()),
            user: shape.user.clone(),
            healthcheck,
            healthcheck_disabled,
            extends: shape.extends.as_ref().map(normalize::extends),
            depends_on: match &shape.depends_on {
                Some(d) => normalize::depends_on(d)?,
                None => BTreeMap::new(),
            },
            extends_resolved: false,
        })
    }

    /// Resolve one service's `extends` chain, recursing into target files.
    fn resolve_service(
        &mut self,
        file: &PathBuf,
        name: &str,
        visited: &mut HashSet<(PathBuf, String)>,
    ) -> Result<ServiceDefinition> {
        self.ensure_loaded(file)?;
        let definition = match self.files[file].services.get(name) {
            Some(d) => d.clone(),
            None => {
                return Err(SkiffError::UnknownExtendsTarget {
                    file: file.clone(),
                    service: name.to_string(),
                    target: name.to_string(),
                })
            }
        };
        if definition.extends_resolved {
            return Ok(definition);
        }
        if !visited.insert((file.clone(), name.to_string())) {
            return Err(SkiffError::CircularExtends {
                file: file.clone(),
                service: name.to_string(),
            });
        }

        let resolved = match definition.extends.clone() {
            None => {
                let mut d = definition;
                d.extends_resolved = true;
                d
            }
            Some(extends) => {
                if !definition.depends_on.is_empty() {
                    return Err(SkiffError::ExtendsWithDependsOn {
                        service: name.to_string(),
                    });
                }
                let target_file = match &extends.file {
                    None => file.clone(),
                    Some(relative) => {
                        if !self.files[file].version.allows_extends_file() {
                            return Err(SkiffError::InvalidCompose {
                                path: file.clone(),
                                reason: format!(
                                    "service {name:?}: extends with file is only supported in \
                                     version 1 files"
                                ),
                            });
                        }
                        let base = file.parent().unwrap_or_else(|| Path::new("."));
                        absolutize(&base.join(relative))
                    }
                };
                let target = extends.service.clone();
                self.ensure_loaded(&target_file)?;
                if !self.files[&target_file].services.contains_key(&target) {
                    return Err(SkiffError::UnknownExtendsTarget {
                        file: target_file,
                        service: name.to_string(),
                        target,
                    });
                }
                let parent = self.resolve_service(&target_file, &target, visited)?;
                if !parent.depends_on.is_empty() {
                    return Err(SkiffError::ExtendsWithDependsOn { service: target });
                }
                let mut merged = merge(&parent, &definition);
                merged.extends_resolved = true;
                merged
            }
        };

        let entry = self
            .files
            .get_mut(file)
            .and_then(|f| f.services.get_mut(name))
            .expect("service was loaded above");
        *entry = resolved.clone();
        Ok(resolved)
    }
}

/// Merge an `extends` parent into a child; the child wins wherever it sets a
/// value.
fn merge(parent: &ServiceDefinition, child: &ServiceDefinition) -> ServiceDefinition {
    let mut environment = parent.environment.clone();
    environment.extend(child.environment.clone());

    let (healthcheck, healthcheck_disabled) =
        if child.healthcheck.is_some() || child.healthcheck_disabled {
            (child.healthcheck.clone(), child.healthcheck_disabled)
        } else {
            (parent.healthcheck.clone(), parent.healthcheck_disabled)
        };

    ServiceDefinition {
        image: child.image.clone().or_else(|| parent.image.clone()),
        entrypoint: child
            .entrypoint
            .clone()
            .or_else(|| parent.entrypoint.clone()),
        command: child.command.clone().or_else(|| parent.command.clone()),
        environment,
        ports: if child.ports.is_empty() {
            parent.ports.clone()
        } else {
            child.ports.clone()
        },
        volumes: if child.volumes.is_empty() {
            parent.volumes.clone()
        } else {
            child.volumes.clone()
        },
        working_dir: child
            .working_dir
            .clone()
            .or_else(|| parent.working_dir.clone()),
        restart: if child.restart == RestartPolicy::Unset {
            parent.restart
        } else {
            child.restart
        },
        user: child.user.clone().or_else(|| parent.user.clone()),
        healthcheck,
        healthcheck_disabled,
        extends: None,
        depends_on: BTreeMap::new(),
        extends_resolved: false,
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn validate_service_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("service with empty name".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("invalid service name {name:?}"));
    }
    Ok(())
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_default()
            .join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_is_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "docker-compose.yml", "app:\n  image: busybox\n");
        let mut loader = Loader::with_env(|_| None);
        let first = loader.load(&path).unwrap() as *const ParsedFile;
        let second = loader.load(&path).unwrap() as *const ParsedFile;
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_version_detection() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = write_file(&dir, "v1.yml", "app:\n  image: busybox\n");
        let v2 = write_file(&dir, "v2.yml", "version: '2'\nservices:\n  app:\n    image: busybox\n");
        let bad = write_file(&dir, "bad.yml", "version: 'asdf'\n");

        let mut loader = Loader::with_env(|_| None);
        assert_eq!(loader.load(&v1).unwrap().version, SchemaVersion::V1);
        assert_eq!(loader.load(&v2).unwrap().version, SchemaVersion::V2);
        assert!(matches!(
            loader.load(&bad).unwrap_err(),
            SkiffError::UnsupportedVersion { version, .. } if version == "asdf"
        ));
    }

    #[test]
    fn test_same_file_extends_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "docker-compose.yml",
            r#"
version: '2'
services:
  base:
    image: busybox
    environment:
      A: '1'
      B: '1'
  app:
    extends: base
    environment:
      B: '2'
"#,
        );
        let mut loader = Loader::with_env(|_| None);
        let file = loader.load_resolved(&path).unwrap();
        let app = &file.services["app"];
        assert_eq!(app.image.as_deref(), Some("busybox"));
        assert_eq!(app.environment.get("A").map(String::as_str), Some("1"));
        assert_eq!(app.environment.get("B").map(String::as_str), Some("2"));
        assert!(app.extends_resolved);
    }

    #[test]
    fn test_extends_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "docker-compose.yml",
            "version: '2'\nservices:\n  a:\n    extends: b\n  b:\n    extends: a\n",
        );
        let mut loader = Loader::with_env(|_| None);
        assert!(matches!(
            loader.load_resolved(&path).unwrap_err(),
            SkiffError::CircularExtends { .. }
        ));
    }

    #[test]
    fn test_extends_file_requires_v1() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "common.yml", "base:\n  image: busybox\n");
        let path = write_file(
            &dir,
            "docker-compose.yml",
            "version: '2'\nservices:\n  app:\n    extends:\n      file: common.yml\n      service: base\n",
        );
        let mut loader = Loader::with_env(|_| None);
        assert!(matches!(
            loader.load_resolved(&path).unwrap_err(),
            SkiffError::InvalidCompose { .. }
        ));
    }

    #[test]
    fn test_unknown_extends_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "docker-compose.yml",
            "version: '2'\nservices:\n  app:\n    extends: ghost\n",
        );
        let mut loader = Loader::with_env(|_| None);
        assert!(matches!(
            loader.load_resolved(&path).unwrap_err(),
            SkiffError::UnknownExtendsTarget { .. }
        ));
    }

    #[test]
    fn test_interpolation_applies_to_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "docker-compose.yml",
            "version: '2'\nservices:\n  app:\n    image: busybox:${TAG:-latest}\n",
        );
        let mut loader = Loader::with_env(|_| None);
        let file = loader.load(&path).unwrap();
        assert_eq!(
            file.services["app"].image.as_deref(),
            Some("busybox:latest")
        );
    }

    #[test]
    fn test_invalid_service_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "docker-compose.yml",
            "version: '2'\nservices:\n  '!!':\n    image: busybox\n",
        );
        let mut loader = Loader::with_env(|_| None);
        assert!(matches!(
            loader.load(&path).unwrap_err(),
            SkiffError::InvalidCompose { .. }
        ));
    }
}

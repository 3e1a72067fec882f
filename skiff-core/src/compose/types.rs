//! Compose file format types.
//!
//! Raw `*Shape` types mirror the YAML wire forms, including the fields that
//! accept a scalar, a sequence, or a mapping. The canonical types below them
//! are what the rest of the crate works with after normalization.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A service block as it appears in the file, before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceShape {
    pub image: Option<String>,
    pub entrypoint: Option<CommandShape>,
    pub command: Option<CommandShape>,
    pub environment: Option<EnvironmentShape>,
    pub ports: Option<Vec<PortShape>>,
    pub volumes: Option<Vec<VolumeShape>>,
    pub working_dir: Option<String>,
    pub restart: Option<String>,
    pub user: Option<String>,
    pub healthcheck: Option<HealthcheckShape>,
    pub extends: Option<ExtendsShape>,
    pub depends_on: Option<DependsOnShape>,
}

/// `command` and `entrypoint` accept a shell string or an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandShape {
    Shell(String),
    Argv(Vec<String>),
}

/// Environment variables as a map or a list of `KEY=value` strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentShape {
    Map(BTreeMap<String, Option<ScalarValue>>),
    List(Vec<String>),
}

/// A YAML scalar in a position where compose accepts several types.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    /// Render as the string the container will see. Numbers use the shortest
    /// round-trip decimal form.
    pub fn render(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => format!("{}", f),
            ScalarValue::Str(s) => s.clone(),
        }
    }
}

/// A port entry: bare container port, `"[HOST:]CONTAINER[/PROTO]"` string
/// (ranges allowed), or the long form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortShape {
    Num(i64),
    Str(String),
    Long(PortLongForm),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortLongForm {
    pub target: i64,
    #[serde(default)]
    pub published: Option<ScalarValue>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// A volume entry: `"HOST:CONTAINER[:MODE]"` or the long form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VolumeShape {
    Short(String),
    Long(VolumeLongForm),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeLongForm {
    #[serde(default)]
    pub source: Option<String>,
    pub target: String,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthcheckShape {
    pub disable: Option<bool>,
    pub test: Option<CommandShape>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<i64>,
    pub start_period: Option<String>,
}

/// `extends` accepts a service name shorthand or a `{file, service}` mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExtendsShape {
    Service(String),
    Full {
        #[serde(default)]
        file: Option<String>,
        service: String,
    },
}

/// `depends_on` accepts a list of names or a map with conditions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOnShape {
    List(Vec<String>),
    Map(BTreeMap<String, Option<DependsOnEntry>>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependsOnEntry {
    #[serde(default)]
    pub condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Canonical forms
// ---------------------------------------------------------------------------

/// A canonical port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub internal: u16,
    pub external: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn uppercase(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// A canonical volume mapping. Only host-path semantics are preserved; a
/// named volume keeps its name in `host_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub host_path: Option<String>,
    pub container_path: String,
    pub mode: Option<String>,
}

/// A canonical healthcheck. `test` keeps the docker convention of a leading
/// `CMD` or `CMD-SHELL` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    #[default]
    Unset,
}

/// The `depends_on` condition a dependent waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Healthiness {
    Started,
    Healthy,
}

/// A resolved `extends` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extends {
    pub file: Option<PathBuf>,
    pub service: String,
}

/// A normalized service definition. This is the in-file representation; after
/// `extends` resolution it feeds [`crate::config::Service`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDefinition {
    pub image: Option<String>,
    /// `Some(vec![])` means an explicit empty entrypoint, which overrides the
    /// image entrypoint; `None` means the field was absent.
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
    pub extends: Option<Extends>,
    pub depends_on: BTreeMap<String, Healthiness>,
    pub(crate) extends_resolved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_render() {
        assert_eq!(ScalarValue::Int(8080).render(), "8080");
        assert_eq!(ScalarValue::Float(1.5).render(), "1.5");
        assert_eq!(ScalarValue::Float(2.0).render(), "2");
        assert_eq!(ScalarValue::Bool(false).render(), "false");
        assert_eq!(ScalarValue::Str("x".into()).render(), "x");
    }

    #[test]
    fn test_environment_shape_forms() {
        let map: EnvironmentShape = serde_yaml::from_str("KEY: value\nNUM: 3\n").unwrap();
        assert!(matches!(map, EnvironmentShape::Map(_)));

        let list: EnvironmentShape = serde_yaml::from_str("- KEY=value\n- BARE\n").unwrap();
        assert!(matches!(list, EnvironmentShape::List(_)));
    }

    #[test]
    fn test_extends_shape_forms() {
        let short: ExtendsShape = serde_yaml::from_str("base").unwrap();
        assert!(matches!(short, ExtendsShape::Service(s) if s == "base"));

        let full: ExtendsShape =
            serde_yaml::from_str("file: common.yml\nservice: base\n").unwrap();
        match full {
            ExtendsShape::Full { file, service } => {
                assert_eq!(file.as_deref(), Some("common.yml"));
                assert_eq!(service, "base");
            }
            _ => panic!("expected full extends form"),
        }
    }
}

//! Naming and label conventions for the cluster objects of one deployment.
//!
//! Every object carries `<environment_label>=<environment_id>` to mark the
//! fleet and `service=<escaped name>` for selectors.

use super::types::ObjectMeta;
use crate::config::{Config, Service};
use crate::error::{Result, SkiffError};
use std::collections::BTreeMap;

pub const SERVICE_LABEL: &str = "service";

/// Lowercased DNS-safe derivative of a compose service name.
pub fn escape_name(name: &str) -> String {
    let mapped: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

/// Validate a label value: at most 63 characters, alphanumeric at both ends,
/// with `-`, `_` and `.` allowed between. Empty values are valid.
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.len() > 63 {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Name for this service's cluster objects.
pub fn object_name(cfg: &Config, service: &Service) -> String {
    format!("{}-{}", cfg.environment_id, service.name_escaped).to_ascii_lowercase()
}

/// Labels shared by every object of this service.
pub fn common_labels(cfg: &Config, service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cfg.environment_label.clone(), cfg.environment_id.clone()),
        (SERVICE_LABEL.to_string(), service.name_escaped.clone()),
    ])
}

/// Fill the metadata of a new object for this service.
pub fn init_object_meta(cfg: &Config, service: &Service) -> ObjectMeta {
    ObjectMeta {
        name: object_name(cfg, service),
        labels: common_labels(cfg, service),
        resource_version: None,
    }
}

/// Label selector matching every object of the fleet.
pub fn fleet_selector(cfg: &Config) -> String {
    format!("{}={}", cfg.environment_label, cfg.environment_id)
}

/// Map an object's labels back to the service that owns it.
///
/// Objects without our fleet label (or with another environment's id) belong
/// to someone else and yield `None`. An object inside the fleet that does not
/// resolve to a known service means the fleet was tampered with.
pub fn find_from_object_meta<'a>(
    cfg: &'a Config,
    meta: &ObjectMeta,
) -> Result<Option<&'a Service>> {
    if meta.labels.get(&cfg.environment_label) != Some(&cfg.environment_id) {
        return Ok(None);
    }
    meta.labels
        .get(SERVICE_LABEL)
        .and_then(|escaped| cfg.find_service_by_escaped_name(escaped))
        .map(Some)
        .ok_or(SkiffError::ResourcesModifiedExternally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ServiceDefinition;

    fn test_config() -> Config {
        let mut cfg = Config {
            environment_id: "dev1".to_string(),
            environment_label: "env-id".to_string(),
            ..Config::default()
        };
        cfg.add_service("Web_App", ServiceDefinition::default());
        cfg
    }

    #[test]
    fn test_escape_name() {
        assert_eq!(escape_name("Web_App"), "web-app");
        assert_eq!(escape_name("db"), "db");
        assert_eq!(escape_name("-edge-"), "edge");
        assert_eq!(escape_name("!!"), "");
    }

    #[test]
    fn test_is_valid_label_value() {
        assert!(is_valid_label_value(""));
        assert!(is_valid_label_value("dev1"));
        assert!(is_valid_label_value("a.b_c-d"));
        assert!(!is_valid_label_value("-edge"));
        assert!(!is_valid_label_value("has space"));
        assert!(!is_valid_label_value(&"x".repeat(64)));
    }

    #[test]
    fn test_object_naming_and_labels() {
        let cfg = test_config();
        let service = cfg.find_service("Web_App").unwrap();
        assert_eq!(object_name(&cfg, service), "dev1-web-app");
        let labels = common_labels(&cfg, service);
        assert_eq!(labels.get("env-id").map(String::as_str), Some("dev1"));
        assert_eq!(labels.get("service").map(String::as_str), Some("web-app"));
    }

    #[test]
    fn test_find_from_object_meta() {
        let cfg = test_config();
        let service = cfg.find_service("Web_App").unwrap();
        let meta = init_object_meta(&cfg, service);
        let found = find_from_object_meta(&cfg, &meta).unwrap().unwrap();
        assert_eq!(found.name, "Web_App");
    }

    #[test]
    fn test_find_from_object_meta_foreign_fleet() {
        let cfg = test_config();
        let meta = ObjectMeta {
            name: "other".into(),
            labels: BTreeMap::from([("env-id".to_string(), "other-env".to_string())]),
            resource_version: None,
        };
        assert!(find_from_object_meta(&cfg, &meta).unwrap().is_none());

        let unlabeled = ObjectMeta::default();
        assert!(find_from_object_meta(&cfg, &unlabeled).unwrap().is_none());
    }

    #[test]
    fn test_find_from_object_meta_tampered() {
        let cfg = test_config();
        let meta = ObjectMeta {
            name: "dev1-ghost".into(),
            labels: BTreeMap::from([
                ("env-id".to_string(), "dev1".to_string()),
                ("service".to_string(), "ghost".to_string()),
            ]),
            resource_version: None,
        };
        assert!(matches!(
            find_from_object_meta(&cfg, &meta).unwrap_err(),
            SkiffError::ResourcesModifiedExternally
        ));
    }
}

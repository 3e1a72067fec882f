//! Compose file format versions.

/// Schema variant selected by the top-level `version` scalar.
///
/// Version 1 files are a bare map of service name to service body; version 2
/// and 3 files nest services under a `services:` key and may carry `x-*`
/// extension properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    /// Resolve the schema for a `version` value. `None` means the key was
    /// absent, which historically selects version 1. Returns `None` for
    /// unsupported values.
    pub fn detect(version: Option<&str>) -> Option<SchemaVersion> {
        match version {
            None | Some("1") | Some("1.0") => Some(SchemaVersion::V1),
            Some(v) => {
                let mut parts = v.splitn(2, '.');
                let major = parts.next().unwrap_or("");
                let minor = parts.next();
                let minor_ok = match minor {
                    None => true,
                    Some(m) => !m.is_empty() && m.bytes().all(|b| b.is_ascii_digit()),
                };
                if (major == "2" || major == "3") && minor_ok {
                    Some(SchemaVersion::V2)
                } else {
                    None
                }
            }
        }
    }

    /// Whether `extends` may reference another file via `file:`. Only version
    /// 1 files support the cross-file form.
    pub fn allows_extends_file(&self) -> bool {
        matches!(self, SchemaVersion::V1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_v1() {
        assert_eq!(SchemaVersion::detect(None), Some(SchemaVersion::V1));
        assert_eq!(SchemaVersion::detect(Some("1")), Some(SchemaVersion::V1));
        assert_eq!(SchemaVersion::detect(Some("1.0")), Some(SchemaVersion::V1));
    }

    #[test]
    fn test_detect_v2_and_v3() {
        assert_eq!(SchemaVersion::detect(Some("2")), Some(SchemaVersion::V2));
        assert_eq!(SchemaVersion::detect(Some("2.4")), Some(SchemaVersion::V2));
        assert_eq!(SchemaVersion::detect(Some("3")), Some(SchemaVersion::V2));
        assert_eq!(SchemaVersion::detect(Some("3.8")), Some(SchemaVersion::V2));
    }

    #[test]
    fn test_detect_unsupported() {
        assert_eq!(SchemaVersion::detect(Some("asdf")), None);
        assert_eq!(SchemaVersion::detect(Some("4")), None);
        assert_eq!(SchemaVersion::detect(Some("2.")), None);
        assert_eq!(SchemaVersion::detect(Some("3.x")), None);
        assert_eq!(SchemaVersion::detect(Some("1.1")), None);
    }

    #[test]
    fn test_extends_file_feature() {
        assert!(SchemaVersion::V1.allows_extends_file());
        assert!(!SchemaVersion::V2.allows_extends_file());
    }
}

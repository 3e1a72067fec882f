//! Compose file parsing, normalization and inheritance resolution.

pub mod interpolate;
pub mod loader;
pub mod normalize;
pub mod types;
pub mod version;

pub use loader::{Loader, ParsedFile};
pub use types::{
    Extends, Healthcheck, Healthiness, PathMapping, PortBinding, Protocol, RestartPolicy,
    ServiceDefinition,
};
pub use version::SchemaVersion;

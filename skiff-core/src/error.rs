//! Error types for skiff.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, SkiffError>;

/// Main error type for skiff.
#[derive(Error, Debug)]
pub enum SkiffError {
    // Compose file errors
    #[error("error reading {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path:?}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported compose file version {version:?} in {path:?}")]
    UnsupportedVersion { path: PathBuf, version: String },

    #[error("invalid compose file {path:?}: {reason}")]
    InvalidCompose { path: PathBuf, reason: String },

    #[error("cannot substitute variable {variable:?} in {path:?}: {message}")]
    Interpolation {
        path: PathBuf,
        variable: String,
        message: String,
    },

    // Service graph errors
    #[error("service {service:?} depends on {dependency:?} which does not exist")]
    MissingDependency { service: String, dependency: String },

    #[error("circular dependency detected involving service {service:?}")]
    CircularDependency { service: String },

    #[error("circular extends chain detected at service {service:?} in {file:?}")]
    CircularExtends { file: PathBuf, service: String },

    #[error("service {service:?} extends unknown service {target:?} in {file:?}")]
    UnknownExtendsTarget {
        file: PathBuf,
        service: String,
        target: String,
    },

    #[error("service {service:?} cannot take part in an extends chain and declare depends_on")]
    ExtendsWithDependsOn { service: String },

    // Image errors
    #[error("image {image:?}: {reason}")]
    Image { image: String, reason: String },

    #[error("{subject} has an invalid user {user:?}: {reason}")]
    InvalidUser {
        subject: String,
        user: String,
        reason: String,
    },

    // Container engine errors
    #[error("container engine {operation} failed: {source}")]
    Engine {
        operation: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("decoding container engine {operation} response failed: {source}")]
    EngineDecode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    // Cluster API errors
    #[error("cluster API {operation} failed: {source}")]
    Cluster {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cluster API {operation} failed with status {status}: {message}")]
    ClusterStatus {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("watch channel unexpectedly closed")]
    WatchClosed,

    #[error("unexpected watch event: {message}")]
    WatchProtocol { message: String },

    /// Expected cluster objects are missing, deleted, or of the wrong shape.
    ///
    /// Kept as a single variant so callers can recognize the condition and
    /// offer a clean retry.
    #[error("cluster resources were modified externally, please retry")]
    ResourcesModifiedExternally,

    // Pod errors
    #[error(
        "aborting because container {container} of pod {pod} terminated \
         (code={exit_code},signal={signal},reason={reason}): {message}"
    )]
    ContainerTerminated {
        pod: String,
        container: String,
        exit_code: i64,
        signal: i64,
        reason: String,
        message: String,
    },

    #[error("aborting because container {container} of pod {pod} could not pull image: {message}")]
    ImagePull {
        pod: String,
        container: String,
        message: String,
    },

    /// An error published once and observed by several waiting tasks.
    #[error("{0}")]
    Shared(Arc<SkiffError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SkiffError {
    /// True when the error is the recognizable external-modification kind,
    /// including when it arrives through a shared publication.
    pub fn is_external_modification(&self) -> bool {
        match self {
            Self::ResourcesModifiedExternally => true,
            Self::Shared(inner) => inner.is_external_modification(),
            _ => false,
        }
    }
}

impl From<Arc<SkiffError>> for SkiffError {
    fn from(err: Arc<SkiffError>) -> Self {
        Self::Shared(err)
    }
}

//! Container engine abstraction.
//!
//! The image resolver consumes the [`ContainerEngine`] trait; the bollard
//! implementation lives in [`engine`].

use crate::error::Result;
use async_trait::async_trait;

pub mod engine;
pub mod reference;
pub mod userinfo;

pub use engine::DockerEngine;
pub use reference::{ImageRef, NamedRef};
pub use userinfo::UserInfo;

/// One locally known image, as reported by the engine's image list.
#[derive(Debug, Clone, Default)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
}

/// Registry credentials for a push.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// Image and container operations the orchestrator needs from the local
/// container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List all local images, including intermediates.
    async fn list_images(&self) -> Result<Vec<ImageRecord>>;

    /// Inspect an image and return the raw response document.
    ///
    /// The healthcheck lives in fields the typed bindings do not surface
    /// uniformly across engine versions, so the caller parses the document.
    async fn inspect_image_raw(&self, image: &str) -> Result<serde_json::Value>;

    /// Pull an image and return the manifest digest reported by the engine.
    async fn pull_image(&self, reference: &str) -> Result<String>;

    /// Apply `repo:tag` to an existing image.
    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()>;

    /// Push a `repo:tag` reference and return the pushed digest.
    async fn push_image(&self, reference: &str, auth: Option<RegistryAuth>) -> Result<String>;

    /// Read one file out of an image via a short-lived container. Returns
    /// `None` when the file does not exist in the image.
    async fn read_image_file(&self, image_id: &str, path: &str) -> Result<Option<String>>;
}

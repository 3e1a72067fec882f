//! Bollard-backed implementation of the container engine client.

use super::{ContainerEngine, ImageRecord, RegistryAuth};
use crate::error::{Result, SkiffError};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, DownloadFromContainerOptions, ListImagesOptions,
    PushImageOptions, RemoveContainerOptions, TagImageOptions,
};
use futures_util::StreamExt;
use tracing::debug;

pub struct DockerEngine {
    docker: bollard::Docker,
}

impl DockerEngine {
    /// Connect to the local engine the same way the CLI does.
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|source| {
            SkiffError::Engine {
                operation: "connect".to_string(),
                source,
            }
        })?;
        Ok(DockerEngine { docker })
    }

    fn engine_error(operation: &str) -> impl Fn(bollard::errors::Error) -> SkiffError + '_ {
        move |source| SkiffError::Engine {
            operation: operation.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let opts = ListImagesOptions {
            all: true,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(opts))
            .await
            .map_err(Self::engine_error("list images"))?;
        Ok(images
            .into_iter()
            .map(|image| ImageRecord {
                id: image.id,
                repo_tags: image.repo_tags,
                repo_digests: image.repo_digests,
            })
            .collect())
    }

    async fn inspect_image_raw(&self, image: &str) -> Result<serde_json::Value> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(Self::engine_error("inspect image"))?;
        serde_json::to_value(&inspect).map_err(|source| SkiffError::EngineDecode {
            operation: "inspect image".to_string(),
            source,
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<String> {
        let opts = CreateImageOptions {
            from_image: Some(reference.to_string()),
            ..Default::default()
        };
        let mut stream = std::pin::pin!(self.docker.create_image(Some(opts), None, None));
        let mut digest = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(Self::engine_error("pull image"))?;
            if let Some(status) = info.status {
                if let Some(rest) = status.strip_prefix("Digest: ") {
                    digest = Some(rest.trim().to_string());
                } else {
                    debug!(image = reference, "{status}");
                }
            }
        }
        digest.ok_or_else(|| SkiffError::Image {
            image: reference.to_string(),
            reason: "pull finished without reporting a digest".to_string(),
        })
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<()> {
        let opts = TagImageOptions {
            repo: Some(repo.to_string()),
            tag: Some(tag.to_string()),
        };
        self.docker
            .tag_image(source, Some(opts))
            .await
            .map_err(Self::engine_error("tag image"))
    }

    async fn push_image(&self, reference: &str, auth: Option<RegistryAuth>) -> Result<String> {
        let (repo, tag) = split_repo_tag(reference);
        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username),
            password: Some(auth.password),
            serveraddress: Some(auth.server_address),
            ..Default::default()
        });
        let opts = PushImageOptions {
            tag: Some(tag.to_string()),
            ..Default::default()
        };
        let mut stream = std::pin::pin!(self.docker.push_image(repo, Some(opts), credentials));
        while let Some(item) = stream.next().await {
            let info = item.map_err(Self::engine_error("push image"))?;
            if let Some(status) = info.status {
                debug!(image = reference, "{status}");
            }
        }

        // the engine records the pushed digest on the image
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(Self::engine_error("inspect pushed image"))?;
        inspect
            .repo_digests
            .unwrap_or_default()
            .iter()
            .find_map(|entry| {
                entry
                    .strip_prefix(repo)
                    .and_then(|rest| rest.strip_prefix('@'))
                    .map(str::to_string)
            })
            .ok_or_else(|| SkiffError::Image {
                image: reference.to_string(),
                reason: "push finished without a recorded digest".to_string(),
            })
    }

    async fn read_image_file(&self, image_id: &str, path: &str) -> Result<Option<String>> {
        let body = ContainerCreateBody {
            image: Some(image_id.to_string()),
            cmd: Some(vec!["/bin/false".to_string()]),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Option::<CreateContainerOptions>::None, body)
            .await
            .map_err(Self::engine_error("create container"))?;

        let download = async {
            let mut stream = std::pin::pin!(self.docker.download_from_container(
                &created.id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            ));
            let mut archive = Vec::new();
            while let Some(chunk) = stream.next().await {
                archive
                    .extend_from_slice(&chunk.map_err(Self::engine_error("download from container"))?);
            }
            Ok::<_, SkiffError>(archive)
        }
        .await;

        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = self
            .docker
            .remove_container(&created.id, Some(remove_opts))
            .await;

        let archive = download?;
        Ok(extract_tar_entry(&archive, path))
    }
}

fn split_repo_tag(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        Some(idx) if idx > reference.rfind('/').map_or(0, |s| s) => {
            (&reference[..idx], &reference[idx + 1..])
        }
        _ => (reference, "latest"),
    }
}

/// Pull one file's contents out of a tar archive returned by the engine.
fn extract_tar_entry(archive: &[u8], path: &str) -> Option<String> {
    let wanted = path.trim_start_matches('/');
    let base = wanted.rsplit('/').next().unwrap_or(wanted);
    let mut tar = tar::Archive::new(archive);
    for entry in tar.entries().ok()? {
        let mut entry = entry.ok()?;
        let matches = {
            let entry_path = entry.path().ok()?;
            entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name == base)
        };
        if matches {
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents).ok()?;
            return Some(contents);
        }
    }
    None
}

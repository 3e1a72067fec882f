//! Per-app image resolution: local lookup, pull, tag/push, healthcheck and
//! user extraction.

use super::{App, UpRunner};
use crate::compose::Healthcheck;
use crate::config::ClusterImageStorage;
use crate::docker::reference::{parse_ref, resolve_after_pull, resolve_local_id, ImageRef};
use crate::docker::userinfo::{parse_userinfo, resolve_from_image, UserInfo};
use crate::docker::{ImageRecord, RegistryAuth};
use crate::error::{Result, SkiffError};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything pod creation needs to know about a service's image. Computed
/// at most once per app and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub source_image_id: String,
    pub pod_image: String,
    pub healthcheck: Option<Healthcheck>,
    pub user: Option<UserInfo>,
}

/// The engine's image list, fetched once and shared by every app.
pub(crate) struct LocalImages {
    pub ids: HashSet<String>,
    pub records: Vec<ImageRecord>,
}

impl UpRunner {
    pub(crate) async fn local_images(&self) -> Result<Arc<LocalImages>> {
        let result = self
            .local_images_cell
            .get_or_init(|| async {
                match self.engine.list_images().await {
                    Ok(records) => {
                        let ids = records.iter().map(|r| r.id.clone()).collect();
                        Ok(Arc::new(LocalImages { ids, records }))
                    }
                    Err(e) => Err(Arc::new(e)),
                }
            })
            .await;
        result.clone().map_err(SkiffError::Shared)
    }

    /// Resolve an app's image info, running the work at most once; later
    /// callers observe the published result, including a failure.
    pub(crate) async fn image_info(&self, app: &App) -> Result<ImageInfo> {
        let result = app
            .image_info
            .get_or_init(|| async { self.resolve_image(app).await.map_err(Arc::new) })
            .await;
        result.clone().map_err(SkiffError::Shared)
    }

    async fn resolve_image(&self, app: &App) -> Result<ImageInfo> {
        let service = &app.service;
        let image = service.image.clone().unwrap_or_default();
        if image.is_empty() {
            return Err(SkiffError::Image {
                image: service.name.clone(),
                reason: "service has no image or its image is the empty string, and building \
                         images is not supported"
                    .to_string(),
            });
        }

        let local = self.local_images().await?;
        let parsed = parse_ref(&image, &local.ids)?;
        let resolved = resolve_local_id(&parsed, &local.records);
        let (source_image_id, mut pod_image) = match (resolved, &parsed) {
            (Some(id), _) => (id, String::new()),
            (None, ImageRef::Named(named)) => {
                let reference = named.pull_reference();
                info!(service = %service.name, "pulling image {reference}");
                let digest = self.engine.pull_image(&reference).await?;
                let fresh = self.engine.list_images().await?;
                let (id, canonical) =
                    resolve_after_pull(named, &digest, &fresh).ok_or_else(|| SkiffError::Image {
                        image: image.clone(),
                        reason: "could not resolve the pulled image to a local id; images may \
                                 have been removed by an external process (please try again)"
                            .to_string(),
                    })?;
                info!(service = %service.name, "pulled image {canonical}");
                (id, canonical)
            }
            (None, ImageRef::Id(_)) => {
                return Err(SkiffError::Image {
                    image,
                    reason: "could not find image locally, and building images is not supported"
                        .to_string(),
                })
            }
        };

        match &self.cfg.cluster_image_storage {
            ClusterImageStorage::DockerRegistry { host } => {
                let repo = format!("{}/{}/{}", host, self.cfg.namespace, service.name_escaped);
                self.engine
                    .tag_image(&source_image_id, &repo, "latest")
                    .await?;
                info!(service = %service.name, "pushing image {repo}:latest");
                let auth = self.cfg.kube.token.as_ref().map(|token| RegistryAuth {
                    username: "unused".to_string(),
                    password: token.clone(),
                    server_address: host.clone(),
                });
                let digest = self
                    .engine
                    .push_image(&format!("{repo}:latest"), auth)
                    .await?;
                pod_image = format!("{repo}@{digest}");
            }
            ClusterImageStorage::Docker => {
                if pod_image.is_empty() {
                    match &parsed {
                        ImageRef::Named(_) => pod_image = image.clone(),
                        ImageRef::Id(_) => {
                            return Err(SkiffError::Image {
                                image,
                                reason: "the digest of an unnamed image is not portable across \
                                         hosts; enable pushing of images or use a named image \
                                         reference"
                                    .to_string(),
                            })
                        }
                    }
                }
            }
        }

        let raw = self.engine.inspect_image_raw(&source_image_id).await?;
        let healthcheck = parse_image_healthcheck(&image, &raw)?;
        let user = if self.opts.run_as_user {
            Some(self.resolve_user(app, &raw, &source_image_id).await?)
        } else {
            None
        };

        Ok(ImageInfo {
            source_image_id,
            pod_image,
            healthcheck,
            user,
        })
    }

    async fn resolve_user(&self, app: &App, raw: &Value, source_id: &str) -> Result<UserInfo> {
        let service = &app.service;
        let value = match &service.user {
            Some(user) => user.clone(),
            None => raw
                .pointer("/Config/User")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        };
        let mut info = parse_userinfo(&value)?;
        if info.needs_resolution() {
            resolve_from_image(self.engine.as_ref(), source_id, &mut info).await?;
        }
        Ok(info)
    }
}

/// Parse the built-in healthcheck out of a raw image inspect document.
pub fn parse_image_healthcheck(image: &str, raw: &Value) -> Result<Option<Healthcheck>> {
    let Some(raw_hc) = raw.pointer("/Config/Healthcheck") else {
        return Ok(None);
    };
    if raw_hc.is_null() {
        return Ok(None);
    }
    let malformed = |reason: &str| SkiffError::Image {
        image: image.to_string(),
        reason: format!("malformed image healthcheck: {reason}"),
    };
    let object = raw_hc
        .as_object()
        .ok_or_else(|| malformed("not an object"))?;

    let test: Vec<String> = match object.get("Test") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("test entries must be strings"))
            })
            .collect::<Result<_>>()?,
        Some(_) => return Err(malformed("test must be a list")),
    };
    if test.is_empty() || test[0] == "NONE" {
        return Ok(None);
    }

    let duration = |key: &str, default: Duration| -> Result<Duration> {
        match object.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => {
                let nanos = value
                    .as_i64()
                    .ok_or_else(|| malformed("durations must be integer nanoseconds"))?;
                if nanos <= 0 {
                    Ok(default)
                } else {
                    Ok(Duration::from_nanos(nanos as u64))
                }
            }
        }
    };

    let retries = match object.get("Retries") {
        None | Some(Value::Null) => 3,
        Some(value) => {
            let retries = value
                .as_i64()
                .ok_or_else(|| malformed("retries must be an integer"))?;
            if retries <= 0 {
                3
            } else {
                retries as u32
            }
        }
    };

    Ok(Some(Healthcheck {
        test,
        interval: duration("Interval", Duration::from_secs(30))?,
        timeout: duration("Timeout", Duration::from_secs(30))?,
        retries,
        start_period: duration("StartPeriod", Duration::ZERO)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_image_healthcheck() {
        let raw = json!({
            "Config": {
                "Healthcheck": {
                    "Test": ["CMD-SHELL", "curl -f http://localhost/"],
                    "Interval": 5_000_000_000i64,
                    "Timeout": 1_000_000_000i64,
                    "Retries": 5
                }
            }
        });
        let hc = parse_image_healthcheck("img", &raw).unwrap().unwrap();
        assert_eq!(hc.test[0], "CMD-SHELL");
        assert_eq!(hc.interval, Duration::from_secs(5));
        assert_eq!(hc.timeout, Duration::from_secs(1));
        assert_eq!(hc.retries, 5);
        assert_eq!(hc.start_period, Duration::ZERO);
    }

    #[test]
    fn test_parse_image_healthcheck_absent_or_none() {
        assert_eq!(
            parse_image_healthcheck("img", &json!({"Config": {}})).unwrap(),
            None
        );
        assert_eq!(
            parse_image_healthcheck(
                "img",
                &json!({"Config": {"Healthcheck": {"Test": ["NONE"]}}})
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_image_healthcheck_defaults() {
        let raw = json!({"Config": {"Healthcheck": {"Test": ["CMD", "true"]}}});
        let hc = parse_image_healthcheck("img", &raw).unwrap().unwrap();
        assert_eq!(hc.interval, Duration::from_secs(30));
        assert_eq!(hc.retries, 3);
    }

    #[test]
    fn test_parse_image_healthcheck_malformed() {
        let raw = json!({"Config": {"Healthcheck": {"Test": "not-a-list"}}});
        assert!(parse_image_healthcheck("img", &raw).is_err());
    }
}

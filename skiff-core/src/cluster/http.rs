//! HTTP implementation of the cluster client.
//!
//! Watches use the API server's newline-delimited JSON framing; each response
//! body is drained by a background task that forwards decoded events over a
//! channel.

use super::types::{ClusterService, ObjectList, Pod, WatchEvent};
use super::{ClusterClient, CreateOutcome, KubeConfig, LogReceiver, WatchReceiver};
use crate::error::{Result, SkiffError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct HttpClusterClient {
    http: reqwest::Client,
    base: String,
    namespace: String,
}

impl HttpClusterClient {
    pub fn new(kube: &KubeConfig, namespace: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &kube.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SkiffError::Other(anyhow::anyhow!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(kube.accept_invalid_certs)
            .build()
            .map_err(|source| SkiffError::Cluster {
                operation: "client setup".to_string(),
                source,
            })?;
        Ok(HttpClusterClient {
            http,
            base: kube.server.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/{}",
            self.base, self.namespace, resource
        )
    }

    async fn create<B: Serialize>(&self, resource: &str, body: &B) -> Result<CreateOutcome> {
        let operation = format!("create {resource}");
        let response = self
            .http
            .post(self.url(resource))
            .json(body)
            .send()
            .await
            .map_err(|source| SkiffError::Cluster {
                operation: operation.clone(),
                source,
            })?;
        match response.status() {
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            status if status.is_success() => Ok(CreateOutcome::Created),
            status => Err(status_error(operation, status, response).await),
        }
    }

    async fn list<T: DeserializeOwned + Default>(
        &self,
        resource: &str,
        label_selector: &str,
    ) -> Result<ObjectList<T>> {
        let operation = format!("list {resource}");
        let response = self
            .http
            .get(self.url(resource))
            .query(&[("labelSelector", label_selector)])
            .send()
            .await
            .map_err(|source| SkiffError::Cluster {
                operation: operation.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(operation, status, response).await);
        }
        response
            .json()
            .await
            .map_err(|source| SkiffError::Cluster { operation, source })
    }

    async fn watch<T>(
        &self,
        resource: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchReceiver<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let operation = format!("watch {resource}");
        let response = self
            .http
            .get(self.url(resource))
            .query(&[
                ("labelSelector", label_selector),
                ("watch", "true"),
                ("resourceVersion", resource_version),
            ])
            .send()
            .await
            .map_err(|source| SkiffError::Cluster {
                operation: operation.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(operation, status, response).await);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(response.bytes_stream());
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("watch stream ended: {e}");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(decode_watch_line(line)).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn delete(&self, resource: &str, name: &str) -> Result<()> {
        let operation = format!("delete {resource}/{name}");
        let response = self
            .http
            .delete(format!("{}/{}", self.url(resource), name))
            .send()
            .await
            .map_err(|source| SkiffError::Cluster {
                operation: operation.clone(),
                source,
            })?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(status_error(operation, status, response).await),
        }
    }
}

fn decode_watch_line<T: DeserializeOwned>(line: &[u8]) -> WatchEvent<T> {
    #[derive(serde::Deserialize)]
    struct RawEvent {
        #[serde(rename = "type")]
        kind: String,
        object: serde_json::Value,
    }

    let raw: RawEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(e) => return WatchEvent::Error(format!("undecodable watch event: {e}")),
    };
    let decode = |object: serde_json::Value| match serde_json::from_value::<T>(object) {
        Ok(object) => Ok(object),
        Err(e) => Err(format!("undecodable watch object: {e}")),
    };
    match raw.kind.as_str() {
        "ADDED" => decode(raw.object).map_or_else(WatchEvent::Error, WatchEvent::Added),
        "MODIFIED" => decode(raw.object).map_or_else(WatchEvent::Error, WatchEvent::Modified),
        "DELETED" => decode(raw.object).map_or_else(WatchEvent::Error, WatchEvent::Deleted),
        other => WatchEvent::Error(format!("unexpected watch event type {other:?}")),
    }
}

async fn status_error(operation: String, status: StatusCode, response: Response) -> SkiffError {
    let message = response.text().await.unwrap_or_default();
    SkiffError::ClusterStatus {
        operation,
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn create_service(&self, service: &ClusterService) -> Result<CreateOutcome> {
        self.create("services", service).await
    }

    async fn list_services(&self, label_selector: &str) -> Result<ObjectList<ClusterService>> {
        self.list("services", label_selector).await
    }

    async fn watch_services(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchReceiver<ClusterService>> {
        self.watch("services", label_selector, resource_version)
            .await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome> {
        self.create("pods", pod).await
    }

    async fn list_pods(&self, label_selector: &str) -> Result<ObjectList<Pod>> {
        self.list("pods", label_selector).await
    }

    async fn watch_pods(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchReceiver<Pod>> {
        self.watch("pods", label_selector, resource_version).await
    }

    async fn stream_logs(&self, pod_name: &str, container: &str) -> Result<LogReceiver> {
        let operation = format!("get logs for {pod_name}/{container}");
        let response = self
            .http
            .get(format!("{}/{}/log", self.url("pods"), pod_name))
            .query(&[("follow", "true"), ("container", container)])
            .send()
            .await
            .map_err(|source| SkiffError::Cluster {
                operation: operation.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(operation, status, response).await);
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = std::pin::pin!(response.bytes_stream());
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        // a broken log stream ends the tail, not the run
                        warn!("log stream read error: {e}");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            if !buffer.is_empty() {
                let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned()).await;
            }
        });
        Ok(rx)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.delete("pods", name).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.delete("services", name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_watch_line() {
        let line = br#"{"type":"ADDED","object":{"metadata":{"name":"p"}}}"#;
        match decode_watch_line::<Pod>(line) {
            WatchEvent::Added(pod) => assert_eq!(pod.metadata.name, "p"),
            other => panic!("unexpected event {other:?}"),
        }

        let line = br#"{"type":"BOOKMARK","object":{}}"#;
        assert!(matches!(
            decode_watch_line::<Pod>(line),
            WatchEvent::Error(_)
        ));

        assert!(matches!(
            decode_watch_line::<Pod>(b"not json"),
            WatchEvent::Error(_)
        ));
    }

    #[test]
    fn test_url_layout() {
        let client = HttpClusterClient::new(
            &KubeConfig {
                server: "https://cluster.example.com:6443/".to_string(),
                token: None,
                accept_invalid_certs: false,
            },
            "team-a",
        )
        .unwrap();
        assert_eq!(
            client.url("pods"),
            "https://cluster.example.com:6443/api/v1/namespaces/team-a/pods"
        );
    }
}

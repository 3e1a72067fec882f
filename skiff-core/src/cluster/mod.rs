//! Cluster API abstraction.
//!
//! The orchestrator consumes the [`ClusterClient`] trait; the real
//! implementation in [`http`] talks to the API server over HTTP. Tests drive
//! the orchestrator with channel-backed fakes.

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod http;
pub mod meta;
pub mod types;

pub use http::HttpClusterClient;
pub use types::{
    ClusterService, Container, ContainerPort, ContainerState, ContainerStateRunning,
    ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, EnvVar, ExecAction,
    HostAlias, ListMeta, ObjectList, ObjectMeta, Pod, PodCondition, PodSecurityContext, PodSpec,
    PodState, Probe, ServicePort, ServiceSpec, WatchEvent,
};

/// Connection settings for the cluster API server.
#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    pub server: String,
    pub token: Option<String>,
    pub accept_invalid_certs: bool,
}

/// Outcome of a create call; an existing object is tolerated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Watch events are delivered over a channel so a single consumer task can
/// reduce them in order.
pub type WatchReceiver<T> = mpsc::UnboundedReceiver<WatchEvent<T>>;

/// Container log lines. The channel is bounded so a blocked reader
/// back-pressures the stream.
pub type LogReceiver = mpsc::Receiver<String>;

/// Namespaced operations the orchestrator needs from the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_service(&self, service: &ClusterService) -> Result<CreateOutcome>;

    async fn list_services(&self, label_selector: &str) -> Result<ObjectList<ClusterService>>;

    async fn watch_services(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchReceiver<ClusterService>>;

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome>;

    async fn list_pods(&self, label_selector: &str) -> Result<ObjectList<Pod>>;

    async fn watch_pods(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchReceiver<Pod>>;

    /// Follow one container's log from the beginning.
    async fn stream_logs(&self, pod_name: &str, container: &str) -> Result<LogReceiver>;

    /// Delete a pod; absent pods are not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Delete a service; absent services are not an error.
    async fn delete_service(&self, name: &str) -> Result<()>;
}

//! The `up` orchestrator.
//!
//! Image resolution, virtual-IP assignment and pod creation run as
//! concurrent tasks; pod creation is gated on `depends_on` conditions and
//! driven by a single list+watch reducer so status updates stay serialized.

use crate::cluster::meta::{find_from_object_meta, fleet_selector, init_object_meta};
use crate::cluster::{
    ClusterClient, ClusterService, Container, ContainerPort, CreateOutcome, EnvVar, ExecAction,
    HostAlias, Pod, PodSecurityContext, PodSpec, Probe, ServicePort, ServiceSpec, WatchEvent,
};
use crate::compose::{Healthcheck, Healthiness, RestartPolicy};
use crate::config::Config;
use crate::docker::ContainerEngine;
use crate::error::{Result, SkiffError};
use colored::Color;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::info;

pub mod images;
pub mod logs;
pub mod status;

pub use images::ImageInfo;
pub use status::{parse_pod_status, PodStatus};

use images::LocalImages;

/// Options for one `up` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Derive the pod security context from the compose `user` or the image
    /// user.
    pub run_as_user: bool,
    /// Skip container log streaming.
    pub detach: bool,
}

type Shared<T> = std::result::Result<T, Arc<SkiffError>>;

/// Per-service state for the duration of the run.
pub(crate) struct App {
    pub service: crate::config::Service,
    pub selected: bool,
    pub color: Option<Color>,
    pub image_info: OnceCell<Shared<ImageInfo>>,
}

impl App {
    fn name(&self) -> &str {
        &self.service.name
    }

    /// A service gets a cluster virtual IP iff it declares ports.
    fn has_cluster_service(&self) -> bool {
        !self.service.ports.is_empty()
    }
}

/// Reducer-owned mutable state. Only the watch loop touches it, which keeps
/// the launch gate condition stable.
struct RunState {
    to_be_started: BTreeSet<String>,
    must_be_ready: BTreeSet<String>,
    status: BTreeMap<String, PodStatus>,
    streaming: BTreeMap<String, HashSet<String>>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl RunState {
    fn new(selected: impl IntoIterator<Item = String>) -> Self {
        RunState {
            to_be_started: selected.into_iter().collect(),
            must_be_ready: BTreeSet::new(),
            status: BTreeMap::new(),
            streaming: BTreeMap::new(),
            log_tasks: Vec::new(),
        }
    }

    fn status_of(&self, name: &str) -> PodStatus {
        self.status.get(name).copied().unwrap_or_default()
    }

    fn all_ready(&self) -> bool {
        self.must_be_ready
            .iter()
            .all(|name| self.status_of(name) >= PodStatus::Ready)
    }
}

/// Runs one `up` invocation against the cluster.
pub struct UpRunner {
    cfg: Config,
    cluster: Arc<dyn ClusterClient>,
    engine: Arc<dyn ContainerEngine>,
    opts: UpOptions,
    apps: BTreeMap<String, Arc<App>>,
    pub(crate) local_images_cell: OnceCell<Shared<Arc<LocalImages>>>,
    host_aliases_cell: OnceCell<Shared<Arc<Vec<HostAlias>>>>,
    max_name_len: usize,
}

impl UpRunner {
    pub fn new(
        cfg: Config,
        cluster: Arc<dyn ClusterClient>,
        engine: Arc<dyn ContainerEngine>,
        opts: UpOptions,
    ) -> Arc<UpRunner> {
        let selected: Vec<String> = cfg
            .services
            .keys()
            .filter(|name| cfg.matches_filter(name))
            .cloned()
            .collect();
        let colors = logs::assign_colors(selected.len());
        let mut color_by_name: BTreeMap<&String, Option<Color>> =
            selected.iter().zip(colors).collect();
        let max_name_len = selected.iter().map(|name| name.len()).max().unwrap_or(0);

        let apps = cfg
            .services
            .iter()
            .map(|(name, service)| {
                let selected = cfg.matches_filter(name);
                let app = App {
                    service: service.clone(),
                    selected,
                    color: color_by_name.remove(name).flatten(),
                    image_info: OnceCell::new(),
                };
                (name.clone(), Arc::new(app))
            })
            .collect();

        Arc::new(UpRunner {
            cfg,
            cluster,
            engine,
            opts,
            apps,
            local_images_cell: OnceCell::new(),
            host_aliases_cell: OnceCell::new(),
            max_name_len,
        })
    }

    /// Bring the selected services up and stream logs until every created
    /// pod is ready.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let selected: Vec<Arc<App>> = self
            .apps
            .values()
            .filter(|app| app.selected)
            .cloned()
            .collect();

        // begin pulling and pushing images immediately
        let mut background: Vec<JoinHandle<()>> = selected
            .iter()
            .map(|app| {
                let this = Arc::clone(&self);
                let app = Arc::clone(app);
                tokio::spawn(async move {
                    let _ = this.image_info(&app).await;
                })
            })
            .collect();

        // begin creating virtual IPs; pods need the resulting host aliases
        background.push({
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let _ = this.host_aliases().await;
            })
        });

        let mut state = RunState::new(selected.iter().map(|app| app.name().to_string()));
        let result = self.run_inner(&mut state).await;
        match result {
            Ok(()) => {
                for task in background {
                    let _ = task.await;
                }
                for task in state.log_tasks {
                    let _ = task.await;
                }
                Ok(())
            }
            Err(e) => {
                for task in background {
                    task.abort();
                }
                for task in state.log_tasks {
                    task.abort();
                }
                Err(e)
            }
        }
    }

    async fn run_inner(&self, state: &mut RunState) -> Result<()> {
        self.start_initial_pods(state).await?;
        let resource_version = self.list_pods_and_create(state).await?;
        self.watch_pods_until_ready(state, resource_version).await
    }

    /// Create pods for every selected service without dependencies.
    async fn start_initial_pods(&self, state: &mut RunState) -> Result<()> {
        for name in state.to_be_started.clone() {
            let app = Arc::clone(&self.apps[&name]);
            if !app.service.depends_on.is_empty() {
                continue;
            }
            let pod_name = self.create_pod(&app, state).await?;
            info!(
                service = %name,
                "created pod {pod_name} because all its dependency conditions are met"
            );
            state.to_be_started.remove(&name);
        }
        Ok(())
    }

    /// Seed reducer state from a fleet list, then create whatever became
    /// eligible. Returns the list's resource version for the watch.
    async fn list_pods_and_create(&self, state: &mut RunState) -> Result<String> {
        let selector = fleet_selector(&self.cfg);
        let list = self.cluster.list_pods(&selector).await?;
        for pod in &list.items {
            self.observe_pod(pod, state).await?;
        }
        self.create_pods_if_needed(state).await?;
        Ok(list.metadata.resource_version.unwrap_or_default())
    }

    async fn watch_pods_until_ready(
        &self,
        state: &mut RunState,
        resource_version: String,
    ) -> Result<()> {
        let total = state.must_be_ready.len();
        if state.all_ready() {
            info!("pods ready ({total}/{total})");
            return Ok(());
        }
        let selector = fleet_selector(&self.cfg);
        let mut watch = self
            .cluster
            .watch_pods(&selector, &resource_version)
            .await?;
        loop {
            let event = watch.recv().await.ok_or(SkiffError::WatchClosed)?;
            match event {
                WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                    self.observe_pod(&pod, state).await?;
                }
                WatchEvent::Deleted(pod) => {
                    if find_from_object_meta(&self.cfg, &pod.metadata)?.is_some() {
                        return Err(SkiffError::ResourcesModifiedExternally);
                    }
                }
                WatchEvent::Error(message) => {
                    return Err(SkiffError::WatchProtocol { message })
                }
            }
            self.create_pods_if_needed(state).await?;
            if state.all_ready() {
                break;
            }
        }
        let total = state.must_be_ready.len();
        info!("pods ready ({total}/{total})");
        Ok(())
    }

    /// Fold one pod observation into the reducer state: start log streams
    /// for newly running containers and raise the max observed status.
    async fn observe_pod(&self, pod: &Pod, state: &mut RunState) -> Result<()> {
        let Some(service) = find_from_object_meta(&self.cfg, &pod.metadata)? else {
            return Ok(());
        };
        let name = service.name.clone();
        let app = Arc::clone(&self.apps[&name]);

        if !self.opts.detach {
            for container in &pod.state.container_statuses {
                let streaming = state.streaming.entry(name.clone()).or_default();
                if container.state.running.is_some() && !streaming.contains(&container.name) {
                    streaming.insert(container.name.clone());
                    let rx = self
                        .cluster
                        .stream_logs(&pod.metadata.name, &container.name)
                        .await?;
                    state.log_tasks.push(logs::spawn_log_printer(
                        rx,
                        name.clone(),
                        app.color,
                        self.max_name_len + 3,
                    ));
                }
            }
        }

        let observed = parse_pod_status(pod)?;
        if observed > state.status_of(&name) {
            state.status.insert(name.clone(), observed);
            info!(service = %name, "pod status {observed}");
        }
        Ok(())
    }

    /// Launch every waiting app whose dependency conditions are now met.
    async fn create_pods_if_needed(&self, state: &mut RunState) -> Result<()> {
        for name in state.to_be_started.clone() {
            let app = Arc::clone(&self.apps[&name]);
            let met = app.service.depends_on.iter().all(|(dep, condition)| {
                let status = state.status_of(dep);
                match condition {
                    Healthiness::Healthy => status >= PodStatus::Ready,
                    Healthiness::Started => status >= PodStatus::Started,
                }
            });
            if !met {
                continue;
            }
            let pod_name = self.create_pod(&app, state).await?;
            let reason = format_dependency_reason(&app.service.depends_on);
            info!(service = %name, "created pod {pod_name} because {reason}");
            state.to_be_started.remove(&name);
        }
        Ok(())
    }

    /// Build and create the pod for one app. Waits for the app's image info
    /// and the shared host-alias table.
    async fn create_pod(&self, app: &App, state: &mut RunState) -> Result<String> {
        let info = self.image_info(app).await?;
        let aliases = self.host_aliases().await?;
        let pod = self.build_pod(app, &info, &aliases);
        let pod_name = pod.metadata.name.clone();
        match self.cluster.create_pod(&pod).await? {
            CreateOutcome::AlreadyExists => {
                info!(service = %app.name(), "pod {pod_name} already exists");
            }
            CreateOutcome::Created => {}
        }
        state.must_be_ready.insert(app.name().to_string());
        Ok(pod_name)
    }

    fn build_pod(&self, app: &App, info: &ImageInfo, aliases: &[HostAlias]) -> Pod {
        let service = &app.service;
        let readiness_probe = if service.healthcheck_disabled {
            None
        } else {
            service
                .healthcheck
                .as_ref()
                .or(info.healthcheck.as_ref())
                .and_then(probe_from_healthcheck)
        };
        let ports = service
            .ports
            .iter()
            .map(|port| ContainerPort {
                container_port: i32::from(port.internal),
                protocol: Some(port.protocol.uppercase().to_string()),
            })
            .collect();
        let env = service
            .environment
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        let security_context = info.user.as_ref().map(|user| PodSecurityContext {
            run_as_user: user.uid,
            run_as_group: user.gid,
        });

        Pod {
            metadata: init_object_meta(&self.cfg, service),
            spec: PodSpec {
                automount_service_account_token: Some(false),
                containers: vec![Container {
                    name: service.name_escaped.clone(),
                    image: info.pod_image.clone(),
                    image_pull_policy: Some("Always".to_string()),
                    // the compose entrypoint overrides the image entrypoint,
                    // which is what the pod `command` field does; the compose
                    // command is parsed and kept on the service but not
                    // forwarded as `args`
                    command: service.entrypoint.clone(),
                    args: None,
                    env,
                    ports,
                    working_dir: service.working_dir.clone(),
                    readiness_probe,
                }],
                host_aliases: aliases.to_vec(),
                restart_policy: Some(restart_policy(service.restart).to_string()),
                security_context,
            },
            state: Default::default(),
        }
    }

    /// Create the per-service virtual IPs and wait for their assignment,
    /// publishing the host-alias table exactly once.
    pub(crate) async fn host_aliases(&self) -> Result<Arc<Vec<HostAlias>>> {
        let result = self
            .host_aliases_cell
            .get_or_init(|| async {
                self.create_services_and_collect_aliases()
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            })
            .await;
        result.clone().map_err(SkiffError::Shared)
    }

    async fn create_services_and_collect_aliases(&self) -> Result<Vec<HostAlias>> {
        let ported: Vec<Arc<App>> = self
            .apps
            .values()
            .filter(|app| app.has_cluster_service())
            .cloned()
            .collect();
        for app in &ported {
            let service = self.build_cluster_service(app);
            let service_name = service.metadata.name.clone();
            match self.cluster.create_service(&service).await? {
                CreateOutcome::AlreadyExists => {
                    info!(service = %app.name(), "service {service_name} already exists");
                }
                CreateOutcome::Created => {
                    info!(service = %app.name(), "service {service_name} created");
                }
            }
        }
        if ported.is_empty() {
            return Ok(Vec::new());
        }

        let expected = ported.len();
        let selector = fleet_selector(&self.cfg);
        let list = self.cluster.list_services(&selector).await?;
        if list.items.len() < expected {
            return Err(SkiffError::ResourcesModifiedExternally);
        }
        let mut ips: BTreeMap<String, String> = BTreeMap::new();
        for item in &list.items {
            self.absorb_cluster_ip(item, &mut ips)?;
        }
        let mut remaining = expected - ips.len();
        info!(
            "waiting for cluster IP assignment ({}/{expected})",
            expected - remaining
        );

        if remaining > 0 {
            let resource_version = list.metadata.resource_version.unwrap_or_default();
            let mut watch = self
                .cluster
                .watch_services(&selector, &resource_version)
                .await?;
            while remaining > 0 {
                let event = watch.recv().await.ok_or(SkiffError::WatchClosed)?;
                match event {
                    WatchEvent::Added(service) | WatchEvent::Modified(service) => {
                        self.absorb_cluster_ip(&service, &mut ips)?;
                    }
                    WatchEvent::Deleted(service) => {
                        if find_from_object_meta(&self.cfg, &service.metadata)?.is_some() {
                            return Err(SkiffError::ResourcesModifiedExternally);
                        }
                    }
                    WatchEvent::Error(message) => {
                        return Err(SkiffError::WatchProtocol { message })
                    }
                }
                let now = expected - ips.len();
                if now != remaining {
                    remaining = now;
                    info!(
                        "waiting for cluster IP assignment ({}/{expected})",
                        expected - remaining
                    );
                }
            }
        }

        Ok(ported
            .iter()
            .map(|app| HostAlias {
                ip: ips[app.name()].clone(),
                hostnames: vec![app.name().to_string()],
            })
            .collect())
    }

    /// Record an observed cluster IP. Objects of a foreign fleet are
    /// ignored; a fleet object that is not a ClusterIP service means
    /// tampering.
    fn absorb_cluster_ip(
        &self,
        service: &ClusterService,
        ips: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(owner) = find_from_object_meta(&self.cfg, &service.metadata)? else {
            return Ok(());
        };
        if service.spec.kind.as_deref() != Some("ClusterIP") {
            return Err(SkiffError::ResourcesModifiedExternally);
        }
        if let Some(ip) = &service.spec.cluster_ip {
            if !ip.is_empty() {
                ips.insert(owner.name.clone(), ip.clone());
            }
        }
        Ok(())
    }

    fn build_cluster_service(&self, app: &App) -> ClusterService {
        let service = &app.service;
        let ports = service
            .ports
            .iter()
            .map(|port| ServicePort {
                name: format!("{}{}", port.protocol.as_str(), port.internal),
                port: i32::from(port.internal),
                protocol: port.protocol.uppercase().to_string(),
                target_port: i32::from(port.internal),
            })
            .collect();
        ClusterService {
            metadata: init_object_meta(&self.cfg, service),
            spec: ServiceSpec {
                cluster_ip: None,
                ports,
                selector: crate::cluster::meta::common_labels(&self.cfg, service),
                kind: Some("ClusterIP".to_string()),
            },
        }
    }
}

fn restart_policy(policy: RestartPolicy) -> &'static str {
    match policy {
        RestartPolicy::No => "Never",
        RestartPolicy::Always => "Always",
        RestartPolicy::OnFailure => "OnFailure",
        RestartPolicy::Unset => "Never",
    }
}

/// Translate a healthcheck into a readiness probe implementing the
/// `service_healthy` condition.
fn probe_from_healthcheck(healthcheck: &Healthcheck) -> Option<Probe> {
    let command = match healthcheck.test.first().map(String::as_str) {
        Some("CMD") => healthcheck.test[1..].to_vec(),
        Some("CMD-SHELL") => {
            let cmd = healthcheck.test.get(1)?;
            vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()]
        }
        _ => return None,
    };
    if command.is_empty() {
        return None;
    }
    Some(Probe {
        exec: Some(ExecAction { command }),
        initial_delay_seconds: healthcheck.start_period.as_secs() as i32,
        period_seconds: healthcheck.interval.as_secs() as i32,
        timeout_seconds: healthcheck.timeout.as_secs() as i32,
        failure_threshold: healthcheck.retries as i32,
    })
}

fn format_dependency_reason(depends_on: &BTreeMap<String, Healthiness>) -> String {
    let conditions: Vec<String> = depends_on
        .iter()
        .map(|(name, condition)| match condition {
            Healthiness::Healthy => format!("{name}: ready"),
            Healthiness::Started => format!("{name}: running"),
        })
        .collect();
    format!(
        "its dependency conditions are met ({})",
        conditions.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_restart_policy_mapping() {
        assert_eq!(restart_policy(RestartPolicy::No), "Never");
        assert_eq!(restart_policy(RestartPolicy::Always), "Always");
        assert_eq!(restart_policy(RestartPolicy::OnFailure), "OnFailure");
        assert_eq!(restart_policy(RestartPolicy::Unset), "Never");
    }

    #[test]
    fn test_probe_from_healthcheck_cmd_shell() {
        let probe = probe_from_healthcheck(&Healthcheck {
            test: vec!["CMD-SHELL".into(), "curl -f localhost".into()],
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            retries: 4,
            start_period: Duration::from_secs(7),
        })
        .unwrap();
        assert_eq!(
            probe.exec.unwrap().command,
            vec!["/bin/sh", "-c", "curl -f localhost"]
        );
        assert_eq!(probe.initial_delay_seconds, 7);
        assert_eq!(probe.period_seconds, 10);
        assert_eq!(probe.timeout_seconds, 2);
        assert_eq!(probe.failure_threshold, 4);
    }

    #[test]
    fn test_probe_from_healthcheck_cmd() {
        let probe = probe_from_healthcheck(&Healthcheck {
            test: vec!["CMD".into(), "true".into()],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::ZERO,
        })
        .unwrap();
        assert_eq!(probe.exec.unwrap().command, vec!["true"]);
    }

    #[test]
    fn test_probe_from_unsupported_test() {
        assert!(probe_from_healthcheck(&Healthcheck {
            test: vec!["NONE".into()],
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            retries: 0,
            start_period: Duration::ZERO,
        })
        .is_none());
    }

    #[test]
    fn test_format_dependency_reason() {
        let deps = BTreeMap::from([
            ("db".to_string(), Healthiness::Healthy),
            ("cache".to_string(), Healthiness::Started),
        ]);
        assert_eq!(
            format_dependency_reason(&deps),
            "its dependency conditions are met (cache: running, db: ready)"
        );
    }
}

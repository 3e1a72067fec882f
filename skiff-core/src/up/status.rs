//! Observed pod status, reduced from watch events.

use crate::cluster::Pod;
use crate::error::{Result, SkiffError};

/// The highest condition a pod has been observed in. The order matters: the
/// reducer keeps the maximum ever seen, so the value never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PodStatus {
    #[default]
    Other,
    Started,
    Completed,
    Ready,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other => write!(f, "other"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.state
        .conditions
        .iter()
        .any(|c| c.kind == "Ready" && c.status == "True")
}

/// Classify a pod. Failure states surface as errors carrying enough detail
/// for a diagnostic.
pub fn parse_pod_status(pod: &Pod) -> Result<PodStatus> {
    if is_pod_ready(pod) {
        return Ok(PodStatus::Ready);
    }
    let mut running = 0;
    for container in &pod.state.container_statuses {
        if let Some(terminated) = &container.state.terminated {
            if terminated.reason != "Completed" {
                return Err(SkiffError::ContainerTerminated {
                    pod: pod.metadata.name.clone(),
                    container: container.name.clone(),
                    exit_code: terminated.exit_code,
                    signal: terminated.signal,
                    reason: terminated.reason.clone(),
                    message: terminated.message.clone(),
                });
            }
            return Ok(PodStatus::Completed);
        }
        if let Some(waiting) = &container.state.waiting {
            if waiting.reason == "ErrImagePull" {
                return Err(SkiffError::ImagePull {
                    pod: pod.metadata.name.clone(),
                    container: container.name.clone(),
                    message: waiting.message.clone(),
                });
            }
        }
        if container.state.running.is_some() {
            running += 1;
        }
    }
    if running == pod.state.container_statuses.len() {
        Ok(PodStatus::Started)
    } else {
        Ok(PodStatus::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodCondition,
    };

    fn pod_with_container(state: ContainerState) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = "p".into();
        pod.state.container_statuses = vec![ContainerStatus {
            name: "c".into(),
            state,
        }];
        pod
    }

    #[test]
    fn test_ordering_is_monotonic() {
        assert!(PodStatus::Other < PodStatus::Started);
        assert!(PodStatus::Started < PodStatus::Completed);
        assert!(PodStatus::Completed < PodStatus::Ready);
    }

    #[test]
    fn test_ready_condition_wins() {
        let mut pod = Pod::default();
        pod.state.conditions = vec![PodCondition {
            kind: "Ready".into(),
            status: "True".into(),
        }];
        assert_eq!(parse_pod_status(&pod).unwrap(), PodStatus::Ready);
    }

    #[test]
    fn test_all_running_is_started() {
        let pod = pod_with_container(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        });
        assert_eq!(parse_pod_status(&pod).unwrap(), PodStatus::Started);
    }

    #[test]
    fn test_completed_container() {
        let pod = pod_with_container(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                signal: 0,
                reason: "Completed".into(),
                message: String::new(),
            }),
            ..Default::default()
        });
        assert_eq!(parse_pod_status(&pod).unwrap(), PodStatus::Completed);
    }

    #[test]
    fn test_terminated_failure_carries_diagnostics() {
        let pod = pod_with_container(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 137,
                signal: 9,
                reason: "OOMKilled".into(),
                message: "out of memory".into(),
            }),
            ..Default::default()
        });
        let err = parse_pod_status(&pod).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code=137"));
        assert!(message.contains("OOMKilled"));
    }

    #[test]
    fn test_image_pull_failure() {
        let pod = pod_with_container(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: "ErrImagePull".into(),
                message: "denied".into(),
            }),
            ..Default::default()
        });
        assert!(matches!(
            parse_pod_status(&pod).unwrap_err(),
            SkiffError::ImagePull { .. }
        ));
    }

    #[test]
    fn test_waiting_container_is_other() {
        let pod = pod_with_container(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: "ContainerCreating".into(),
                message: String::new(),
            }),
            ..Default::default()
        });
        assert_eq!(parse_pod_status(&pod).unwrap(), PodStatus::Other);
    }
}

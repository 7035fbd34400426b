use k8s_openapi::api::core::v1::Pod;

/// The observed lifecycle phase of an instance, derived from its pod.
///
/// `Terminating` takes precedence over the reported phase whenever the
/// pod carries a deletion timestamp; `Stopped` means no pod exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstancePhase {
    Pending,
    Running,
    Terminating,
    Stopped,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    pub fn from_pod(pod: &Pod) -> Self {
        if pod.metadata.deletion_timestamp.is_some() {
            return Self::Terminating;
        }
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_ref())
            .map(|x| x.as_str());
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some("Unknown") | None => Self::Unknown,
            Some(other) => {
                tracing::warn!(status=%other, "unhandled pod phase");
                Self::Unknown
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::Terminating)
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Terminating => "Terminating",
            Self::Stopped => "Stopped",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use super::*;

    fn pod_with_phase(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn phase_passthrough() {
        assert_eq!(
            InstancePhase::from_pod(&pod_with_phase("Running")),
            InstancePhase::Running
        );
        assert_eq!(
            InstancePhase::from_pod(&pod_with_phase("Pending")),
            InstancePhase::Pending
        );
    }

    #[test]
    fn deletion_timestamp_wins_over_phase() {
        let mut pod = pod_with_phase("Running");
        pod.metadata = ObjectMeta {
            deletion_timestamp: Some(Time(chrono::Utc::now())),
            ..Default::default()
        };
        assert_eq!(InstancePhase::from_pod(&pod), InstancePhase::Terminating);
    }

    #[test]
    fn missing_status_is_unknown() {
        assert_eq!(
            InstancePhase::from_pod(&Pod::default()),
            InstancePhase::Unknown
        );
    }
}

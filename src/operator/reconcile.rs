//! Reconcile handler: one instance declaration in, one sandbox pod out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};

use crate::client::Client;
use crate::resources::{
    self, FullName, ResourceSpec, WhistlerInstance, WhistlerTemplateSpec,
};
use crate::store;

pub struct Context {
    pub client: Client,
    /// Namespace searched for system templates when the instance's own
    /// namespace does not hold the referenced template.
    pub system_namespace: String,
}

/// Reconciliation failure taxonomy. Transient variants are requeued with
/// a bounded delay by [`error_policy`]; everything else surfaces and
/// stops until the object changes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("template {0} not present yet")]
    TemplateMissing(String),
    #[error("pod {0} is terminating")]
    PodTerminating(String),
    #[error("instance {0} has no namespace")]
    MissingNamespace(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error(transparent)]
    Cluster(#[from] kube::Error),
}

pub async fn reconcile(
    instance: Arc<WhistlerInstance>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = instance.name_any();

    // Deletion needs no handler: the owner reference on the pod makes
    // garbage collection cascade.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    let owner = instance.spec.owner.clone();

    tracing::debug!(instance=%name, user=%owner, "reconciling instance");

    // Prerequisites: namespace with isolation policy, per-user claim.
    store::ensure_user_isolation(&ctx.client, &owner)
        .await
        .map_err(|err| Error::Bootstrap(format!("{:#}", err)))?;
    let claim_name = ensure_user_claim(&ctx.client, &owner, &namespace).await?;

    let template = resolve_template(&ctx, &namespace, &instance.spec.template_ref).await?;

    let pod = build_instance_pod(&instance, &template, &claim_name)?;
    match ctx.client.pod_create(&namespace, &pod).await {
        Ok(_) => {
            tracing::info!(instance=%name, user=%owner, "instance pod created");
        }
        Err(kube::Error::Api(ref err)) if err.code == 409 => {
            // Do not race the garbage collection of a dying pod.
            let existing = ctx.client.pod_opt(&namespace, &name).await?;
            if let Some(existing) = existing {
                if existing.metadata.deletion_timestamp.is_some() {
                    return Err(Error::PodTerminating(name));
                }
            }
            tracing::debug!(instance=%name, "instance pod already exists");
        }
        Err(err) => return Err(err.into()),
    }

    Ok(Action::await_change())
}

pub fn error_policy(
    instance: Arc<WhistlerInstance>,
    err: &Error,
    _ctx: Arc<Context>,
) -> Action {
    match err {
        Error::TemplateMissing(_) => Action::requeue(Duration::from_secs(10)),
        Error::PodTerminating(_) => Action::requeue(Duration::from_secs(2)),
        _ => {
            tracing::error!(instance=%instance.name_any(), error=%err, "reconciliation failed");
            Action::await_change()
        }
    }
}

/// Read the referenced template, falling back to the system namespace
/// for shared templates. A template that cannot be found anywhere is a
/// transient condition: it may simply not have been written yet.
async fn resolve_template(
    ctx: &Context,
    namespace: &str,
    template_ref: &str,
) -> Result<WhistlerTemplateSpec, Error> {
    if let Some(t) = ctx.client.template_opt(namespace, template_ref).await? {
        return Ok(t.spec);
    }
    if namespace != ctx.system_namespace {
        if let Some(t) = ctx
            .client
            .template_opt(&ctx.system_namespace, template_ref)
            .await?
        {
            return Ok(t.spec);
        }
    }
    Err(Error::TemplateMissing(template_ref.to_string()))
}

/// Make sure the per-user data claim exists. A pre-existing claim is
/// accepted as-is.
async fn ensure_user_claim(
    client: &Client,
    owner: &str,
    namespace: &str,
) -> Result<String, Error> {
    let claim_name = resources::user_claim_name(owner);
    if client.volume_claim_opt(namespace, &claim_name).await?.is_none() {
        client
            .volume_claim_create(namespace, &build_user_claim(owner, namespace))
            .await?;
        tracing::info!(claim=%claim_name, user=%owner, "user data claim created");
    }
    Ok(claim_name)
}

fn build_user_claim(owner: &str, namespace: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(resources::user_claim_name(owner)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), "whistler".to_string()),
                ("user".to_string(), owner.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("10Gi".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Construct the sandbox pod for an instance.
///
/// The container runs a long-lived placeholder process; the interactive
/// work is attached through the exec subresource. The owner reference
/// ties the pod's lifetime to the instance declaration.
fn build_instance_pod(
    instance: &WhistlerInstance,
    template: &WhistlerTemplateSpec,
    claim_name: &str,
) -> Result<Pod, Error> {
    let name = instance.name_any();
    let owner = &instance.spec.owner;
    let owner_ref = instance
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Bootstrap(format!("instance {} has no uid", name)))?;

    let hostname = FullName::from_qualified(name.clone())
        .short(owner)
        .as_str()
        .to_string();

    let labels = BTreeMap::from([
        (
            resources::POD_APP_LABEL.0.to_string(),
            resources::POD_APP_LABEL.1.to_string(),
        ),
        (resources::POD_INSTANCE_LABEL.to_string(), name.clone()),
        (resources::POD_USER_LABEL.to_string(), owner.clone()),
    ]);

    let container = Container {
        name: "main".to_string(),
        image: Some(template.image.clone()),
        command: Some(vec!["sleep".to_string(), "3600".to_string()]),
        resources: build_resource_requirements(&template.resources),
        volume_mounts: Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let spec = PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        node_selector: if template.node_selector.is_empty() {
            None
        } else {
            Some(template.node_selector.clone())
        },
        hostname: Some(hostname),
        priority_class_name: instance
            .spec
            .preemptible
            .then(|| resources::PREEMPTIBLE_PRIORITY_CLASS.to_string()),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: instance.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Cpu and memory are mirrored into requests and limits; gpu is emitted
/// only as an `nvidia.com/gpu` limit.
fn build_resource_requirements(res: &ResourceSpec) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    if let Some(cpu) = &res.cpu {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &res.memory {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(gpu) = &res.gpu {
        limits.insert("nvidia.com/gpu".to_string(), Quantity(gpu.clone()));
    }

    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use crate::resources::WhistlerInstanceSpec;

    use super::*;

    fn test_instance(preemptible: bool) -> WhistlerInstance {
        let mut instance = WhistlerInstance::new(
            "alice-dev1",
            WhistlerInstanceSpec {
                owner: "alice".to_string(),
                template_ref: "small".to_string(),
                preemptible,
            },
        );
        instance.metadata.namespace = Some("whistler-user-alice".to_string());
        instance.metadata.uid = Some("0000-1111".to_string());
        instance
    }

    fn test_template() -> WhistlerTemplateSpec {
        WhistlerTemplateSpec {
            owner: "system".to_string(),
            image: "ubuntu:22.04".to_string(),
            resources: ResourceSpec {
                cpu: Some("500m".to_string()),
                memory: Some("512Mi".to_string()),
                gpu: None,
            },
            node_selector: BTreeMap::from([(
                "kubernetes.io/arch".to_string(),
                "amd64".to_string(),
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn pod_carries_contract_labels_and_owner_ref() {
        let pod =
            build_instance_pod(&test_instance(false), &test_template(), "whistler-data-alice")
                .unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("alice-dev1"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("whistler-instance"));
        assert_eq!(labels.get("instance").map(String::as_str), Some("alice-dev1"));
        assert_eq!(labels.get("user").map(String::as_str), Some("alice"));
        let owners = pod.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "WhistlerInstance");
        assert_eq!(owners[0].name, "alice-dev1");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn pod_hostname_is_the_short_name() {
        let pod =
            build_instance_pod(&test_instance(false), &test_template(), "whistler-data-alice")
                .unwrap();
        assert_eq!(
            pod.spec.as_ref().unwrap().hostname.as_deref(),
            Some("dev1")
        );
    }

    #[test]
    fn pod_mounts_data_claim_and_placeholder_command() {
        let pod =
            build_instance_pod(&test_instance(false), &test_template(), "whistler-data-alice")
                .unwrap();
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(container.name, "main");
        assert_eq!(container.image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(
            container.command,
            Some(vec!["sleep".to_string(), "3600".to_string()])
        );
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/data");
        let volumes = spec.volumes.unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "whistler-data-alice"
        );
        assert_eq!(
            spec.node_selector.unwrap().get("kubernetes.io/arch").map(String::as_str),
            Some("amd64")
        );
    }

    #[test]
    fn preemptible_sets_priority_class() {
        let pod =
            build_instance_pod(&test_instance(true), &test_template(), "whistler-data-alice")
                .unwrap();
        assert_eq!(
            pod.spec.unwrap().priority_class_name.as_deref(),
            Some("whistler-preemptible")
        );
        let pod =
            build_instance_pod(&test_instance(false), &test_template(), "whistler-data-alice")
                .unwrap();
        assert_eq!(pod.spec.unwrap().priority_class_name, None);
    }

    #[test]
    fn cpu_and_memory_mirror_into_requests_and_limits() {
        let reqs = build_resource_requirements(&ResourceSpec {
            cpu: Some("500m".to_string()),
            memory: Some("512Mi".to_string()),
            gpu: None,
        })
        .unwrap();
        let requests = reqs.requests.unwrap();
        let limits = reqs.limits.unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("500m".to_string())));
        assert_eq!(limits.get("cpu"), Some(&Quantity("500m".to_string())));
        assert_eq!(requests.get("memory"), Some(&Quantity("512Mi".to_string())));
        assert_eq!(limits.get("memory"), Some(&Quantity("512Mi".to_string())));
    }

    #[test]
    fn gpu_is_limit_only() {
        let reqs = build_resource_requirements(&ResourceSpec {
            cpu: None,
            memory: None,
            gpu: Some("1".to_string()),
        })
        .unwrap();
        assert!(reqs.requests.is_none());
        assert_eq!(
            reqs.limits.unwrap().get("nvidia.com/gpu"),
            Some(&Quantity("1".to_string()))
        );
    }

    #[test]
    fn empty_resources_yield_no_requirements() {
        assert!(build_resource_requirements(&ResourceSpec::default()).is_none());
    }

    #[test]
    fn claim_is_read_write_once_ten_gi() {
        let claim = build_user_claim("alice", "whistler-user-alice");
        assert_eq!(claim.metadata.name.as_deref(), Some("whistler-data-alice"));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap().get("storage"),
            Some(&Quantity("10Gi".to_string()))
        );
    }
}

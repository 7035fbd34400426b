//! Typed facade over the declarative template and instance records in
//! the cluster, joined with live pod state.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::client::{self, Client};
use crate::operator::InstancePhase;
use crate::resources::{
    self, FullName, ResourceSpec, ShortName, WhistlerInstance, WhistlerInstanceSpec,
    WhistlerTemplate, WhistlerTemplateSpec,
};
use crate::AnyError;

/// Where a template comes from: shared system catalog or user-owned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateSource {
    System,
    User,
}

impl std::fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User => f.write_str("user"),
        }
    }
}

/// A template as shown to one user: display name stripped of the owner
/// prefix, full name retained for references.
#[derive(Clone, Debug)]
pub struct TemplateSummary {
    pub name: String,
    pub full_name: String,
    pub source: TemplateSource,
    pub image: String,
    pub description: Option<String>,
    pub resources: ResourceSpec,
    pub node_selector: BTreeMap<String, String>,
    pub personal_mount_path: String,
    pub volumes: BTreeMap<String, String>,
}

/// One mounted volume of a running pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    pub name: String,
    pub mount_path: String,
}

/// An instance declaration enriched with live pod state.
#[derive(Clone, Debug)]
pub struct InstanceSummary {
    /// Short, per-owner name.
    pub name: String,
    pub full_name: String,
    pub template_ref: String,
    pub status: InstancePhase,
    pub pod_name: Option<String>,
    pub ip: Option<String>,
    /// Observed mounts of the first container, secrets mounts excluded.
    /// `None` when no pod exists.
    pub mounts: Option<Vec<MountInfo>>,
    pub preemptible: bool,
}

/// Input for creating or updating a user template.
#[derive(Clone, Debug, Default)]
pub struct TemplateInput {
    pub name: String,
    pub image: String,
    pub description: Option<String>,
    pub resources: ResourceSpec,
    pub node_selector: BTreeMap<String, String>,
    pub personal_mount_path: Option<String>,
    pub volumes: BTreeMap<String, String>,
}

/// Thin typed view over the cluster records. Owns no durable state;
/// every operation is a single logical round-trip and retry is the
/// caller's policy.
#[derive(Clone)]
pub struct InstanceStore {
    client: Client,
    system_namespace: String,
}

impl InstanceStore {
    pub fn new(client: Client, system_namespace: String) -> Self {
        Self {
            client,
            system_namespace,
        }
    }

    /// All templates visible to `owner`: system templates from the
    /// system namespace plus the templates in the owner's namespace,
    /// sorted system-first.
    pub async fn list_templates(&self, owner: &str) -> Result<Vec<TemplateSummary>, AnyError> {
        let system = self
            .client
            .templates_all(&self.system_namespace)
            .await
            .context("Could not list system templates")?;
        let user = self
            .client
            .templates_all(&resources::user_namespace(owner))
            .await
            .context("Could not list user templates")?;
        Ok(template_rows(owner, system, user))
    }

    pub async fn find_template(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<TemplateSummary>, AnyError> {
        let templates = self.list_templates(owner).await?;
        Ok(templates.into_iter().find(|t| t.name == name))
    }

    /// All instances of `owner`, joined with their pods by the
    /// `instance` label.
    pub async fn list_instances(&self, owner: &str) -> Result<Vec<InstanceSummary>, AnyError> {
        let ns = resources::user_namespace(owner);
        let instances = self
            .client
            .instances_all(&ns)
            .await
            .context("Could not list instances")?;
        let pods = self
            .client
            .pods_by_label(&ns, &format!("{}={}", resources::POD_USER_LABEL, owner))
            .await
            .context("Could not list instance pods")?;
        Ok(join_instances(owner, instances, &pods))
    }

    pub async fn find_instance(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Option<InstanceSummary>, AnyError> {
        let instances = self.list_instances(owner).await?;
        Ok(instances.into_iter().find(|i| i.name == name))
    }

    /// Write a new instance declaration after making sure the owner's
    /// namespace and isolation policy exist. A name conflict reports
    /// failure; the caller decides what to do with it.
    pub async fn create_instance(
        &self,
        owner: &str,
        template_ref: &str,
        name: &ShortName,
        preemptible: bool,
    ) -> Result<bool, AnyError> {
        ensure_user_isolation(&self.client, owner).await?;

        let full = FullName::compose(owner, name);
        let instance = WhistlerInstance::new(
            full.as_str(),
            WhistlerInstanceSpec {
                owner: owner.to_string(),
                template_ref: template_ref.to_string(),
                preemptible,
            },
        );
        let ns = resources::user_namespace(owner);
        match self.client.instance_create(&ns, &instance).await {
            Ok(_) => {
                tracing::info!(user=%owner, instance=%full, "instance created");
                Ok(true)
            }
            Err(kube::Error::Api(ref err)) if err.code == 409 => {
                tracing::warn!(user=%owner, instance=%full, "instance already exists");
                Ok(false)
            }
            Err(err) => Err(err).context("Could not create instance"),
        }
    }

    /// Create or replace a template in the owner's namespace. Replacing
    /// carries the stored `resourceVersion` to guard against lost
    /// updates.
    pub async fn save_template(&self, owner: &str, input: TemplateInput) -> Result<bool, AnyError> {
        if input.name.is_empty() || input.image.is_empty() {
            return Ok(false);
        }
        ensure_user_isolation(&self.client, owner).await?;

        let full = FullName::compose(owner, &ShortName::new(input.name.clone()));
        let mut template = WhistlerTemplate::new(
            full.as_str(),
            WhistlerTemplateSpec {
                owner: owner.to_string(),
                image: input.image,
                description: input.description,
                resources: input.resources,
                node_selector: input.node_selector,
                personal_mount_path: input
                    .personal_mount_path
                    .unwrap_or_else(|| "/userdata".to_string()),
                volumes: input.volumes,
            },
        );

        let ns = resources::user_namespace(owner);
        let existing = self
            .client
            .template_opt(&ns, full.as_str())
            .await
            .context("Could not check for existing template")?;
        let res = match existing {
            Some(old) => {
                template.metadata.resource_version = old.resource_version();
                self.client
                    .template_replace(&ns, full.as_str(), &template)
                    .await
            }
            None => self.client.template_create(&ns, &template).await,
        };
        match res {
            Ok(_) => {
                tracing::info!(user=%owner, template=%full, "template saved");
                Ok(true)
            }
            Err(kube::Error::Api(ref err)) if err.code == 409 => Ok(false),
            Err(err) => Err(err).context("Could not save template"),
        }
    }

    /// Delete an instance declaration; the pod follows through garbage
    /// collection.
    pub async fn delete_instance(&self, owner: &str, name: &ShortName) -> Result<bool, AnyError> {
        let full = FullName::compose(owner, name);
        let ns = resources::user_namespace(owner);
        match self.client.instance_delete(&ns, full.as_str()).await {
            Ok(()) => {
                tracing::info!(user=%owner, instance=%full, "instance deleted");
                Ok(true)
            }
            Err(kube::Error::Api(ref err)) if err.code == 404 => Ok(false),
            Err(err) => Err(err).context("Could not delete instance"),
        }
    }

    /// Nudge the reconciler without changing the instance spec.
    pub async fn annotate_instance(
        &self,
        owner: &str,
        name: &ShortName,
        key: &str,
        value: &str,
    ) -> Result<(), AnyError> {
        let full = FullName::compose(owner, name);
        let ns = resources::user_namespace(owner);
        self.client
            .instance_annotate(&ns, full.as_str(), key, value)
            .await
            .context("Could not annotate instance")
    }
}

/// Make sure the owner's namespace and its deny-all-ingress policy
/// exist. Pre-existing objects are accepted.
pub async fn ensure_user_isolation(client: &Client, owner: &str) -> Result<(), AnyError> {
    let ns_name = resources::user_namespace(owner);

    if client.namespace_opt(&ns_name).await?.is_none() {
        client
            .namespace_create(&build_user_namespace(owner))
            .await
            .context("Could not create user namespace")?;
        tracing::info!(namespace=%ns_name, user=%owner, "user namespace created");
    }

    if client
        .network_policy_opt(&ns_name, resources::ISOLATION_POLICY_NAME)
        .await?
        .is_none()
    {
        client
            .network_policy_create(&ns_name, &build_isolation_policy(&ns_name))
            .await
            .context("Could not create isolation policy")?;
        tracing::info!(namespace=%ns_name, "isolation policy created");
    }

    Ok(())
}

pub fn build_user_namespace(owner: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(resources::user_namespace(owner)),
            labels: Some(BTreeMap::from([
                ("whistler.io/user".to_string(), owner.to_string()),
                ("whistler.io/managed".to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A policy that selects every pod in the namespace and admits no
/// ingress at all.
pub fn build_isolation_policy(namespace: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(resources::ISOLATION_POLICY_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(Vec::new()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Merge system and user-namespace templates into display rows.
fn template_rows(
    owner: &str,
    system: Vec<WhistlerTemplate>,
    user: Vec<WhistlerTemplate>,
) -> Vec<TemplateSummary> {
    let mut rows = Vec::new();

    for t in system {
        if t.spec.owner == resources::SYSTEM_OWNER {
            rows.push(summarize_template(owner, t, TemplateSource::System));
        }
    }
    for t in user {
        if t.spec.owner == resources::SYSTEM_OWNER {
            rows.push(summarize_template(owner, t, TemplateSource::System));
        } else if t.spec.owner == owner {
            rows.push(summarize_template(owner, t, TemplateSource::User));
        }
    }

    rows.sort_by(|a, b| a.source.cmp(&b.source).then_with(|| a.name.cmp(&b.name)));
    rows
}

fn summarize_template(
    owner: &str,
    template: WhistlerTemplate,
    source: TemplateSource,
) -> TemplateSummary {
    let full_name = template.name_any();
    let name = match source {
        TemplateSource::User => FullName::from_qualified(full_name.clone())
            .short(owner)
            .as_str()
            .to_string(),
        TemplateSource::System => full_name.clone(),
    };
    TemplateSummary {
        name,
        full_name,
        source,
        image: template.spec.image,
        description: template.spec.description,
        resources: template.spec.resources,
        node_selector: template.spec.node_selector,
        personal_mount_path: template.spec.personal_mount_path,
        volumes: template.spec.volumes,
    }
}

/// Join instance declarations with the pods carrying their label.
fn join_instances(
    owner: &str,
    instances: Vec<WhistlerInstance>,
    pods: &[Pod],
) -> Vec<InstanceSummary> {
    let pod_map: HashMap<&str, &Pod> = pods
        .iter()
        .filter_map(|p| {
            p.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(resources::POD_INSTANCE_LABEL))
                .map(|name| (name.as_str(), p))
        })
        .collect();

    instances
        .into_iter()
        .map(|inst| {
            let full_name = inst.name_any();
            let short = FullName::from_qualified(full_name.clone()).short(owner);
            let pod = pod_map.get(full_name.as_str());
            let (status, pod_name, ip, mounts) = match pod {
                Some(pod) => (
                    InstancePhase::from_pod(pod),
                    Some(client::pod_name(pod).to_string()),
                    client::pod_ip(pod),
                    Some(visible_mounts(pod)),
                ),
                None => (InstancePhase::Stopped, None, None, None),
            };
            InstanceSummary {
                name: short.as_str().to_string(),
                full_name,
                template_ref: inst.spec.template_ref,
                status,
                pod_name,
                ip,
                mounts,
                preemptible: inst.spec.preemptible,
            }
        })
        .collect()
}

/// Volume mounts of the first container, minus service-account secrets.
fn visible_mounts(pod: &Pod) -> Vec<MountInfo> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.volume_mounts.as_ref())
        .map(|mounts| {
            mounts
                .iter()
                .filter(|m| !m.mount_path.starts_with(resources::SECRETS_MOUNT_PREFIX))
                .map(|m| MountInfo {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, VolumeMount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn template(name: &str, owner: &str) -> WhistlerTemplate {
        WhistlerTemplate::new(
            name,
            WhistlerTemplateSpec {
                owner: owner.to_string(),
                image: "ubuntu:22.04".to_string(),
                ..Default::default()
            },
        )
    }

    fn instance(name: &str, owner: &str, template_ref: &str) -> WhistlerInstance {
        WhistlerInstance::new(
            name,
            WhistlerInstanceSpec {
                owner: owner.to_string(),
                template_ref: template_ref.to_string(),
                preemptible: false,
            },
        )
    }

    fn pod(instance_label: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(instance_label.to_string()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "whistler-instance".to_string()),
                    ("instance".to_string(), instance_label.to_string()),
                    ("user".to_string(), "alice".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "data".to_string(),
                            mount_path: "/data".to_string(),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "kube-api-access".to_string(),
                            mount_path: "/var/run/secrets/kubernetes.io/serviceaccount"
                                .to_string(),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.0.0.7".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn templates_sort_system_first_and_strip_prefix() {
        let rows = template_rows(
            "alice",
            vec![template("small", "system")],
            vec![template("alice-custom", "alice")],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "small");
        assert_eq!(rows[0].source, TemplateSource::System);
        assert_eq!(rows[1].name, "custom");
        assert_eq!(rows[1].full_name, "alice-custom");
        assert_eq!(rows[1].source, TemplateSource::User);
    }

    #[test]
    fn foreign_user_templates_are_invisible() {
        let rows = template_rows("alice", vec![], vec![template("bob-secret", "bob")]);
        assert!(rows.is_empty());
    }

    #[test]
    fn join_attaches_pod_state() {
        let rows = join_instances(
            "alice",
            vec![instance("alice-dev1", "alice", "small")],
            &[pod("alice-dev1", "Running")],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "dev1");
        assert_eq!(rows[0].full_name, "alice-dev1");
        assert_eq!(rows[0].status, InstancePhase::Running);
        assert_eq!(rows[0].pod_name.as_deref(), Some("alice-dev1"));
        assert_eq!(rows[0].ip.as_deref(), Some("10.0.0.7"));
        let mounts = rows[0].mounts.as_ref().unwrap();
        assert_eq!(
            mounts,
            &vec![MountInfo {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
            }]
        );
    }

    #[test]
    fn missing_pod_means_stopped() {
        let rows = join_instances("alice", vec![instance("alice-dev1", "alice", "small")], &[]);
        assert_eq!(rows[0].status, InstancePhase::Stopped);
        assert!(rows[0].pod_name.is_none());
        assert!(rows[0].mounts.is_none());
    }

    #[test]
    fn deletion_timestamp_reports_terminating() {
        let mut p = pod("alice-dev1", "Running");
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let rows = join_instances(
            "alice",
            vec![instance("alice-dev1", "alice", "small")],
            &[p],
        );
        assert_eq!(rows[0].status, InstancePhase::Terminating);
    }

    #[test]
    fn isolation_policy_denies_all_ingress() {
        let policy = build_isolation_policy("whistler-user-alice");
        let spec = policy.spec.unwrap();
        assert_eq!(spec.pod_selector, LabelSelector::default());
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
        assert_eq!(spec.ingress, Some(Vec::new()));
    }

    #[test]
    fn user_namespace_carries_ownership_labels() {
        let ns = build_user_namespace("alice");
        assert_eq!(ns.metadata.name.as_deref(), Some("whistler-user-alice"));
        let labels = ns.metadata.labels.unwrap();
        assert_eq!(labels.get("whistler.io/user").map(String::as_str), Some("alice"));
        assert_eq!(labels.get("whistler.io/managed").map(String::as_str), Some("true"));
    }
}

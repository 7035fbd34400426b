//! Custom resource declarations and the naming scheme shared by the
//! gateway, the store and the operator.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label applied to every reconciled sandbox pod.
pub const POD_APP_LABEL: (&str, &str) = ("app", "whistler-instance");
/// Pod label carrying the owning instance `fullName`.
pub const POD_INSTANCE_LABEL: &str = "instance";
/// Pod label carrying the owning username.
pub const POD_USER_LABEL: &str = "user";

/// Annotation the gateway writes to nudge a reconcile without changing
/// the instance spec.
pub const LAST_CONNECT_ANNOTATION: &str = "whistler.io/last-connect";

/// Name of the deny-all-ingress policy in every user namespace.
pub const ISOLATION_POLICY_NAME: &str = "isolate-user-pods";

/// Priority class assigned to preemptible instance pods.
pub const PREEMPTIBLE_PRIORITY_CLASS: &str = "whistler-preemptible";

/// Mount paths under this prefix are never shown to users.
pub const SECRETS_MOUNT_PREFIX: &str = "/var/run/secrets";

/// Owner value marking a template as a shared system template.
pub const SYSTEM_OWNER: &str = "system";

/// A container blueprint that instances reference.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "whistler.io",
    version = "v1",
    kind = "WhistlerTemplate",
    plural = "whistlertemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WhistlerTemplateSpec {
    /// `"system"` or the owning username.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// OCI image the sandbox container runs.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Node placement constraints, label key to value.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Where the user's personal volume is advertised to be mounted.
    #[serde(default = "default_personal_mount_path")]
    pub personal_mount_path: String,
    /// Additional declared volumes, name to mount path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
}

fn default_owner() -> String {
    SYSTEM_OWNER.to_string()
}

fn default_personal_mount_path() -> String {
    "/userdata".to_string()
}

/// A declarative request for one running sandbox.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "whistler.io",
    version = "v1",
    kind = "WhistlerInstance",
    plural = "whistlerinstances",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WhistlerInstanceSpec {
    /// The owning username.
    pub owner: String,
    /// `fullName` of the referenced template.
    pub template_ref: String,
    #[serde(default)]
    pub preemptible: bool,
}

/// Requested sandbox resources. Cpu and memory are mirrored into both
/// requests and limits; gpu only ever becomes a limit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

/// The user-visible, per-owner unique name of a template or instance.
///
/// Kept distinct from [`FullName`] so prefix stripping happens in exactly
/// one place.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortName(String);

impl ShortName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShortName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The cluster-unique object name `{owner}-{shortName}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FullName(String);

impl FullName {
    pub fn compose(owner: &str, short: &ShortName) -> Self {
        Self(format!("{}-{}", owner, short.as_str()))
    }

    /// Wrap a name that is already fully qualified.
    pub fn from_qualified(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strip the `{owner}-` prefix. Names not carrying the prefix are
    /// returned unchanged (system templates are not owner-prefixed).
    pub fn short(&self, owner: &str) -> ShortName {
        let prefix = format!("{}-", owner);
        match self.0.strip_prefix(&prefix) {
            Some(rest) => ShortName::new(rest),
            None => ShortName::new(self.0.clone()),
        }
    }
}

impl std::fmt::Display for FullName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The isolated namespace holding one user's templates, instances, pods
/// and data volume.
pub fn user_namespace(owner: &str) -> String {
    format!("whistler-user-{}", owner)
}

/// Name of the per-user persistent volume claim.
pub fn user_claim_name(owner: &str) -> String {
    format!("whistler-data-{}", owner)
}

/// Eight hex characters, used for session-scoped socket paths and
/// ephemeral instance names.
pub fn random_suffix() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_composition() {
        let full = FullName::compose("alice", &ShortName::new("dev1"));
        assert_eq!(full.as_str(), "alice-dev1");
        assert_eq!(full.short("alice").as_str(), "dev1");
    }

    #[test]
    fn short_name_survives_embedded_dashes() {
        let full = FullName::compose("alice", &ShortName::new("small-1a2b3c4d"));
        assert_eq!(full.as_str(), "alice-small-1a2b3c4d");
        assert_eq!(full.short("alice").as_str(), "small-1a2b3c4d");
    }

    #[test]
    fn unprefixed_names_pass_through() {
        let full = FullName::from_qualified("small");
        assert_eq!(full.short("alice").as_str(), "small");
    }

    #[test]
    fn namespace_and_claim_names() {
        assert_eq!(user_namespace("alice"), "whistler-user-alice");
        assert_eq!(user_claim_name("alice"), "whistler-data-alice");
    }

    #[test]
    fn random_suffix_is_eight_hex_chars() {
        let s = random_suffix();
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

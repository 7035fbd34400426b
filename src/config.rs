//! Application configuration and the static catalogs consumed by the
//! gateway: registered users, node selectors, and named volumes.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::AnyError;

const DEFAULT_SYSTEM_NAMESPACE: &str = "whistler";
const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Runtime settings of the gateway.
///
/// Paths and ports are fixed by deployment convention; the environment
/// only toggles the dev auth bypass and the system namespace.
#[derive(Clone, Debug)]
pub struct Settings {
    /// TCP port the SSH listener binds on all interfaces.
    pub listen_port: u16,
    /// Persisted host key, generated on first start if absent.
    pub host_key_path: PathBuf,
    /// Namespace holding system templates.
    pub system_namespace: String,
    /// When true, password auth is offered and accepts anything.
    pub auth_allow_any: bool,
    pub users_path: PathBuf,
    pub selectors_path: PathBuf,
    pub volumes_path: PathBuf,
    /// Candidate locations of the bundled static socat binary.
    pub socat_bundle_paths: Vec<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            listen_port: 8022,
            host_key_path: PathBuf::from("ssh_host_key"),
            system_namespace: system_namespace_from_env(),
            auth_allow_any: std::env::var("WHISTLER_AUTH_ALLOW_ANY").as_deref() == Ok("true"),
            users_path: PathBuf::from("/etc/whistler/users.yaml"),
            selectors_path: PathBuf::from("/etc/whistler-config/selectors.yaml"),
            volumes_path: PathBuf::from("/etc/whistler-config/volumes.yaml"),
            socat_bundle_paths: vec![
                PathBuf::from("/app/bin/socat-static"),
                PathBuf::from("bin/socat-static"),
            ],
        }
    }
}

/// Resolve the namespace that holds system templates: `POD_NAMESPACE`,
/// then the mounted service account, then the default.
fn system_namespace_from_env() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(ns) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH) {
        let ns = ns.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    DEFAULT_SYSTEM_NAMESPACE.to_string()
}

pub type Username = String;

/// A single registered user account.
#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: Username,
    /// Authorized key lines, `<algo> <base64-body> [comment]`.
    #[serde(default)]
    pub public_keys: Vec<String>,
}

/// The registered users and their SSH public keys.
///
/// Immutable for the gateway's lifetime; reloaded only on restart.
#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct UserDirectory {
    #[serde(default)]
    pub users: Vec<User>,
}

impl UserDirectory {
    pub fn load(path: &Path) -> Result<Self, AnyError> {
        if !path.exists() {
            tracing::warn!(path=%path.display(), "users file not found, starting with empty directory");
            return Ok(Self::default());
        }
        let content = std::fs::read(path).context("Could not read users file")?;
        serde_yaml::from_slice(&content).context("Could not deserialize users file")
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Verify that the offered key body belongs to the user. Keys are
    /// compared by their base64 body, ignoring algorithm and comment.
    pub fn key_matches(&self, name: &str, offered_base64: &str) -> bool {
        let Some(user) = self.get(name) else {
            return false;
        };
        user.public_keys
            .iter()
            .filter_map(|line| key_body(line))
            .any(|body| body == offered_base64)
    }
}

/// Extract the base64 body from an authorized-keys line.
fn key_body(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    let first = fields.next()?;
    // Tolerate bare bodies without an algorithm prefix.
    match fields.next() {
        Some(body) => Some(body),
        None => Some(first),
    }
}

/// A node-placement option surfaced in the menu.
#[derive(serde::Deserialize, Clone, Debug)]
pub struct Selector {
    pub name: String,
    /// Node label key the selector sets.
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct SelectorCatalog {
    #[serde(default)]
    pub selectors: Vec<Selector>,
}

impl SelectorCatalog {
    pub fn load(path: &Path) -> Result<Self, AnyError> {
        load_catalog(path, "selectors")
    }
}

/// A named volume that templates may mount.
#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDef {
    pub name: String,
    pub mount_path: String,
}

#[derive(serde::Deserialize, Clone, Debug, Default)]
pub struct VolumeCatalog {
    #[serde(default)]
    pub volumes: Vec<VolumeDef>,
}

impl VolumeCatalog {
    pub fn load(path: &Path) -> Result<Self, AnyError> {
        load_catalog(path, "volumes")
    }
}

fn load_catalog<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
    what: &str,
) -> Result<T, AnyError> {
    if !path.exists() {
        tracing::debug!(path=%path.display(), "{} catalog not found, using empty catalog", what);
        return Ok(T::default());
    }
    let content =
        std::fs::read(path).with_context(|| format!("Could not read {} catalog", what))?;
    serde_yaml::from_slice(&content)
        .with_context(|| format!("Could not deserialize {} catalog", what))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn key_body_extraction() {
        assert_eq!(
            key_body("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 alice@laptop"),
            Some("AAAAC3NzaC1lZDI1NTE5")
        );
        assert_eq!(
            key_body("ssh-rsa AAAAB3NzaC1yc2E="),
            Some("AAAAB3NzaC1yc2E=")
        );
        assert_eq!(key_body("AAAAB3NzaC1yc2E="), Some("AAAAB3NzaC1yc2E="));
        assert_eq!(key_body("   "), None);
    }

    #[test]
    fn key_matching_ignores_comment() {
        let dir = UserDirectory {
            users: vec![User {
                name: "alice".into(),
                public_keys: vec!["ssh-ed25519 Zm9vYmFy alice@laptop".into()],
            }],
        };
        assert!(dir.key_matches("alice", "Zm9vYmFy"));
        assert!(!dir.key_matches("alice", "b3RoZXI="));
        assert!(!dir.key_matches("mallory", "Zm9vYmFy"));
    }

    #[test]
    fn users_file_round_trip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "users:\n  - name: alice\n    publicKeys:\n      - ssh-ed25519 Zm9vYmFy alice@laptop"
        )
        .unwrap();
        let dir = UserDirectory::load(f.path()).unwrap();
        assert_eq!(dir.users.len(), 1);
        assert!(dir.key_matches("alice", "Zm9vYmFy"));
    }

    #[test]
    fn missing_files_yield_empty_catalogs() {
        let dir = UserDirectory::load(Path::new("/nonexistent/users.yaml")).unwrap();
        assert!(dir.users.is_empty());
        let sel = SelectorCatalog::load(Path::new("/nonexistent/selectors.yaml")).unwrap();
        assert!(sel.selectors.is_empty());
        let vol = VolumeCatalog::load(Path::new("/nonexistent/volumes.yaml")).unwrap();
        assert!(vol.volumes.is_empty());
    }

    #[test]
    fn volume_catalog_parses_mount_paths() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "volumes:\n  - name: datasets\n    mountPath: /mnt/datasets"
        )
        .unwrap();
        let cat = VolumeCatalog::load(f.path()).unwrap();
        assert_eq!(cat.volumes[0].name, "datasets");
        assert_eq!(cat.volumes[0].mount_path, "/mnt/datasets");
    }
}

//! Message-of-the-day composition. Emitted once, fully, before any
//! shell byte reaches the channel.

use crate::resources::SECRETS_MOUNT_PREFIX;
use crate::store::{InstanceSummary, TemplateSummary};

const BANNER: &str = r"********************************************************************
*   __        ___   _ ___ ____ _____ _     _____ ____              *
*   \ \      / / | | |_ _/ ___|_   _| |   | ____|  _ \             *
*    \ \ /\ / /| |_| || |\___ \ | | | |   |  _| | |_) |            *
*     \ V  V / |  _  || | ___) || | | |___| |___|  _ <             *
*      \_/\_/  |_| |_|___|____/ |_| |_____|_____|_| \_\            *
********************************************************************";

const DEFAULT_PERSONAL_MOUNT: &str = "/userdata";

/// Build the banner block for a bound session. CRLF line endings
/// throughout, terminated by a final CRLF.
pub(crate) fn build_motd(
    instance: &InstanceSummary,
    template: Option<&TemplateSummary>,
    ephemeral: bool,
) -> String {
    let mut lines: Vec<String> = BANNER.lines().map(str::to_string).collect();

    lines.push(format!(
        "Welcome to Whistler. You are connected to {}",
        instance.name
    ));

    let personal_mount = template
        .map(|t| t.personal_mount_path.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PERSONAL_MOUNT.to_string());
    lines.push(format!(
        "and your user directory is mounted under {}",
        personal_mount
    ));

    let volume_lines = volume_lines(instance, template, &personal_mount);
    if !volume_lines.is_empty() {
        lines.push("Mounted volumes are".to_string());
        lines.extend(volume_lines);
        lines.push(String::new());
    }

    if ephemeral {
        lines.push(
            "This instance is ephemeral and will be terminated once you close the connection."
                .to_string(),
        );
        lines.push(
            "Make sure to save any work to mounted persistent volumes before exiting."
                .to_string(),
        );
        lines.push(String::new());
    }

    if instance.preemptible {
        lines.push(
            "This instance is preemptible, it can terminate without warning at any time."
                .to_string(),
        );
        lines.push("Plan accordingly.".to_string());
        lines.push(String::new());
    }

    lines.join("\r\n") + "\r\n"
}

/// The pod's observed mounts are the source of truth; the template's
/// declared volumes plus the personal mount are the fallback when pod
/// details are unavailable.
fn volume_lines(
    instance: &InstanceSummary,
    template: Option<&TemplateSummary>,
    personal_mount: &str,
) -> Vec<String> {
    match &instance.mounts {
        Some(mounts) => mounts
            .iter()
            .filter(|m| !m.mount_path.starts_with(SECRETS_MOUNT_PREFIX))
            .map(|m| format!("* {} - {}", m.name, m.mount_path))
            .collect(),
        None => {
            let mut lines = vec![format!("* User Volume - {}", personal_mount)];
            if let Some(template) = template {
                for (name, path) in &template.volumes {
                    lines.push(format!("* {} - {}", name, path));
                }
            }
            lines
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::operator::InstancePhase;
    use crate::store::{MountInfo, TemplateSource};

    use super::*;

    fn instance(mounts: Option<Vec<MountInfo>>, preemptible: bool) -> InstanceSummary {
        InstanceSummary {
            name: "dev1".to_string(),
            full_name: "alice-dev1".to_string(),
            template_ref: "small".to_string(),
            status: InstancePhase::Running,
            pod_name: Some("alice-dev1".to_string()),
            ip: Some("10.0.0.7".to_string()),
            mounts,
            preemptible,
        }
    }

    fn template() -> TemplateSummary {
        TemplateSummary {
            name: "small".to_string(),
            full_name: "small".to_string(),
            source: TemplateSource::System,
            image: "ubuntu:22.04".to_string(),
            description: None,
            resources: Default::default(),
            node_selector: BTreeMap::new(),
            personal_mount_path: "/userdata".to_string(),
            volumes: BTreeMap::from([("datasets".to_string(), "/mnt/datasets".to_string())]),
        }
    }

    #[test]
    fn uses_crlf_line_endings_throughout() {
        let motd = build_motd(&instance(None, false), Some(&template()), false);
        assert!(motd.ends_with("\r\n"));
        assert!(!motd.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn observed_mounts_take_precedence() {
        let motd = build_motd(
            &instance(
                Some(vec![MountInfo {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                }]),
                false,
            ),
            Some(&template()),
            false,
        );
        assert!(motd.contains("* data - /data\r\n"));
        assert!(!motd.contains("/mnt/datasets"));
    }

    #[test]
    fn falls_back_to_template_volumes() {
        let motd = build_motd(&instance(None, false), Some(&template()), false);
        assert!(motd.contains("* User Volume - /userdata\r\n"));
        assert!(motd.contains("* datasets - /mnt/datasets\r\n"));
    }

    #[test]
    fn secrets_mounts_are_hidden() {
        let motd = build_motd(
            &instance(
                Some(vec![
                    MountInfo {
                        name: "data".to_string(),
                        mount_path: "/data".to_string(),
                    },
                    MountInfo {
                        name: "kube-api-access".to_string(),
                        mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
                    },
                ]),
                false,
            ),
            None,
            false,
        );
        assert!(motd.contains("* data - /data\r\n"));
        assert!(!motd.contains("serviceaccount"));
    }

    #[test]
    fn notices_follow_session_flags() {
        let plain = build_motd(&instance(None, false), None, false);
        assert!(!plain.contains("ephemeral"));
        assert!(!plain.contains("preemptible"));

        let ephemeral = build_motd(&instance(None, false), None, true);
        assert!(ephemeral.contains("This instance is ephemeral"));

        let preemptible = build_motd(&instance(None, true), None, false);
        assert!(preemptible.contains("This instance is preemptible"));
    }

    #[test]
    fn welcome_references_the_short_name() {
        let motd = build_motd(&instance(None, false), None, false);
        assert!(motd.contains("You are connected to dev1"));
    }
}

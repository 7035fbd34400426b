//! Line-oriented management console for menu-mode logins.
//!
//! The full-screen chrome lives elsewhere; this console covers the
//! management operations: inspecting templates, instances and the
//! static catalogs, creating and deleting instances, and saving user
//! templates. All mutations go through the instance store.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::resources::ShortName;
use crate::store::{InstanceSummary, TemplateInput, TemplateSummary};

use super::{resize, AppContext};

const PROMPT: &str = "whistler> ";

/// Terminal abstraction the console renders through. The session layer
/// owns the raw channel; the console only ever sees this interface.
#[async_trait::async_trait]
pub(crate) trait TerminalBackend: Send {
    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    /// Inform the terminal of new dimensions.
    async fn post_resize(&mut self, width: u16, height: u16) -> std::io::Result<()>;
    /// Clear the screen and move the cursor home.
    async fn enter_app_mode(&mut self) -> std::io::Result<()>;
    /// Reset attributes before handing the terminal back.
    async fn leave_app_mode(&mut self) -> std::io::Result<()>;
}

pub(crate) struct ChannelTerminal<W> {
    writer: W,
}

impl<W> ChannelTerminal<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl<W> TerminalBackend for ChannelTerminal<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    async fn post_resize(&mut self, width: u16, height: u16) -> std::io::Result<()> {
        // The console renders into the scrollback, so nothing needs a
        // redraw; the client already reflows what it displays.
        tracing::trace!(width = width, height = height, "console terminal resized");
        Ok(())
    }

    async fn enter_app_mode(&mut self) -> std::io::Result<()> {
        self.write(b"\x1b[2J\x1b[H").await
    }

    async fn leave_app_mode(&mut self) -> std::io::Result<()> {
        self.write(b"\x1b[0m").await
    }
}

enum Flow {
    Continue,
    Quit,
}

/// Drive the console until the user quits or the channel closes.
pub(crate) async fn run<B, R>(
    mut backend: B,
    mut input: R,
    resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
    ctx: Arc<AppContext>,
    owner: String,
) where
    B: TerminalBackend,
    R: AsyncRead + Send + Unpin,
{
    // Window-change bursts are coalesced exactly like the shell path;
    // the survivors land on the backend.
    let (size_tx, mut size_rx) = mpsc::unbounded_channel();
    let coalescer = tokio::spawn(resize::coalesce(resize_rx, move |size| {
        let size_tx = size_tx.clone();
        async move {
            let _ = size_tx.send(size);
        }
    }));

    let _ = backend.enter_app_mode().await;
    let _ = write_lines(
        &mut backend,
        &[
            format!("Whistler management console. Signed in as {}.", owner),
            "Type 'help' for available commands.".to_string(),
            String::new(),
        ],
    )
    .await;
    let _ = backend.write(PROMPT.as_bytes()).await;

    let mut line = String::new();
    let mut buf = [0u8; 256];

    'session: loop {
        tokio::select! {
            res = input.read(&mut buf) => {
                let n = match res {
                    Ok(0) | Err(_) => break 'session,
                    Ok(n) => n,
                };
                for &byte in &buf[..n] {
                    match byte {
                        // Ctrl-C / Ctrl-D leave the console.
                        0x03 | 0x04 => break 'session,
                        b'\r' | b'\n' => {
                            let _ = backend.write(b"\r\n").await;
                            let command = std::mem::take(&mut line);
                            match execute(&mut backend, &ctx, &owner, command.trim()).await {
                                Flow::Quit => break 'session,
                                Flow::Continue => {
                                    let _ = backend.write(PROMPT.as_bytes()).await;
                                }
                            }
                        }
                        0x7f | 0x08 => {
                            if line.pop().is_some() {
                                let _ = backend.write(b"\x08 \x08").await;
                            }
                        }
                        byte if (0x20..=0x7e).contains(&byte) => {
                            line.push(byte as char);
                            let _ = backend.write(&[byte]).await;
                        }
                        _ => {}
                    }
                }
            }
            Some((width, height)) = size_rx.recv() => {
                let _ = backend.post_resize(width, height).await;
            }
        }
    }

    coalescer.abort();
    let _ = backend.leave_app_mode().await;
}

async fn execute<B: TerminalBackend>(
    backend: &mut B,
    ctx: &AppContext,
    owner: &str,
    command: &str,
) -> Flow {
    let mut parts = command.split_whitespace();
    match parts.next() {
        None => Flow::Continue,
        Some("help") => {
            let _ = write_lines(
                backend,
                &[
                    "Commands:".to_string(),
                    "  templates                                list visible templates".to_string(),
                    "  instances                                list your instances".to_string(),
                    "  selectors                                list node selectors".to_string(),
                    "  volumes                                  list mountable volumes".to_string(),
                    "  start <template> <name>                  create an instance".to_string(),
                    "  delete <name>                            delete an instance".to_string(),
                    "  save-template <name> <image> [cpu] [mem] save a user template".to_string(),
                    "  quit                                     leave the console".to_string(),
                ],
            )
            .await;
            Flow::Continue
        }
        Some("templates") => {
            match ctx.store.list_templates(owner).await {
                Ok(templates) => {
                    let _ = write_lines(backend, &template_rows(&templates)).await;
                }
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu template listing failed");
                    let _ = write_lines(backend, &["Error: could not list templates".to_string()])
                        .await;
                }
            }
            Flow::Continue
        }
        Some("instances") => {
            match ctx.store.list_instances(owner).await {
                Ok(instances) => {
                    let _ = write_lines(backend, &instance_rows(&instances)).await;
                }
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu instance listing failed");
                    let _ = write_lines(backend, &["Error: could not list instances".to_string()])
                        .await;
                }
            }
            Flow::Continue
        }
        Some("selectors") => {
            let mut lines = vec![format!("{:<20} {:<30} VALUES", "NAME", "KEY")];
            for s in &ctx.selectors.selectors {
                lines.push(format!("{:<20} {:<30} {}", s.name, s.key, s.values.join(",")));
            }
            let _ = write_lines(backend, &lines).await;
            Flow::Continue
        }
        Some("volumes") => {
            let mut lines = vec![format!("{:<20} MOUNT PATH", "NAME")];
            for v in &ctx.volumes.volumes {
                lines.push(format!("{:<20} {}", v.name, v.mount_path));
            }
            let _ = write_lines(backend, &lines).await;
            Flow::Continue
        }
        Some("start") => {
            let (template, name) = match (parts.next(), parts.next()) {
                (Some(t), Some(n)) => (t.to_string(), n.to_string()),
                _ => {
                    let _ =
                        write_lines(backend, &["Usage: start <template> <name>".to_string()]).await;
                    return Flow::Continue;
                }
            };
            let template_ref = match ctx.store.find_template(owner, &template).await {
                Ok(Some(t)) => t.full_name,
                Ok(None) => {
                    let _ = write_lines(
                        backend,
                        &[format!("Template {} not found", template)],
                    )
                    .await;
                    return Flow::Continue;
                }
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu template lookup failed");
                    let _ =
                        write_lines(backend, &["Error: could not resolve template".to_string()])
                            .await;
                    return Flow::Continue;
                }
            };
            let created = ctx
                .store
                .create_instance(owner, &template_ref, &ShortName::new(name.clone()), false)
                .await;
            let message = match created {
                Ok(true) => format!(
                    "Instance {} created. Connect with ssh {}-{}@<gateway>.",
                    name, owner, name
                ),
                Ok(false) => format!("Instance {} already exists", name),
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu instance creation failed");
                    "Error: could not create instance".to_string()
                }
            };
            let _ = write_lines(backend, &[message]).await;
            Flow::Continue
        }
        Some("delete") => {
            let Some(name) = parts.next() else {
                let _ = write_lines(backend, &["Usage: delete <name>".to_string()]).await;
                return Flow::Continue;
            };
            let message = match ctx
                .store
                .delete_instance(owner, &ShortName::new(name.to_string()))
                .await
            {
                Ok(true) => format!("Instance {} deleted", name),
                Ok(false) => format!("Instance {} not found", name),
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu instance deletion failed");
                    "Error: could not delete instance".to_string()
                }
            };
            let _ = write_lines(backend, &[message]).await;
            Flow::Continue
        }
        Some("save-template") => {
            let (name, image) = match (parts.next(), parts.next()) {
                (Some(n), Some(i)) => (n.to_string(), i.to_string()),
                _ => {
                    let _ = write_lines(
                        backend,
                        &["Usage: save-template <name> <image> [cpu] [memory]".to_string()],
                    )
                    .await;
                    return Flow::Continue;
                }
            };
            let mut input = TemplateInput {
                name: name.clone(),
                image,
                ..Default::default()
            };
            input.resources.cpu = parts.next().map(str::to_string);
            input.resources.memory = parts.next().map(str::to_string);

            let message = match ctx.store.save_template(owner, input).await {
                Ok(true) => format!("Template {} saved", name),
                Ok(false) => format!("Could not save template {}", name),
                Err(err) => {
                    tracing::error!(user=%owner, error=?err, "menu template save failed");
                    "Error: could not save template".to_string()
                }
            };
            let _ = write_lines(backend, &[message]).await;
            Flow::Continue
        }
        Some("quit") | Some("exit") => Flow::Quit,
        Some(other) => {
            let _ = write_lines(
                backend,
                &[format!("Unknown command '{}'. Type 'help'.", other)],
            )
            .await;
            Flow::Continue
        }
    }
}

async fn write_lines<B: TerminalBackend>(backend: &mut B, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        backend.write(line.as_bytes()).await?;
        backend.write(b"\r\n").await?;
    }
    Ok(())
}

fn template_rows(templates: &[TemplateSummary]) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<20} {:<8} {:<30} {:<8} {:<8} GPU",
        "NAME", "SOURCE", "IMAGE", "CPU", "MEMORY"
    )];
    for t in templates {
        rows.push(format!(
            "{:<20} {:<8} {:<30} {:<8} {:<8} {}",
            t.name,
            t.source.to_string(),
            t.image,
            t.resources.cpu.as_deref().unwrap_or("-"),
            t.resources.memory.as_deref().unwrap_or("-"),
            t.resources.gpu.as_deref().unwrap_or("-"),
        ));
    }
    rows
}

fn instance_rows(instances: &[InstanceSummary]) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<20} {:<20} {:<12} {:<24} IP",
        "NAME", "TEMPLATE", "STATUS", "POD"
    )];
    for i in instances {
        rows.push(format!(
            "{:<20} {:<20} {:<12} {:<24} {}",
            i.name,
            i.template_ref,
            i.status.to_string(),
            i.pod_name.as_deref().unwrap_or("-"),
            i.ip.as_deref().unwrap_or("-"),
        ));
    }
    rows
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::operator::InstancePhase;
    use crate::resources::ResourceSpec;
    use crate::store::TemplateSource;

    use super::*;

    #[test]
    fn template_table_lists_every_row() {
        let rows = template_rows(&[TemplateSummary {
            name: "small".to_string(),
            full_name: "small".to_string(),
            source: TemplateSource::System,
            image: "ubuntu:22.04".to_string(),
            description: None,
            resources: ResourceSpec {
                cpu: Some("500m".to_string()),
                memory: Some("512Mi".to_string()),
                gpu: None,
            },
            node_selector: BTreeMap::new(),
            personal_mount_path: "/userdata".to_string(),
            volumes: BTreeMap::new(),
        }]);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("NAME"));
        assert!(rows[1].contains("small"));
        assert!(rows[1].contains("system"));
        assert!(rows[1].contains("ubuntu:22.04"));
        assert!(rows[1].contains("500m"));
    }

    #[test]
    fn instance_table_shows_status_and_pod() {
        let rows = instance_rows(&[InstanceSummary {
            name: "dev1".to_string(),
            full_name: "alice-dev1".to_string(),
            template_ref: "small".to_string(),
            status: InstancePhase::Running,
            pod_name: Some("alice-dev1".to_string()),
            ip: Some("10.0.0.7".to_string()),
            mounts: None,
            preemptible: false,
        }]);
        assert_eq!(rows.len(), 2);
        assert!(rows[1].contains("dev1"));
        assert!(rows[1].contains("Running"));
        assert!(rows[1].contains("10.0.0.7"));
    }
}

//! Per-session coordination: mode dispatch, pod readiness, shell I/O
//! and teardown.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::{self, ExecStream};
use crate::resources::{self, ShortName};
use crate::store::InstanceSummary;
use crate::AnyError;

use super::{agent, menu, motd, resize, AppContext, Login, Target};

const POLL_PERIOD: Duration = Duration::from_millis(500);
const READINESS_DEADLINE: Duration = Duration::from_secs(60);
/// Grace period that lets the client render the MOTD (and the agent
/// bridge come up) before shell bytes follow.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Terminal parameters from the client's pty request.
#[derive(Clone, Debug)]
pub(crate) struct TermParams {
    pub term: String,
    pub width: u16,
    pub height: u16,
}

/// Negotiated agent forwarding paths for one session.
#[derive(Clone, Debug)]
pub(crate) struct AgentForward {
    /// Gateway-side socket bridged to the client's agent.
    pub gateway_path: PathBuf,
    /// Scratch socket path mirrored into the pod.
    pub pod_socket_path: String,
}

/// State shared between the connection handler and the coordinator
/// task: forward authorization and ephemeral cleanup both outlive the
/// happy path.
#[derive(Default)]
pub(crate) struct SessionShared {
    pub active_instance: Option<String>,
    pub ephemeral: Option<String>,
}

pub(crate) struct SessionCoordinator {
    ctx: Arc<AppContext>,
    login: Login,
    term: Option<TermParams>,
    agent: Option<AgentForward>,
    shared: Arc<Mutex<SessionShared>>,
    handle: Handle,
    channel_id: ChannelId,
    agent_task: Option<tokio::task::JoinHandle<()>>,
}

/// Run a coordinator until it finishes or the connection goes away.
/// Cleanup runs on every path; the exit status is only reported on
/// orderly completion.
pub(crate) async fn drive(
    mut coordinator: SessionCoordinator,
    channel: Channel<Msg>,
    resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
    cancel: CancellationToken,
) {
    let exit_code = tokio::select! {
        code = coordinator.run(channel, resize_rx) => Some(code),
        _ = cancel.cancelled() => {
            tracing::debug!("session cancelled by connection teardown");
            None
        }
    };

    coordinator.cleanup().await;

    if let Some(code) = exit_code {
        let _ = coordinator
            .handle
            .exit_status_request(coordinator.channel_id, code)
            .await;
        let _ = coordinator.handle.eof(coordinator.channel_id).await;
        let _ = coordinator.handle.close(coordinator.channel_id).await;
    }
}

/// Bridge a direct-tcpip channel to a byte mover inside the pod.
pub(crate) async fn run_forward_tunnel(channel: Channel<Msg>, exec: ExecStream) {
    let ExecStream {
        mut stdin,
        mut stdout,
        stderr,
        ..
    } = exec;
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line=%line, "forward tunnel stderr");
            }
        });
    }
    let stream = channel.into_stream();
    let (mut from_client, mut to_client) = tokio::io::split(stream);

    tokio::select! {
        res = tokio::io::copy(&mut from_client, &mut stdin) => {
            tracing::debug!(result=?res, "forward client side closed");
        }
        res = tokio::io::copy(&mut stdout, &mut to_client) => {
            tracing::debug!(result=?res, "forward pod side closed");
        }
    }
    let _ = stdin.shutdown().await;
    let _ = to_client.shutdown().await;
}

struct SessionIo<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> SessionIo<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<(), AnyError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) {
        let _ = self.send(format!("{}\r\n", line).as_bytes()).await;
    }
}

impl SessionCoordinator {
    pub fn new(
        ctx: Arc<AppContext>,
        login: Login,
        term: Option<TermParams>,
        agent: Option<AgentForward>,
        shared: Arc<Mutex<SessionShared>>,
        handle: Handle,
        channel_id: ChannelId,
    ) -> Self {
        Self {
            ctx,
            login,
            term,
            agent,
            shared,
            handle,
            channel_id,
            agent_task: None,
        }
    }

    async fn run(
        &mut self,
        channel: Channel<Msg>,
        resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
    ) -> u32 {
        let stream = channel.into_stream();
        let (reader, writer) = tokio::io::split(stream);
        let mut io = SessionIo { reader, writer };

        match self.login.target.clone() {
            Target::Menu => self.run_menu(io, resize_rx).await,
            Target::Instance(name) => {
                self.run_instance(&mut io, resize_rx, ShortName::new(name), false)
                    .await
            }
            Target::Template(name) => self.run_template(&mut io, resize_rx, name).await,
        }
    }

    async fn run_menu<R, W>(
        &mut self,
        io: SessionIo<R, W>,
        resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
    ) -> u32
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let SessionIo { reader, writer } = io;
        let backend = menu::ChannelTerminal::new(writer);
        menu::run(
            backend,
            reader,
            resize_rx,
            self.ctx.clone(),
            self.login.owner.clone(),
        )
        .await;
        0
    }

    /// Template mode: mint an ephemeral instance and connect to it. The
    /// minted name is registered for cleanup before anything that can
    /// fail or be cancelled.
    async fn run_template<R, W>(
        &mut self,
        io: &mut SessionIo<R, W>,
        resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
        template: String,
    ) -> u32
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let owner = self.login.owner.clone();
        let name = ShortName::new(format!("{}-{}", template, resources::random_suffix()));
        self.shared.lock().unwrap().ephemeral = Some(name.as_str().to_string());

        let template_ref = match self.ctx.store.find_template(&owner, &template).await {
            Ok(Some(t)) => t.full_name,
            // The reconciler retries unresolved references, so pass the
            // raw name through rather than failing here.
            Ok(None) => template.clone(),
            Err(err) => {
                tracing::error!(user=%owner, template=%template, error=?err, "template lookup failed");
                io.send_line("Failed to create ephemeral instance.").await;
                return 1;
            }
        };

        io.send_line(&format!(
            "Creating ephemeral instance {} (full name: {}-{}) from template {}...",
            name, owner, name, template
        ))
        .await;

        match self
            .ctx
            .store
            .create_instance(&owner, &template_ref, &name, true)
            .await
        {
            Ok(true) => self.run_instance(io, resize_rx, name, true).await,
            Ok(false) => {
                io.send_line("Failed to create ephemeral instance.").await;
                1
            }
            Err(err) => {
                tracing::error!(user=%owner, error=?err, "ephemeral instance creation failed");
                io.send_line("Failed to create ephemeral instance.").await;
                1
            }
        }
    }

    async fn run_instance<R, W>(
        &mut self,
        io: &mut SessionIo<R, W>,
        resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
        name: ShortName,
        ephemeral: bool,
    ) -> u32
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let owner = self.login.owner.clone();

        let instance = match self.resolve_ready_instance(io, &name).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                io.send_line(&format!("Failed to start instance {}.", name)).await;
                return 1;
            }
            Err(err) => {
                tracing::error!(user=%owner, instance=%name, error=?err, "instance resolution failed");
                io.send_line(&format!("Error: {:#}", err)).await;
                return 1;
            }
        };
        let Some(pod_name) = instance.pod_name.clone() else {
            io.send_line(&format!("Failed to start instance {}.", name)).await;
            return 1;
        };

        // From here on the session is bound; forwards may attach.
        self.shared.lock().unwrap().active_instance = Some(name.as_str().to_string());

        if let Some(agent_cfg) = self.agent.clone() {
            let namespace = resources::user_namespace(&owner);
            self.agent_task = Some(tokio::spawn(agent::bridge_agent(
                self.ctx.clone(),
                namespace,
                pod_name.clone(),
                agent_cfg,
            )));
            tokio::time::sleep(SETTLE_DELAY).await;
        }

        // The MOTD must be fully on the wire before any shell byte.
        let template = match self.ctx.store.list_templates(&owner).await {
            Ok(templates) => templates
                .into_iter()
                .find(|t| t.full_name == instance.template_ref || t.name == instance.template_ref),
            Err(err) => {
                tracing::warn!(user=%owner, error=?err, "template lookup for motd failed");
                None
            }
        };
        let banner = motd::build_motd(&instance, template.as_ref(), ephemeral);
        if io.send(banner.as_bytes()).await.is_err() {
            return 0;
        }
        tokio::time::sleep(SETTLE_DELAY).await;

        match self.run_shell(io, resize_rx, &pod_name).await {
            Ok(code) => code,
            Err(err) => {
                // Runtime failures end the session cleanly.
                tracing::warn!(user=%owner, pod=%pod_name, error=?err, "shell ended with error");
                0
            }
        }
    }

    /// Resolve the instance and wait until its pod is running, nudging
    /// the reconciler when needed. `Ok(None)` means the 60 s readiness
    /// deadline passed.
    async fn resolve_ready_instance<R, W>(
        &self,
        io: &mut SessionIo<R, W>,
        name: &ShortName,
    ) -> Result<Option<InstanceSummary>, AnyError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let owner = &self.login.owner;
        let mut instance = self.ctx.store.find_instance(owner, name.as_str()).await?;

        // A terminating pod must be gone before a fresh one can bind
        // the data volume.
        if matches!(&instance, Some(i) if i.status.is_terminating()) {
            let _ = io.send(b"Waiting for existing pod to terminate ").await;
            while matches!(&instance, Some(i) if i.status.is_terminating()) {
                tokio::time::sleep(POLL_PERIOD).await;
                let _ = io.send(b".").await;
                instance = self.ctx.store.find_instance(owner, name.as_str()).await?;
            }
            let _ = io.send(b"\r\n").await;
        }

        match instance {
            Some(ref i) if i.status.is_running() && i.pod_name.is_some() => Ok(instance),
            Some(_) | None => {
                let ts = chrono::Utc::now().timestamp().to_string();
                if let Err(err) = self
                    .ctx
                    .store
                    .annotate_instance(owner, name, resources::LAST_CONNECT_ANNOTATION, &ts)
                    .await
                {
                    tracing::warn!(user=%owner, instance=%name, error=?err, "could not annotate instance");
                }
                self.wait_for_running(io, name).await
            }
        }
    }

    /// Poll the store until the pod reports `Running`, emitting status
    /// transitions and progress dots.
    async fn wait_for_running<R, W>(
        &self,
        io: &mut SessionIo<R, W>,
        name: &ShortName,
    ) -> Result<Option<InstanceSummary>, AnyError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let owner = &self.login.owner;
        let start = tokio::time::Instant::now();
        let mut last_status: Option<String> = None;

        while start.elapsed() < READINESS_DEADLINE {
            if let Some(instance) = self.ctx.store.find_instance(owner, name.as_str()).await? {
                if instance.status.is_running() && instance.pod_name.is_some() {
                    if last_status.is_some() {
                        let _ = io.send(b"\r\n").await;
                    }
                    return Ok(Some(instance));
                }
                let status = instance.status.to_string();
                if last_status.as_deref() != Some(status.as_str()) {
                    if last_status.is_some() {
                        let _ = io.send(b"\r\n").await;
                    }
                    let _ = io
                        .send(format!("Instance status: {} ", status).as_bytes())
                        .await;
                    last_status = Some(status);
                } else {
                    let _ = io.send(b".").await;
                }
            }
            tokio::time::sleep(POLL_PERIOD).await;
        }

        if last_status.is_some() {
            let _ = io.send(b"\r\n").await;
        }
        Ok(None)
    }

    /// Exec `/bin/bash` in the pod and stream it to the channel until
    /// either side closes. Clean shutdown reports exit code 0.
    async fn run_shell<R, W>(
        &mut self,
        io: &mut SessionIo<R, W>,
        resize_rx: mpsc::UnboundedReceiver<(u16, u16)>,
        pod_name: &str,
    ) -> Result<u32, AnyError>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let namespace = resources::user_namespace(&self.login.owner);

        // Per-session environment travels on the command line instead of
        // mutating anything process-wide.
        let mut env_args = Vec::new();
        if let Some(term) = &self.term {
            env_args.push(format!("TERM={}", term.term));
        }
        if let Some(agent_cfg) = &self.agent {
            env_args.push(format!("SSH_AUTH_SOCK={}", agent_cfg.pod_socket_path));
        }
        let mut command = Vec::new();
        if !env_args.is_empty() {
            command.push("env".to_string());
            command.extend(env_args);
        }
        command.push("/bin/bash".to_string());

        let use_tty = self.term.is_some();
        tracing::info!(pod=%pod_name, tty=%use_tty, "starting pod shell");
        let mut exec = self
            .ctx
            .client
            .exec_stream(&namespace, pod_name, command, use_tty)
            .await
            .context("Could not start shell in pod")?;

        let mut resize_rx = resize_rx;
        if let Some(term) = &self.term {
            if let Some(mut handle) = exec.take_resize_handle() {
                handle.resize(term.width, term.height).await;
                tokio::spawn(resize::coalesce(resize_rx, move |(w, h)| {
                    let mut handle = handle.clone();
                    async move {
                        handle.resize(w, h).await;
                    }
                }));
            } else {
                resize_rx.close();
            }
        } else {
            resize_rx.close();
        }

        // Forward remote stderr as extended data on the channel.
        let stderr_task = exec.stderr.take().map(|mut stderr| {
            let handle = self.handle.clone();
            let id = self.channel_id;
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if handle
                                .extended_data(id, 1, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            })
        });

        let mut outbuf = [0u8; 8192];
        let mut inbuf = [0u8; 8192];
        let mut stdin_open = true;
        let code = loop {
            tokio::select! {
                res = exec.stdout.read(&mut outbuf) => match res {
                    Ok(0) | Err(_) => break 0,
                    Ok(n) => {
                        if io.writer.write_all(&outbuf[..n]).await.is_err() {
                            break 0;
                        }
                        let _ = io.writer.flush().await;
                    }
                },
                res = io.reader.read(&mut inbuf), if stdin_open => match res {
                    Ok(0) | Err(_) => {
                        // Client side closed; pass EOF to the shell and
                        // keep draining its output.
                        let _ = exec.stdin.shutdown().await;
                        stdin_open = false;
                    }
                    Ok(n) => {
                        if exec.stdin.write_all(&inbuf[..n]).await.is_err() {
                            break 0;
                        }
                    }
                },
                status = &mut exec.status => {
                    tracing::debug!(success=%client::exec_succeeded(status.as_ref()), "pod shell exited");
                    break 0;
                }
            }
        };

        if let Some(task) = stderr_task {
            task.abort();
        }
        Ok(code)
    }

    /// Runs on every exit path, including cancellation. Failures are
    /// logged and swallowed.
    async fn cleanup(&mut self) {
        if let Some(task) = self.agent_task.take() {
            task.abort();
        }

        let ephemeral = self.shared.lock().unwrap().ephemeral.take();
        if let Some(name) = ephemeral {
            let notice = format!("\r\nCleaning up ephemeral instance {}...\r\n", name);
            let _ = self
                .handle
                .data(self.channel_id, CryptoVec::from_slice(notice.as_bytes()))
                .await;
            match self
                .ctx
                .store
                .delete_instance(&self.login.owner, &ShortName::new(name.clone()))
                .await
            {
                Ok(_) => tracing::info!(user=%self.login.owner, instance=%name, "ephemeral instance deleted"),
                Err(err) => {
                    tracing::warn!(user=%self.login.owner, instance=%name, error=?err, "ephemeral cleanup failed");
                }
            }
        }
    }
}

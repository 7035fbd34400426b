//! SSH front-end of the gateway.
//!
//! Accepts connections, authenticates against the user directory,
//! parses the login handle into a session target and hands the channel
//! to a per-session coordinator. Forwarded channels and agent
//! forwarding are policed here.

mod agent;
mod menu;
mod motd;
mod resize;
mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use russh::keys::key::{KeyPair, PublicKey, SignatureHash};
use russh::keys::PublicKeyBase64;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, MethodSet};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::{SelectorCatalog, Settings, UserDirectory, VolumeCatalog};
use crate::resources;
use crate::store::InstanceStore;
use crate::AnyError;

use self::session::{AgentForward, SessionCoordinator, SessionShared, TermParams};

/// Read-only collaborators shared by every connection.
pub(crate) struct AppContext {
    pub settings: Settings,
    pub users: UserDirectory,
    pub selectors: SelectorCatalog,
    pub volumes: VolumeCatalog,
    pub client: Client,
    pub store: InstanceStore,
}

/// What a login handle resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Menu,
    Instance(String),
    Template(String),
}

#[derive(Clone, Debug)]
pub(crate) struct Login {
    pub owner: String,
    pub target: Target,
}

/// Start the SSH listener.
///
/// Blocks until the listener fails; bind errors propagate to the caller.
pub async fn run_gateway(settings: Settings, client: Client) -> Result<(), AnyError> {
    let users = UserDirectory::load(&settings.users_path)?;
    let selectors = SelectorCatalog::load(&settings.selectors_path)?;
    let volumes = VolumeCatalog::load(&settings.volumes_path)?;
    let store = InstanceStore::new(client.clone(), settings.system_namespace.clone());
    let host_key = load_or_generate_host_key(&settings.host_key_path)?;

    let mut methods = MethodSet::PUBLICKEY;
    if settings.auth_allow_any {
        tracing::warn!("WHISTLER_AUTH_ALLOW_ANY is set, password auth accepts anything");
        methods |= MethodSet::PASSWORD;
    }

    let config = server::Config {
        methods,
        keys: vec![host_key],
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 5,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    };

    let port = settings.listen_port;
    let mut gateway = Gateway {
        ctx: Arc::new(AppContext {
            settings,
            users,
            selectors,
            volumes,
            client,
            store,
        }),
    };

    tracing::info!(port = port, "Starting ssh gateway");
    gateway
        .run_on_address(Arc::new(config), ("0.0.0.0", port))
        .await
        .context("SSH listener failed")?;
    Ok(())
}

/// Load the persisted host key, generating and persisting a fresh RSA
/// key on first start.
fn load_or_generate_host_key(path: &Path) -> Result<KeyPair, AnyError> {
    if path.exists() {
        return russh::keys::load_secret_key(path, None).context("Could not load host key");
    }
    tracing::info!(path=%path.display(), "Generating new RSA host key");
    let key = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
        .context("RSA key generation failed")?;
    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(&key, &mut pem).context("Could not encode host key")?;
    std::fs::write(path, &pem).context("Could not persist host key")?;
    Ok(key)
}

/// Split a login handle into owner and suffix: the first `-` separated
/// segment is the owner, the rest (rejoined) is the suffix.
pub(crate) fn split_handle(handle: &str) -> (String, Option<String>) {
    let mut parts = handle.split('-');
    let owner = parts.next().unwrap_or_default().to_string();
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        (owner, None)
    } else {
        (owner, Some(rest.join("-")))
    }
}

/// Dispatch a parsed suffix against the templates visible to the owner.
pub(crate) fn dispatch_target(suffix: Option<String>, visible_templates: &[String]) -> Target {
    match suffix {
        None => Target::Menu,
        Some(name) if visible_templates.iter().any(|t| t == &name) => Target::Template(name),
        Some(name) => Target::Instance(name),
    }
}

/// Forward destinations must stay inside the pod.
pub(crate) fn forward_host_allowed(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1"
}

struct Gateway {
    ctx: Arc<AppContext>,
}

impl server::Server for Gateway {
    type Handler = Connection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Connection {
        tracing::debug!(peer=?peer, "ssh connection received");
        Connection::new(self.ctx.clone(), peer)
    }
}

/// Per-connection handler state.
struct Connection {
    ctx: Arc<AppContext>,
    peer: Option<SocketAddr>,
    login: Option<Login>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    term: Option<TermParams>,
    agent: Option<AgentForward>,
    agent_proxy: Option<agent::AgentProxy>,
    shared: Arc<Mutex<SessionShared>>,
    resize_tx: Option<mpsc::UnboundedSender<(u16, u16)>>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl Connection {
    fn new(ctx: Arc<AppContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer,
            login: None,
            channels: HashMap::new(),
            term: None,
            agent: None,
            agent_proxy: None,
            shared: Arc::new(Mutex::new(SessionShared::default())),
            resize_tx: None,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Parse the handle and resolve the session target. Instance targets
    /// pre-seed the active instance so forward requests arriving before
    /// the shell binds can be authorized.
    async fn resolve_login(&mut self, handle: &str) -> Login {
        let (owner, suffix) = split_handle(handle);
        let target = match suffix {
            None => Target::Menu,
            Some(suffix) => {
                let visible = match self.ctx.store.list_templates(&owner).await {
                    Ok(templates) => templates.into_iter().map(|t| t.name).collect::<Vec<_>>(),
                    Err(err) => {
                        tracing::warn!(user=%owner, error=?err, "could not list templates during login");
                        Vec::new()
                    }
                };
                dispatch_target(Some(suffix), &visible)
            }
        };
        if let Target::Instance(name) = &target {
            self.shared.lock().unwrap().active_instance = Some(name.clone());
        }
        Login { owner, target }
    }

    /// Resolve the instance a forward may attach to. `Ok` carries the
    /// namespace and pod name of a running pod.
    async fn authorize_forward(&self, host: &str) -> Result<(String, String), &'static str> {
        if !forward_host_allowed(host) {
            return Err("administratively prohibited");
        }
        let owner = self
            .login
            .as_ref()
            .map(|l| l.owner.clone())
            .ok_or("administratively prohibited")?;
        let active = self
            .shared
            .lock()
            .unwrap()
            .active_instance
            .clone()
            .ok_or("administratively prohibited")?;

        let instance = self
            .ctx
            .store
            .find_instance(&owner, &active)
            .await
            .map_err(|_| "connect failed")?
            .ok_or("connect failed")?;
        match (&instance.pod_name, instance.status.is_running()) {
            (Some(pod), true) => Ok((resources::user_namespace(&owner), pod.clone())),
            _ => Err("connect failed"),
        }
    }

    fn spawn_coordinator(&mut self, id: ChannelId, session: &mut Session) {
        let Some(login) = self.login.clone() else {
            session.channel_failure(id);
            return;
        };
        let Some(channel) = self.channels.remove(&id) else {
            session.channel_failure(id);
            return;
        };

        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        self.resize_tx = Some(resize_tx);

        let coordinator = SessionCoordinator::new(
            self.ctx.clone(),
            login,
            self.term.take(),
            self.agent.clone(),
            self.shared.clone(),
            session.handle(),
            id,
        );
        session.channel_success(id);
        tokio::spawn(session::drive(
            coordinator,
            channel,
            resize_rx,
            self.cancel.clone(),
        ));
    }
}

#[async_trait::async_trait]
impl server::Handler for Connection {
    type Error = AnyError;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.ctx.settings.auth_allow_any {
            tracing::info!(user=%user, "dev mode: accepting public key without check");
            let login = self.resolve_login(user).await;
            self.login = Some(login);
            return Ok(Auth::Accept);
        }

        let (owner, _) = split_handle(user);
        let offered = key.public_key_base64();
        if !self.ctx.users.key_matches(&owner, &offered) {
            // One rejection path for unknown users and bad keys; detail
            // stays out of the client-visible behavior.
            tracing::debug!(user=%owner, "public key rejected");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let login = self.resolve_login(user).await;
        tracing::info!(user=%login.owner, target=?login.target, "public key accepted");
        self.login = Some(login);
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        if !self.ctx.settings.auth_allow_any {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        tracing::info!(user=%user, "dev mode: accepting password auth");
        let login = self.resolve_login(user).await;
        self.login = Some(login);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.term = Some(TermParams {
            term: term.to_string(),
            width: col_width as u16,
            height: row_height as u16,
        });
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.spawn_coordinator(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        command: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Commands are not interpreted; an exec request gets the same
        // session as a shell request.
        tracing::debug!(command=%String::from_utf8_lossy(command), "exec request treated as shell");
        self.spawn_coordinator(channel, session);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match agent::AgentProxy::spawn(session.handle(), &mut self.tasks) {
            Ok(proxy) => {
                let pod_socket_path =
                    format!("/tmp/agent-{}.sock", resources::random_suffix());
                tracing::info!(
                    local=%proxy.path().display(),
                    pod=%pod_socket_path,
                    "agent forwarding requested"
                );
                self.agent = Some(AgentForward {
                    gateway_path: proxy.path().to_path_buf(),
                    pod_socket_path,
                });
                self.agent_proxy = Some(proxy);
                session.channel_success(channel);
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(error=?err, "could not set up agent forwarding");
                Ok(false)
            }
        }
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = (col_width as u16, row_height as u16);
        if let Some(tx) = &self.resize_tx {
            let _ = tx.send(size);
        } else if let Some(term) = &mut self.term {
            term.width = size.0;
            term.height = size.1;
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (namespace, pod) = match self.authorize_forward(host_to_connect).await {
            Ok(target) => target,
            Err(reason) => {
                tracing::info!(
                    host=%host_to_connect,
                    port=%port_to_connect,
                    reason=%reason,
                    "forward denied"
                );
                return Ok(false);
            }
        };

        let command = vec![
            "socat".to_string(),
            "-".to_string(),
            format!("TCP4:127.0.0.1:{}", port_to_connect),
        ];
        let exec = match self.ctx.client.exec_stream(&namespace, &pod, command, false).await {
            Ok(exec) => exec,
            Err(err) => {
                tracing::warn!(pod=%pod, port=%port_to_connect, error=?err, "forward connect failed");
                return Ok(false);
            }
        };

        tracing::info!(pod=%pod, port=%port_to_connect, "forwarding channel into pod");
        self.tasks
            .spawn(session::run_forward_tunnel(channel, exec));
        Ok(true)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Channels consumed by a coordinator see the EOF on their stream;
        // only unconsumed channels need an explicit close.
        if self.channels.remove(&channel).is_some() {
            session.close(channel);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(peer=?self.peer, "ssh connection closed");
        self.cancel.cancel();
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_without_suffix_is_menu() {
        assert_eq!(split_handle("alice"), ("alice".to_string(), None));
        assert_eq!(dispatch_target(None, &[]), Target::Menu);
    }

    #[test]
    fn suffix_matching_template_selects_template_mode() {
        let (owner, suffix) = split_handle("alice-small");
        assert_eq!(owner, "alice");
        assert_eq!(
            dispatch_target(suffix, &["small".to_string()]),
            Target::Template("small".to_string())
        );
    }

    #[test]
    fn unmatched_suffix_selects_instance_mode() {
        let (owner, suffix) = split_handle("alice-dev1");
        assert_eq!(owner, "alice");
        assert_eq!(
            dispatch_target(suffix, &["small".to_string()]),
            Target::Instance("dev1".to_string())
        );
    }

    #[test]
    fn multi_dash_suffixes_rejoin() {
        let (owner, suffix) = split_handle("alice-small-1a2b3c4d");
        assert_eq!(owner, "alice");
        assert_eq!(suffix.as_deref(), Some("small-1a2b3c4d"));
    }

    #[test]
    fn forward_hosts_are_loopback_only() {
        assert!(forward_host_allowed("localhost"));
        assert!(forward_host_allowed("127.0.0.1"));
        assert!(!forward_host_allowed("example.com"));
        assert!(!forward_host_allowed("10.0.0.7"));
        assert!(!forward_host_allowed(""));
    }

    #[test]
    fn host_key_is_persisted_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_key");
        let generated = load_or_generate_host_key(&path).unwrap();
        assert!(path.exists());
        let reloaded = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            generated.public_key_base64(),
            reloaded.public_key_base64()
        );
    }
}

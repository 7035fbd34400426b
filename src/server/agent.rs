//! SSH agent forwarding.
//!
//! Two halves: a gateway-side unix socket whose connections are relayed
//! to the client's agent over dedicated agent channels, and a socat
//! process inside the pod that mirrors a pod-local socket onto an exec
//! stream connected back to the gateway socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use russh::server::Handle;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;

use crate::client::ExecStream;
use crate::resources;
use crate::AnyError;

use super::session::AgentForward;
use super::AppContext;

/// Where the uploaded fallback socat lands inside the pod.
const POD_SOCAT_PATH: &str = "/tmp/socat-static";

/// The gateway-side materialization of the client's agent: a scratch
/// unix socket whose accepted connections each get a fresh agent
/// channel back to the client.
pub(crate) struct AgentProxy {
    path: PathBuf,
}

impl AgentProxy {
    pub fn spawn(handle: Handle, tasks: &mut JoinSet<()>) -> Result<Self, AnyError> {
        let path = std::env::temp_dir().join(format!(
            "whistler-agent-{}.sock",
            resources::random_suffix()
        ));
        let listener = UnixListener::bind(&path).context("Could not bind agent socket")?;
        let socket_path = path.clone();

        tasks.spawn(async move {
            loop {
                let conn = match listener.accept().await {
                    Ok((conn, _)) => conn,
                    Err(err) => {
                        tracing::debug!(error=?err, "agent socket accept failed");
                        break;
                    }
                };
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay_agent_connection(handle, conn).await {
                        tracing::debug!(error=?err, "agent relay ended");
                    }
                });
            }
            tracing::debug!(path=%socket_path.display(), "agent proxy stopped");
        });

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn relay_agent_connection(handle: Handle, mut conn: UnixStream) -> Result<(), AnyError> {
    let channel = handle
        .channel_open_agent()
        .await
        .map_err(|err| anyhow!("Could not open agent channel: {}", err))?;
    let mut stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
    Ok(())
}

/// Mirror the gateway-side agent socket into the pod and keep shuttling
/// bytes until either side closes. Failures only log; the shell session
/// is never torn down over a broken agent bridge.
pub(crate) async fn bridge_agent(
    ctx: Arc<AppContext>,
    namespace: String,
    pod_name: String,
    forward: AgentForward,
) {
    tracing::info!(
        pod=%pod_name,
        local=%forward.gateway_path.display(),
        remote=%forward.pod_socket_path,
        "starting agent bridge"
    );
    if let Err(err) = run_bridge(&ctx, &namespace, &pod_name, &forward).await {
        tracing::warn!(pod=%pod_name, error=?err, "agent bridge failed");
    }
    tracing::debug!(pod=%pod_name, "agent bridge finished");
}

async fn run_bridge(
    ctx: &AppContext,
    namespace: &str,
    pod_name: &str,
    forward: &AgentForward,
) -> Result<(), AnyError> {
    let socat = ensure_socat(ctx, namespace, pod_name).await?;

    let command = vec![
        socat,
        format!("UNIX-LISTEN:{},fork,mode=600", forward.pod_socket_path),
        "STDIO".to_string(),
    ];
    let exec = ctx
        .client
        .exec_stream(namespace, pod_name, command, false)
        .await
        .context("Could not start socat in pod")?;
    let ExecStream {
        mut stdin,
        mut stdout,
        stderr,
        ..
    } = exec;

    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line=%line, "agent bridge stderr");
            }
        });
    }

    let local = UnixStream::connect(&forward.gateway_path)
        .await
        .context("Could not connect to gateway agent socket")?;
    let (mut local_read, mut local_write) = local.into_split();

    tokio::select! {
        res = tokio::io::copy(&mut local_read, &mut stdin) => {
            tracing::debug!(result=?res, "agent bridge local side closed");
        }
        res = tokio::io::copy(&mut stdout, &mut local_write) => {
            tracing::debug!(result=?res, "agent bridge pod side closed");
        }
    }
    let _ = stdin.shutdown().await;
    Ok(())
}

/// Find a usable socat inside the pod, uploading the bundled static
/// binary when the image ships none.
async fn ensure_socat(
    ctx: &AppContext,
    namespace: &str,
    pod_name: &str,
) -> Result<String, AnyError> {
    let probe = vec![
        "command".to_string(),
        "-v".to_string(),
        "socat".to_string(),
    ];
    if ctx
        .client
        .exec_probe(namespace, pod_name, probe)
        .await
        .unwrap_or(false)
    {
        return Ok("socat".to_string());
    }

    let present = vec![
        "test".to_string(),
        "-f".to_string(),
        POD_SOCAT_PATH.to_string(),
    ];
    if ctx
        .client
        .exec_probe(namespace, pod_name, present)
        .await
        .unwrap_or(false)
    {
        return Ok(POD_SOCAT_PATH.to_string());
    }

    tracing::info!(pod=%pod_name, "socat not found in pod, uploading static binary");
    let bundle = read_bundled_socat(&ctx.settings.socat_bundle_paths)?;
    let upload = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cat > {p} && chmod +x {p}", p = POD_SOCAT_PATH),
    ];
    ctx.client
        .exec_upload(namespace, pod_name, upload, &bundle)
        .await
        .context("Could not upload socat into pod")?;
    Ok(POD_SOCAT_PATH.to_string())
}

/// Read the bundled socat from the first candidate path that exists.
fn read_bundled_socat(candidates: &[PathBuf]) -> Result<Vec<u8>, AnyError> {
    for candidate in candidates {
        if candidate.exists() {
            return std::fs::read(candidate).context("Could not read bundled socat");
        }
    }
    Err(anyhow!(
        "Bundled socat binary not found in {:?}",
        candidates
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn bundle_lookup_takes_the_first_existing_path() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        first.write_all(b"first binary").unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        second.write_all(b"second binary").unwrap();

        let candidates = vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ];
        assert_eq!(read_bundled_socat(&candidates).unwrap(), b"first binary");
    }

    #[test]
    fn bundle_lookup_skips_missing_candidates() {
        let mut bundle = tempfile::NamedTempFile::new().unwrap();
        bundle.write_all(b"static socat").unwrap();

        let candidates = vec![
            PathBuf::from("/nonexistent/socat-static"),
            bundle.path().to_path_buf(),
        ];
        assert_eq!(read_bundled_socat(&candidates).unwrap(), b"static socat");
    }

    #[test]
    fn bundle_lookup_errors_when_nothing_exists() {
        let candidates = vec![
            PathBuf::from("/nonexistent/socat-static"),
            PathBuf::from("/also/nonexistent/socat-static"),
        ];
        assert!(read_bundled_socat(&candidates).is_err());
    }
}

//! Kubernetes API client wrapper.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use anyhow::{anyhow, Context};
use futures::SinkExt;
use k8s_openapi::{
    api::core::v1::{Namespace, PersistentVolumeClaim, Pod},
    api::networking::v1::NetworkPolicy,
    apimachinery::pkg::apis::meta::v1::Status,
};
use kube::{
    api::{AttachParams, AttachedProcess, DeleteParams, ListParams, Patch, PatchParams, PostParams, TerminalSize},
    config::{KubeConfigOptions, Kubeconfig},
    Api,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::resources::{WhistlerInstance, WhistlerTemplate};
use crate::AnyError;

/// Kubernetes API client.
/// A convenience wrapper around the API provided by the `kube` crate to make
/// usage easier.
///
/// All Kubernetes API access goes through this client.
#[derive(Clone)]
pub struct Client {
    kube: kube::Client,
}

impl Client {
    /// Connect to the API, either through an explicit kubeconfig, the
    /// in-cluster service account, or the ambient default.
    pub async fn connect(kubeconfig: Option<&Path>, in_cluster: bool) -> Result<Self, AnyError> {
        let kube = if let Some(path) = kubeconfig {
            let kc = Kubeconfig::read_from(path).context("Could not read kubeconfig")?;
            let config = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("Could not load kubeconfig")?;
            kube::Client::try_from(config).context("Could not build client from kubeconfig")?
        } else if in_cluster {
            let config = kube::Config::incluster().context("Not running inside a cluster")?;
            kube::Client::try_from(config).context("Could not build in-cluster client")?
        } else {
            kube::Client::try_default()
                .await
                .context("Could not connect to cluster")?
        };
        Ok(Self { kube })
    }

    /// Access to the raw `kube` client for the controller runtime.
    pub fn kube(&self) -> kube::Client {
        self.kube.clone()
    }

    /// Convert a `404` (http not found) error result into an `Option<T>`.
    fn api_result_opt<T>(res: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
        match res {
            Ok(n) => Ok(Some(n)),
            Err(kube::Error::Api(ref err)) if err.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Convert a `404` on a list (missing namespace) into an empty result.
    fn list_result_empty<T>(res: Result<Vec<T>, kube::Error>) -> Result<Vec<T>, kube::Error> {
        match res {
            Ok(items) => Ok(items),
            Err(kube::Error::Api(ref err)) if err.code == 404 => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Get a namespace.
    /// Fails if not found.
    pub async fn namespace(&self, name: &str) -> Result<Namespace, kube::Error> {
        Api::<Namespace>::all(self.kube.clone()).get(name).await
    }

    /// Optionally get a namespace.
    pub async fn namespace_opt(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Self::api_result_opt(self.namespace(name).await)
    }

    /// Create a new namespace.
    pub async fn namespace_create(&self, ns: &Namespace) -> Result<Namespace, kube::Error> {
        Api::<Namespace>::all(self.kube.clone())
            .create(&PostParams::default(), ns)
            .await
    }

    /// Optionally get a `NetworkPolicy`.
    pub async fn network_policy_opt(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, kube::Error> {
        let res = Api::<NetworkPolicy>::namespaced(self.kube.clone(), namespace)
            .get(name)
            .await;
        Self::api_result_opt(res)
    }

    /// Create a new `NetworkPolicy`.
    pub async fn network_policy_create(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<NetworkPolicy, kube::Error> {
        Api::<NetworkPolicy>::namespaced(self.kube.clone(), namespace)
            .create(&PostParams::default(), policy)
            .await
    }

    /// Optionally get a `PersistentVolumeClaim`.
    pub async fn volume_claim_opt(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        let res = Api::<PersistentVolumeClaim>::namespaced(self.kube.clone(), namespace)
            .get(name)
            .await;
        Self::api_result_opt(res)
    }

    /// Create a new `PersistentVolumeClaim`.
    pub async fn volume_claim_create(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        Api::<PersistentVolumeClaim>::namespaced(self.kube.clone(), namespace)
            .create(&PostParams::default(), claim)
            .await
    }

    /// Get all pods from a namespace matching a label selector.
    /// A missing namespace yields an empty list.
    pub async fn pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let api = Api::<Pod>::namespaced(self.kube.clone(), namespace);
        let params = ListParams::default().labels(selector);
        Self::list_result_empty(api.list(&params).await.map(|l| l.items))
    }

    /// Optionally get a `Pod`.
    pub async fn pod_opt(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let res = Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .get(name)
            .await;
        Self::api_result_opt(res)
    }

    /// Create a new `Pod`.
    pub async fn pod_create(&self, namespace: &str, pod: &Pod) -> Result<Pod, kube::Error> {
        Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .create(&PostParams::default(), pod)
            .await
    }

    /// Delete a `Pod`.
    pub async fn pod_delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// List templates in a namespace. A missing namespace yields an
    /// empty list.
    pub async fn templates_all(
        &self,
        namespace: &str,
    ) -> Result<Vec<WhistlerTemplate>, kube::Error> {
        let api = Api::<WhistlerTemplate>::namespaced(self.kube.clone(), namespace);
        Self::list_result_empty(api.list(&ListParams::default()).await.map(|l| l.items))
    }

    /// Optionally get a template by its full name.
    pub async fn template_opt(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WhistlerTemplate>, kube::Error> {
        let res = Api::<WhistlerTemplate>::namespaced(self.kube.clone(), namespace)
            .get(name)
            .await;
        Self::api_result_opt(res)
    }

    /// Create a new template.
    pub async fn template_create(
        &self,
        namespace: &str,
        template: &WhistlerTemplate,
    ) -> Result<WhistlerTemplate, kube::Error> {
        Api::<WhistlerTemplate>::namespaced(self.kube.clone(), namespace)
            .create(&PostParams::default(), template)
            .await
    }

    /// Replace an existing template. The template must carry the stored
    /// `resourceVersion` to guard against lost updates.
    pub async fn template_replace(
        &self,
        namespace: &str,
        name: &str,
        template: &WhistlerTemplate,
    ) -> Result<WhistlerTemplate, kube::Error> {
        Api::<WhistlerTemplate>::namespaced(self.kube.clone(), namespace)
            .replace(name, &PostParams::default(), template)
            .await
    }

    /// List instances in a namespace. A missing namespace yields an
    /// empty list.
    pub async fn instances_all(
        &self,
        namespace: &str,
    ) -> Result<Vec<WhistlerInstance>, kube::Error> {
        let api = Api::<WhistlerInstance>::namespaced(self.kube.clone(), namespace);
        Self::list_result_empty(api.list(&ListParams::default()).await.map(|l| l.items))
    }

    /// Create a new instance declaration.
    pub async fn instance_create(
        &self,
        namespace: &str,
        instance: &WhistlerInstance,
    ) -> Result<WhistlerInstance, kube::Error> {
        Api::<WhistlerInstance>::namespaced(self.kube.clone(), namespace)
            .create(&PostParams::default(), instance)
            .await
    }

    /// Delete an instance declaration. The child pod is garbage-collected
    /// through its owner reference.
    pub async fn instance_delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        Api::<WhistlerInstance>::namespaced(self.kube.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    /// Merge-patch an instance's metadata annotations.
    pub async fn instance_annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), kube::Error> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        Api::<WhistlerInstance>::namespaced(self.kube.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Open an exec stream running `command` inside a pod.
    ///
    /// With `tty` the remote side allocates a terminal and stderr is
    /// merged into stdout; without it stderr arrives as a separate pipe.
    pub async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecStream, AnyError> {
        let params = if tty {
            AttachParams::default().stdin(true).stdout(true).stderr(false).tty(true)
        } else {
            AttachParams::default().stdin(true).stdout(true).stderr(true)
        };
        let proc = Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .exec(pod, command, &params)
            .await
            .context("Could not open exec stream")?;
        ExecStream::from_attached(proc)
    }

    /// Run a command in a pod and report whether it exited successfully.
    pub async fn exec_probe(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<bool, AnyError> {
        let params = AttachParams::default().stdout(true).stderr(false);
        let mut proc = Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .exec(pod, command, &params)
            .await
            .context("Could not open exec stream")?;
        let status = proc
            .take_status()
            .ok_or_else(|| anyhow!("Exec status not attached"))?
            .await;
        Ok(exec_succeeded(status.as_ref()))
    }

    /// Stream `data` into a command's stdin and wait for completion.
    /// Used to upload files into a pod via `cat > path`.
    pub async fn exec_upload(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        data: &[u8],
    ) -> Result<(), AnyError> {
        let params = AttachParams::default().stdin(true).stdout(true).stderr(false);
        let mut proc = Api::<Pod>::namespaced(self.kube.clone(), namespace)
            .exec(pod, command, &params)
            .await
            .context("Could not open exec stream")?;
        let mut stdin = proc
            .stdin()
            .ok_or_else(|| anyhow!("Exec stdin not attached"))?;
        let status = proc
            .take_status()
            .ok_or_else(|| anyhow!("Exec status not attached"))?;

        stdin.write_all(data).await.context("Upload write failed")?;
        stdin.shutdown().await.ok();
        drop(stdin);

        let status = status.await;
        if exec_succeeded(status.as_ref()) {
            Ok(())
        } else {
            Err(anyhow!("Upload did not terminate successfully"))
        }
    }
}

/// The byte streams of one exec subresource call.
///
/// The pair `(stdout, stdin)` is the opaque pipe-pair the session layer
/// bridges to SSH channels.
pub struct ExecStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    pub status: Pin<Box<dyn Future<Output = Option<Status>> + Send>>,
}

impl ExecStream {
    fn from_attached(mut proc: AttachedProcess) -> Result<Self, AnyError> {
        let stdin = proc
            .stdin()
            .ok_or_else(|| anyhow!("Exec stdin not attached"))?;
        let stdout = proc
            .stdout()
            .ok_or_else(|| anyhow!("Exec stdout not attached"))?;
        let stderr = proc.stderr();
        let resize = proc.terminal_size();
        let status = proc
            .take_status()
            .ok_or_else(|| anyhow!("Exec status not attached"))?;
        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            resize,
            status: Box::pin(status),
        })
    }

    /// Take the remote terminal resize handle, if a tty was allocated.
    pub fn take_resize_handle(&mut self) -> Option<ResizeHandle> {
        self.resize.take().map(ResizeHandle)
    }
}

/// Pushes new terminal dimensions to a running tty exec.
#[derive(Clone)]
pub struct ResizeHandle(futures::channel::mpsc::Sender<TerminalSize>);

impl ResizeHandle {
    pub async fn resize(&mut self, width: u16, height: u16) {
        let _ = self.0.send(TerminalSize { width, height }).await;
    }
}

/// Whether an exec call reported clean termination.
pub fn exec_succeeded(status: Option<&Status>) -> bool {
    status
        .and_then(|s| s.status.as_deref())
        .map(|s| s == "Success")
        .unwrap_or(false)
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Get the ip assigned to a Pod.
pub fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status.as_ref()?.pod_ip.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(value: &str) -> Status {
        Status {
            status: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn exec_status_mapping() {
        assert!(exec_succeeded(Some(&status("Success"))));
        assert!(!exec_succeeded(Some(&status("Failure"))));
        assert!(!exec_succeeded(None));
    }
}

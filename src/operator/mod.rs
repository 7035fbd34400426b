//! The reconciliation loop that turns instance declarations into
//! running sandbox pods.

mod reconcile;
mod types;

pub use self::types::InstancePhase;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{controller::Controller, watcher},
    Api,
};

use crate::client::Client;
use crate::resources::WhistlerInstance;

/// Launch the instance controller on the current runtime.
///
/// Watches instance declarations in all user namespaces and the pods
/// they own; runs until the process exits.
pub fn launch(client: Client, system_namespace: String) {
    tracing::info!("operator startup");
    tokio::task::spawn(run_controller(client, system_namespace));
}

async fn run_controller(client: Client, system_namespace: String) {
    let instances = Api::<WhistlerInstance>::all(client.kube());
    let pods = Api::<Pod>::all(client.kube());
    let ctx = Arc::new(reconcile::Context {
        client,
        system_namespace,
    });

    Controller::new(instances, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .run(reconcile::reconcile, reconcile::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => tracing::debug!(instance=%obj.name, "reconciled"),
                Err(err) => tracing::warn!(error=?err, "reconcile failed"),
            }
        })
        .await;
}

//! # whistler
//!
//! SSH gateway to per-user compute sandboxes on Kubernetes.
//! Users connect with a plain SSH client; the login handle selects a
//! management menu, a named long-lived instance, or an ephemeral instance
//! created from a template. A built-in operator reconciles instance
//! declarations into pods with per-user persistent storage.

mod client;
mod config;
mod operator;
mod resources;
mod server;
mod store;

use clap::Parser;

pub(crate) type AnyError = anyhow::Error;

/// Whistler SSH gateway.
#[derive(Parser, Clone, Debug)]
#[command(name = "whistler")]
struct Args {
    /// Path to a kubeconfig file (out-of-cluster mode).
    #[arg(long)]
    kubeconfig: Option<std::path::PathBuf>,
    /// Use the pod service account (in-cluster mode).
    #[arg(long)]
    in_cluster: bool,
}

fn main() {
    // Set default logging level to info.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    // Initialize logging backend.
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let settings = config::Settings::from_env();

    // Set up tokio runtime.
    // A single threaded runtime is sufficient: sessions are lightweight
    // tasks and all cluster I/O is async.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not create runtime");

    let res = rt.block_on(async move {
        let client =
            client::Client::connect(args.kubeconfig.as_deref(), args.in_cluster).await?;

        // Launch the instance reconciler.
        operator::launch(client.clone(), settings.system_namespace.clone());

        // Run the SSH front-end. Blocks until the listener fails.
        server::run_gateway(settings, client).await?;
        Result::<_, AnyError>::Ok(())
    });

    if let Err(err) = res {
        tracing::error!(error=?err, "gateway failed");
        std::process::exit(1);
    } else {
        tracing::info!("Orderly shutdown");
    }
}

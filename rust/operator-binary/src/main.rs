mod applier;
mod cluster;
mod controller;
mod engine;
mod event;
mod finalizer;
mod health;
mod inventory;
mod scheduler;
mod utils;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use flux_kustomize_operator_crd::Kustomization;
use fluxcd_rs::{ArtifactFetcher, GitRepository, OCIRepository};
use futures::stream::StreamExt;
use kube::{
    runtime::{controller::Config as ControllerConfig, reflector::ObjectRef, watcher, Controller},
    Api, Client, Config, ResourceExt,
};
use kustomize_render::{Decrypter, SopsCli};
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use scheduler::WatchIndex;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::controller::ContextData;

#[derive(Parser)]
#[clap(about, author, version)]
struct Opts {
    /// Upper bound on Kustomizations reconciling in parallel.
    #[arg(long, env = "KUSTOMIZE_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    /// Rewrites artifact URLs onto this host, e.g. a port-forwarded source
    /// service.
    #[arg(long, env = "SOURCE_HOST")]
    source_host: Option<String>,

    /// Root for per-reconciliation scratch directories. Defaults to the
    /// system temp dir.
    #[arg(long, env = "KUSTOMIZE_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    #[arg(long, env = "KUSTOMIZE_HTTP_RETRY", default_value_t = 3)]
    http_retry: u32,

    /// Path of the sops binary used for decryption.
    #[arg(long, env = "SOPS_BINARY")]
    sops_binary: Option<PathBuf>,

    /// Human-readable logs instead of JSON records.
    #[arg(long, env = "KUSTOMIZE_LOG_PRETTY")]
    log_pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing(opts.log_pretty);

    let config = Config::infer().await?;
    let client = Client::try_from(config.clone())?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(opts.http_retry);
    let http_client = ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();
    let fetcher = ArtifactFetcher::new(http_client, opts.source_host, opts.scratch_dir);

    let decrypter: Arc<dyn Decrypter> = Arc::new(
        opts.sops_binary
            .map(SopsCli::new)
            .unwrap_or_default(),
    );

    let index = Arc::new(WatchIndex::default());
    let context = Arc::new(ContextData {
        client: client.clone(),
        engine: engine::Engine::new(client.clone(), fetcher, decrypter),
        resolver: cluster::ClusterResolver::new(client.clone(), config),
        index: index.clone(),
    });

    info!(
        "Starting {} with concurrency {}",
        controller::CONTROLLER_NAME,
        opts.concurrency
    );

    let dependents_index = index.clone();
    let git_index = index.clone();
    let oci_index = index;

    Controller::new(
        Api::<Kustomization>::all(client.clone()),
        watcher::Config::default(),
    )
    .with_config(ControllerConfig::default().concurrency(opts.concurrency))
    // Dependency-completion trigger: any change of a Kustomization wakes the
    // Kustomizations gated on it.
    .watches(
        Api::<Kustomization>::all(client.clone()),
        watcher::Config::default(),
        move |kustomization| {
            let key = (
                kustomization.namespace().unwrap_or_default(),
                kustomization.name_any(),
            );
            dependents_index
                .dependents(&key)
                .into_iter()
                .map(|(ns, name)| ObjectRef::new(&name).within(&ns))
        },
    )
    // Source-revision triggers.
    .watches(
        Api::<GitRepository>::all(client.clone()),
        watcher::Config::default(),
        move |repo| {
            let key = (
                "GitRepository".to_string(),
                repo.namespace().unwrap_or_default(),
                repo.name_any(),
            );
            git_index
                .consumers(&key)
                .into_iter()
                .map(|(ns, name)| ObjectRef::new(&name).within(&ns))
        },
    )
    .watches(
        Api::<OCIRepository>::all(client.clone()),
        watcher::Config::default(),
        move |repo| {
            let key = (
                "OCIRepository".to_string(),
                repo.namespace().unwrap_or_default(),
                repo.name_any(),
            );
            oci_index
                .consumers(&key)
                .into_iter()
                .map(|(ns, name)| ObjectRef::new(&name).within(&ns))
        },
    )
    .shutdown_on_signal()
    .run(controller::reconcile, controller::error_policy, context)
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => debug!("Reconciled {:?}", object),
            Err(error) => warn!("Reconciliation failed: {}", error),
        }
    })
    .await;

    Ok(())
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init();
    }
}

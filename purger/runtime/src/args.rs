use crate::{
    api::{Api, ApiMetrics, Server},
    core::{Purger, INSTANCE_LABEL},
    index::{metrics::IndexMetrics, Index},
    nginx::NginxManager,
    PodLister,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc, time::Duration};
use tracing::{error, info, info_span, Instrument};

// Watch requests must time out before the API server closes them at 295s.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

#[derive(Debug, Parser)]
#[clap(name = "purger", about = "Purges cached objects from reverse proxy replicas")]
pub struct Args {
    #[clap(long, default_value = "purger=info,warn", env = "PURGER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address on which the purge API is served.
    #[clap(long, default_value = "0.0.0.0:9990", env = "PURGER_LISTEN_ADDRESS")]
    listen_address: SocketAddr,

    /// Time to wait for in-flight requests once shutdown begins.
    #[clap(long, default_value = "30")]
    shutdown_timeout_secs: u64,

    /// Interval after which pod watches are restarted.
    ///
    /// Values above 290 seconds are clamped.
    #[clap(long, default_value = "300")]
    sync_interval_secs: u64,

    /// Restricts pod discovery to a single namespace. All namespaces are watched by default.
    #[clap(long, env = "PURGER_NAMESPACE")]
    namespace: Option<String>,

    /// Timeout for each request to a replica's purge endpoint.
    #[clap(long, default_value = "5000")]
    purge_timeout_ms: u64,

    /// Number of replicas purged concurrently for a single path.
    #[clap(long, default_value = "8")]
    max_concurrent_purges: NonZeroUsize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            listen_address,
            shutdown_timeout_secs,
            sync_interval_secs,
            namespace,
            purge_timeout_ms,
            max_concurrent_purges,
        } = self;

        let index = Index::shared();

        let mut prom = <Registry>::default();
        let index_metrics =
            IndexMetrics::register(index.clone(), prom.sub_registry_with_prefix("index"));
        let api_metrics = ApiMetrics::register(prom.sub_registry_with_prefix("purger"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        // Spawn the pod watch.

        let config = watcher::Config::default()
            .labels(INSTANCE_LABEL)
            .timeout(watch_timeout(sync_interval_secs));
        let index_metrics = index_metrics.shared();
        match namespace {
            Some(ns) => {
                info!(%ns, "Watching pods");
                let api = kube::Api::<Pod>::namespaced(runtime.client(), &ns);
                let pods = runtime.watch(api, config);
                tokio::spawn(
                    kubert::index::namespaced(index_metrics, pods).instrument(info_span!("pods")),
                );
            }
            None => {
                info!("Watching pods in all namespaces");
                let pods = runtime.watch_all::<Pod>(config);
                tokio::spawn(
                    kubert::index::namespaced(index_metrics, pods).instrument(info_span!("pods")),
                );
            }
        }

        // Run the purge API, dispatching to replicas found in the pod index.
        let cache = NginxManager::new(Duration::from_millis(purge_timeout_ms));
        let purger = Purger::new(PodLister::new(index), cache)
            .with_max_concurrency(max_concurrent_purges);
        let api = Api::new(purger, api_metrics).with_registry(Arc::new(prom));
        let server = Server::new(listen_address, Duration::from_secs(shutdown_timeout_secs));
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = server.serve(api, drain).await {
                error!(%error, "HTTP server failed");
            }
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Converts the sync interval to a watch timeout accepted by the API server.
fn watch_timeout(sync_interval_secs: u64) -> u32 {
    sync_interval_secs.clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32
}

use crate::{
    admission::Admission,
    metrics::Metrics,
    store::{ApiReader, CachedReader, Fallback, Readiness},
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::{future, prelude::*};
use kube::{
    api::Api,
    runtime::{reflector, watcher, WatchStreamExt},
};
use prometheus_client::registry::Registry;
use scheduling_policy_k8s_api::{
    policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy},
    Namespace,
};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "scheduling-policy-controller",
    about = "Admission controller that injects declared scheduling policies into workloads"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "scheduling_policy=info,warn",
        env = "SCHEDULING_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Bounds policy reads and merging for a single admission request.
    #[clap(long, default_value = "20000")]
    admission_timeout_ms: u64,

    /// Bounds the initial cache sync; exceeding it aborts startup.
    #[clap(long, default_value = "60000")]
    cache_sync_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_timeout_ms,
            cache_sync_timeout_ms,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("scheduling_policy_aggr"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let client = runtime.client();

        let namespaces = spawn_watch(Api::<Namespace>::all(client.clone()), "namespaces");
        let cluster_policies = spawn_watch(
            Api::<ClusterPodSchedulingPolicy>::all(client.clone()),
            "clusterpodschedulingpolicies",
        );
        let policies = spawn_watch(
            Api::<PodSchedulingPolicy>::all(client.clone()),
            "podschedulingpolicies",
        );

        let readiness = spawn_sync_gate(
            namespaces.clone(),
            cluster_policies.clone(),
            policies.clone(),
            Duration::from_millis(cache_sync_timeout_ms),
        );

        let reader = Fallback::new(
            CachedReader::new(namespaces, cluster_policies, policies),
            ApiReader::new(client),
        );
        let admission = Admission::new(
            Arc::new(reader),
            readiness,
            metrics,
            Duration::from_millis(admission_timeout_ms),
        );

        let runtime = runtime.spawn_server(admission);

        info!("Admission controller running");
        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

fn spawn_watch<K>(api: Api<K>, kind: &'static str) -> reflector::Store<K>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Clone + Default + Eq + std::hash::Hash,
{
    let (store, writer) = reflector::store();
    tokio::spawn(
        async move {
            let mut events = std::pin::pin!(
                reflector(writer, watcher(api, watcher::Config::default())).default_backoff()
            );
            while let Some(event) = events.next().await {
                if let Err(error) = event {
                    warn!(%error, "Watch failed");
                }
            }
        }
        .instrument(info_span!("watch", %kind)),
    );
    store
}

/// Resolves the admission gate once every cache has completed its initial
/// sync. A sync that does not complete in time is fatal: the process exits
/// rather than serve requests from caches that never settled.
fn spawn_sync_gate(
    namespaces: reflector::Store<Namespace>,
    cluster_policies: reflector::Store<ClusterPodSchedulingPolicy>,
    policies: reflector::Store<PodSchedulingPolicy>,
    timeout: Duration,
) -> Readiness {
    let (ready_tx, readiness) = Readiness::gate();
    tokio::spawn(async move {
        let sync = future::join3(
            namespaces.wait_until_ready(),
            cluster_policies.wait_until_ready(),
            policies.wait_until_ready(),
        );
        match time::timeout(timeout, sync).await {
            Ok((Ok(()), Ok(()), Ok(()))) => {
                info!("Caches synced");
                let _ = ready_tx.send(true);
            }
            _ => {
                error!(?timeout, "Failed to sync caches; aborting");
                std::process::exit(1);
            }
        }
    });
    readiness
}

//! Read access to policies and namespaces during admission.
//!
//! Two readers share one contract: a cached reader serving from reflector
//! stores and a direct reader issuing live API requests. The admission path
//! composes them so that every read is tried against the cache first and
//! retried once against the API.

use anyhow::{anyhow, Result};
use kube::{
    api::{Api, ListParams},
    runtime::reflector::{ObjectRef, Store},
    Client,
};
use scheduling_policy_k8s_api::{
    policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy},
    Namespace,
};
use tokio::sync::watch;
use tracing::debug;

const PAGE_LIMIT: u32 = 500;

#[async_trait::async_trait]
pub trait PolicyReader: Send + Sync {
    async fn list_cluster_policies(&self) -> Result<Vec<ClusterPodSchedulingPolicy>>;
    async fn list_policies(&self, namespace: &str) -> Result<Vec<PodSchedulingPolicy>>;
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;
}

/// Serves reads from reflector caches populated by watches.
#[derive(Clone)]
pub struct CachedReader {
    namespaces: Store<Namespace>,
    cluster_policies: Store<ClusterPodSchedulingPolicy>,
    policies: Store<PodSchedulingPolicy>,
}

impl CachedReader {
    pub fn new(
        namespaces: Store<Namespace>,
        cluster_policies: Store<ClusterPodSchedulingPolicy>,
        policies: Store<PodSchedulingPolicy>,
    ) -> Self {
        Self {
            namespaces,
            cluster_policies,
            policies,
        }
    }
}

#[async_trait::async_trait]
impl PolicyReader for CachedReader {
    async fn list_cluster_policies(&self) -> Result<Vec<ClusterPodSchedulingPolicy>> {
        Ok(self
            .cluster_policies
            .state()
            .iter()
            .map(|p| (**p).clone())
            .collect())
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<PodSchedulingPolicy>> {
        Ok(self
            .policies
            .state()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .map(|p| (**p).clone())
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.namespaces
            .get(&ObjectRef::new(name))
            .map(|ns| (*ns).clone())
            .ok_or_else(|| anyhow!("namespace {name} is not in the cache"))
    }
}

/// Reads directly from the API server, following list continuations until the
/// continue token runs out.
#[derive(Clone)]
pub struct ApiReader {
    client: Client,
}

impl ApiReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PolicyReader for ApiReader {
    async fn list_cluster_policies(&self) -> Result<Vec<ClusterPodSchedulingPolicy>> {
        paginated(Api::all(self.client.clone())).await
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<PodSchedulingPolicy>> {
        paginated(Api::namespaced(self.client.clone(), namespace)).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let ns = Api::<Namespace>::all(self.client.clone()).get(name).await?;
        Ok(ns)
    }
}

async fn paginated<K>(api: Api<K>) -> Result<Vec<K>>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let mut items = Vec::new();
    let mut token = None::<String>;
    loop {
        let mut params = ListParams::default().limit(PAGE_LIMIT);
        if let Some(token) = token.as_deref() {
            params = params.continue_token(token);
        }
        let page = api.list(&params).await?;
        items.extend(page.items);
        token = page.metadata.continue_.filter(|t| !t.is_empty());
        if token.is_none() {
            return Ok(items);
        }
    }
}

/// Composes two readers: every read is attempted against `cache` and retried
/// once against `direct` on error. A direct failure is propagated as-is.
pub struct Fallback<C, D> {
    cache: C,
    direct: D,
}

impl<C, D> Fallback<C, D> {
    pub fn new(cache: C, direct: D) -> Self {
        Self { cache, direct }
    }
}

#[async_trait::async_trait]
impl<C: PolicyReader, D: PolicyReader> PolicyReader for Fallback<C, D> {
    async fn list_cluster_policies(&self) -> Result<Vec<ClusterPodSchedulingPolicy>> {
        match self.cache.list_cluster_policies().await {
            Ok(policies) => Ok(policies),
            Err(error) => {
                debug!(%error, "Cluster policy list from cache failed; retrying against the API");
                self.direct.list_cluster_policies().await
            }
        }
    }

    async fn list_policies(&self, namespace: &str) -> Result<Vec<PodSchedulingPolicy>> {
        match self.cache.list_policies(namespace).await {
            Ok(policies) => Ok(policies),
            Err(error) => {
                debug!(%error, "Policy list from cache failed; retrying against the API");
                self.direct.list_policies(namespace).await
            }
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        match self.cache.get_namespace(name).await {
            Ok(ns) => Ok(ns),
            Err(error) => {
                debug!(%error, "Namespace read from cache failed; retrying against the API");
                self.direct.get_namespace(name).await
            }
        }
    }
}

/// Signals that every cache has completed its initial sync. The gate resolves
/// exactly once; every request that arrives earlier awaits the same signal.
#[derive(Clone)]
pub struct Readiness(watch::Receiver<bool>);

impl Readiness {
    pub fn gate() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    /// Resolves once the caches have synced; immediately if they already have.
    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::{reflector, watcher};
    use scheduling_policy_k8s_api::policy::PodSchedulingPolicySpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubReader {
        fail: bool,
        calls: AtomicUsize,
        policies: Vec<PodSchedulingPolicy>,
    }

    #[async_trait::async_trait]
    impl PolicyReader for StubReader {
        async fn list_cluster_policies(&self) -> Result<Vec<ClusterPodSchedulingPolicy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("reader unavailable"));
            }
            Ok(vec![])
        }

        async fn list_policies(&self, _namespace: &str) -> Result<Vec<PodSchedulingPolicy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("reader unavailable"));
            }
            Ok(self.policies.clone())
        }

        async fn get_namespace(&self, name: &str) -> Result<Namespace> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("reader unavailable"));
            }
            Ok(Namespace {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        }
    }

    fn policy_in(namespace: &str, name: &str) -> PodSchedulingPolicy {
        let mut policy = PodSchedulingPolicy::new(name, PodSchedulingPolicySpec::default());
        policy.metadata.namespace = Some(namespace.to_string());
        policy
    }

    #[tokio::test]
    async fn fallback_prefers_the_cache() {
        let cache = StubReader::default();
        let direct = StubReader::default();
        let fallback = Fallback::new(cache, direct);

        fallback.list_cluster_policies().await.unwrap();
        assert_eq!(fallback.cache.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.direct.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_retries_against_direct_reader() {
        let cache = StubReader {
            fail: true,
            ..Default::default()
        };
        let direct = StubReader::default();
        let fallback = Fallback::new(cache, direct);

        fallback.get_namespace("default").await.unwrap();
        assert_eq!(fallback.cache.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.direct.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_propagates_direct_failure() {
        let cache = StubReader {
            fail: true,
            ..Default::default()
        };
        let direct = StubReader {
            fail: true,
            ..Default::default()
        };
        let fallback = Fallback::new(cache, direct);
        assert!(fallback.list_policies("default").await.is_err());
    }

    #[tokio::test]
    async fn cached_reader_scopes_policies_by_namespace() {
        let (namespaces, _ns_writer) = reflector::store();
        let (cluster_policies, _cluster_writer) = reflector::store();
        let (policies, mut policy_writer) = reflector::store();

        policy_writer.apply_watcher_event(&watcher::Event::Apply(policy_in("a", "p1")));
        policy_writer.apply_watcher_event(&watcher::Event::Apply(policy_in("b", "p2")));

        let reader = CachedReader::new(namespaces, cluster_policies, policies);
        let listed = reader.list_policies("a").await.unwrap();
        assert_eq!(
            listed
                .iter()
                .map(|p| p.metadata.name.as_deref().unwrap())
                .collect::<Vec<_>>(),
            vec!["p1"],
        );
    }

    #[tokio::test]
    async fn cached_reader_errors_on_unknown_namespace() {
        let (namespaces, _ns_writer) = reflector::store();
        let (cluster_policies, _cluster_writer) = reflector::store();
        let (policies, _policy_writer) = reflector::store();

        let reader = CachedReader::new(namespaces, cluster_policies, policies);
        assert!(reader.get_namespace("missing").await.is_err());
    }

    #[tokio::test]
    async fn readiness_gate_resolves_once_signaled() {
        let (tx, readiness) = Readiness::gate();
        let waiter = tokio::spawn({
            let readiness = readiness.clone();
            async move { readiness.wait().await }
        });
        tx.send(true).unwrap();
        waiter.await.unwrap();

        // Subsequent waits return immediately.
        readiness.wait().await;
    }
}

use crate::labels;
use k8s_openapi::api::core::v1::{Affinity, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scheduling directives applied to pods across the cluster, scoped by a
/// namespace selector.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "scheduling.dev",
    version = "v1alpha1",
    kind = "ClusterPodSchedulingPolicy"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodSchedulingPolicySpec {
    /// Selects the namespaces the policy applies in. Present but empty selects
    /// all namespaces; absent selects none.
    pub namespace_selector: Option<labels::Selector>,

    /// Selects the pods the policy applies to within the selected namespaces.
    /// Present but empty selects all pods; absent selects none.
    pub pod_selector: Option<labels::Selector>,

    /// Node labels the selected pods must be scheduled onto.
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Requests scheduling onto a specific node, bypassing the scheduler.
    pub node_name: Option<String>,

    /// Affinity constraints for the selected pods.
    pub affinity: Option<Affinity>,

    /// Dispatches the selected pods via the named scheduler instead of the
    /// default one.
    pub scheduler_name: Option<String>,

    /// Tolerations for the selected pods.
    pub tolerations: Option<Vec<Toleration>>,
}

//! Selects the policies applicable to an admitted pod template.

use crate::inject::Directives;
use scheduling_policy_k8s_api::{
    labels::{InvalidSelector, Labels},
    policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy},
};
use thiserror::Error;
use tracing::debug;

/// A policy that should apply carries a selector that cannot be evaluated.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("policy {name}: invalid {field}: {source}")]
pub struct SelectError {
    name: String,
    field: &'static str,
    #[source]
    source: InvalidSelector,
}

/// Filters the fetched policies down to those applicable to a pod with
/// `pod_labels` in the namespace labeled `namespace_labels`, returning their
/// directives sorted by policy name.
///
/// An absent selector selects nothing; a present-but-empty selector selects
/// everything in its scope. Cluster-scoped policies are combined ahead of
/// namespaced ones, so a name tie resolves in favor of the cluster policy.
pub fn applicable(
    cluster: &[ClusterPodSchedulingPolicy],
    namespaced: &[PodSchedulingPolicy],
    namespace_labels: &Labels,
    pod_labels: &Labels,
) -> Result<Vec<Directives>, SelectError> {
    let mut selected = Vec::new();

    for policy in cluster {
        let name = policy.metadata.name.clone().unwrap_or_default();

        let Some(namespace_selector) = policy.spec.namespace_selector.as_ref() else {
            continue;
        };
        namespace_selector.validate().map_err(|source| SelectError {
            name: name.clone(),
            field: "namespaceSelector",
            source,
        })?;
        if !namespace_selector.matches(namespace_labels) {
            debug!(%name, "namespaceSelector does not match");
            continue;
        }

        let Some(pod_selector) = policy.spec.pod_selector.as_ref() else {
            continue;
        };
        pod_selector.validate().map_err(|source| SelectError {
            name: name.clone(),
            field: "podSelector",
            source,
        })?;
        if !pod_selector.matches(pod_labels) {
            debug!(%name, "podSelector does not match");
            continue;
        }

        selected.push(Directives::from(policy));
    }

    for policy in namespaced {
        let name = policy.metadata.name.clone().unwrap_or_default();

        let Some(pod_selector) = policy.spec.pod_selector.as_ref() else {
            continue;
        };
        pod_selector.validate().map_err(|source| SelectError {
            name: name.clone(),
            field: "podSelector",
            source,
        })?;
        if !pod_selector.matches(pod_labels) {
            debug!(%name, "podSelector does not match");
            continue;
        }

        selected.push(Directives::from(policy));
    }

    // The sort is stable, so cluster-scoped entries keep their place ahead of
    // namespaced entries with the same name.
    selected.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(selected)
}

//! Merges policy scheduling directives into a pod spec.
//!
//! Every rule preserves what the pod author wrote: scalars are only filled in
//! when empty, map keys are only inserted when absent, and list fields grow by
//! set-union over structural equality. Required node affinity is the one
//! exception to plain union: its term list is a disjunction of conjunctions,
//! so combining the pod's constraints with a policy's requires the cartesian
//! product of the two term lists.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PodAffinity,
    PodAntiAffinity, PodSpec, Toleration,
};
use scheduling_policy_k8s_api::policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy};
use std::collections::BTreeMap;

/// The scheduling directives carried by a single policy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Directives {
    pub name: String,
    pub affinity: Option<Affinity>,
    pub node_name: Option<String>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub scheduler_name: Option<String>,
    pub tolerations: Option<Vec<Toleration>>,
}

impl From<&PodSchedulingPolicy> for Directives {
    fn from(policy: &PodSchedulingPolicy) -> Self {
        Self {
            name: policy.metadata.name.clone().unwrap_or_default(),
            affinity: policy.spec.affinity.clone(),
            node_name: policy.spec.node_name.clone(),
            node_selector: policy.spec.node_selector.clone(),
            scheduler_name: policy.spec.scheduler_name.clone(),
            tolerations: policy.spec.tolerations.clone(),
        }
    }
}

impl From<&ClusterPodSchedulingPolicy> for Directives {
    fn from(policy: &ClusterPodSchedulingPolicy) -> Self {
        Self {
            name: policy.metadata.name.clone().unwrap_or_default(),
            affinity: policy.spec.affinity.clone(),
            node_name: policy.spec.node_name.clone(),
            node_selector: policy.spec.node_selector.clone(),
            scheduler_name: policy.spec.scheduler_name.clone(),
            tolerations: policy.spec.tolerations.clone(),
        }
    }
}

pub type AffinityInject = fn(&Affinity, &PodSpec, &mut PodSpec);
pub type NodeNameInject = fn(&str, &PodSpec, &mut PodSpec);
pub type NodeSelectorInject = fn(&BTreeMap<String, String>, &PodSpec, &mut PodSpec);
pub type SchedulerNameInject = fn(&str, &PodSpec, &mut PodSpec);
pub type TolerationsInject = fn(&[Toleration], &PodSpec, &mut PodSpec);

/// Per-field merge strategies. Each field is pluggable; `None` disables the
/// field entirely. `Default` installs the standard rules.
///
/// Every strategy receives the untouched original pod spec alongside the
/// mutable copy; the original is never modified.
#[derive(Clone)]
pub struct Injector {
    pub affinity: Option<AffinityInject>,
    pub node_name: Option<NodeNameInject>,
    pub node_selector: Option<NodeSelectorInject>,
    pub scheduler_name: Option<SchedulerNameInject>,
    pub tolerations: Option<TolerationsInject>,
}

impl Default for Injector {
    fn default() -> Self {
        Self {
            affinity: Some(inject_affinity),
            node_name: Some(inject_node_name),
            node_selector: Some(inject_node_selector),
            scheduler_name: Some(inject_scheduler_name),
            tolerations: Some(inject_tolerations),
        }
    }
}

impl Injector {
    /// Applies one policy's directives to `mutable` in a fixed field order:
    /// affinity, nodeName, nodeSelector, schedulerName, tolerations. Absent
    /// directives are skipped.
    pub fn apply(&self, directives: &Directives, orig: &PodSpec, mutable: &mut PodSpec) {
        if let (Some(inject), Some(affinity)) = (self.affinity, directives.affinity.as_ref()) {
            inject(affinity, orig, mutable);
        }
        if let (Some(inject), Some(node_name)) = (self.node_name, directives.node_name.as_deref())
        {
            if !node_name.is_empty() {
                inject(node_name, orig, mutable);
            }
        }
        if let (Some(inject), Some(node_selector)) =
            (self.node_selector, directives.node_selector.as_ref())
        {
            inject(node_selector, orig, mutable);
        }
        if let (Some(inject), Some(scheduler_name)) =
            (self.scheduler_name, directives.scheduler_name.as_deref())
        {
            if !scheduler_name.is_empty() {
                inject(scheduler_name, orig, mutable);
            }
        }
        if let (Some(inject), Some(tolerations)) =
            (self.tolerations, directives.tolerations.as_deref())
        {
            inject(tolerations, orig, mutable);
        }
    }

    /// Applies an already-sorted policy sequence to `pod_spec`, each policy
    /// against the same mutable spec and a stable snapshot of the original.
    pub fn apply_all(&self, directives: &[Directives], pod_spec: &mut PodSpec) {
        let orig = pod_spec.clone();
        for d in directives {
            self.apply(d, &orig, pod_spec);
        }
    }
}

fn inject_node_name(node_name: &str, _orig: &PodSpec, mutable: &mut PodSpec) {
    if mutable.node_name.as_deref().is_some_and(|n| !n.is_empty()) {
        return;
    }
    mutable.node_name = Some(node_name.to_string());
}

fn inject_scheduler_name(scheduler_name: &str, _orig: &PodSpec, mutable: &mut PodSpec) {
    if mutable
        .scheduler_name
        .as_deref()
        .is_some_and(|n| !n.is_empty())
    {
        return;
    }
    mutable.scheduler_name = Some(scheduler_name.to_string());
}

fn inject_node_selector(
    node_selector: &BTreeMap<String, String>,
    _orig: &PodSpec,
    mutable: &mut PodSpec,
) {
    if node_selector.is_empty() {
        return;
    }
    let target = mutable.node_selector.get_or_insert_with(BTreeMap::new);
    for (k, v) in node_selector {
        if !target.contains_key(k) {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn inject_tolerations(tolerations: &[Toleration], _orig: &PodSpec, mutable: &mut PodSpec) {
    if tolerations.is_empty() {
        return;
    }
    let target = mutable.tolerations.get_or_insert_with(Vec::new);
    for toleration in tolerations {
        if !target.contains(toleration) {
            target.push(toleration.clone());
        }
    }
}

fn inject_affinity(affinity: &Affinity, _orig: &PodSpec, mutable: &mut PodSpec) {
    let Some(target) = mutable.affinity.as_mut() else {
        mutable.affinity = Some(affinity.clone());
        return;
    };

    merge_node_affinity(affinity.node_affinity.as_ref(), target);
    merge_pod_affinity(affinity.pod_affinity.as_ref(), target);
    merge_pod_anti_affinity(affinity.pod_anti_affinity.as_ref(), target);
}

fn merge_node_affinity(policy: Option<&NodeAffinity>, mutable: &mut Affinity) {
    let Some(policy) = policy else { return };
    let Some(target) = mutable.node_affinity.as_mut() else {
        mutable.node_affinity = Some(policy.clone());
        return;
    };

    if let Some(preferred) = policy
        .preferred_during_scheduling_ignored_during_execution
        .as_deref()
    {
        union_into(
            preferred,
            &mut target.preferred_during_scheduling_ignored_during_execution,
        );
    }

    if let Some(required) = policy
        .required_during_scheduling_ignored_during_execution
        .as_ref()
    {
        match target
            .required_during_scheduling_ignored_during_execution
            .take()
        {
            None => {
                target.required_during_scheduling_ignored_during_execution =
                    Some(required.clone());
            }
            Some(mut existing) => {
                existing.node_selector_terms = cross_node_selector_terms(
                    &required.node_selector_terms,
                    &existing.node_selector_terms,
                );
                target.required_during_scheduling_ignored_during_execution = Some(existing);
            }
        }
    }
}

fn merge_pod_affinity(policy: Option<&PodAffinity>, mutable: &mut Affinity) {
    let Some(policy) = policy else { return };
    let Some(target) = mutable.pod_affinity.as_mut() else {
        mutable.pod_affinity = Some(policy.clone());
        return;
    };

    if let Some(preferred) = policy
        .preferred_during_scheduling_ignored_during_execution
        .as_deref()
    {
        union_into(
            preferred,
            &mut target.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(required) = policy
        .required_during_scheduling_ignored_during_execution
        .as_deref()
    {
        union_into(
            required,
            &mut target.required_during_scheduling_ignored_during_execution,
        );
    }
}

fn merge_pod_anti_affinity(policy: Option<&PodAntiAffinity>, mutable: &mut Affinity) {
    let Some(policy) = policy else { return };
    let Some(target) = mutable.pod_anti_affinity.as_mut() else {
        mutable.pod_anti_affinity = Some(policy.clone());
        return;
    };

    if let Some(preferred) = policy
        .preferred_during_scheduling_ignored_during_execution
        .as_deref()
    {
        union_into(
            preferred,
            &mut target.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(required) = policy
        .required_during_scheduling_ignored_during_execution
        .as_deref()
    {
        union_into(
            required,
            &mut target.required_during_scheduling_ignored_during_execution,
        );
    }
}

/// Appends each source element absent from the target list, creating the list
/// if needed. Equality is structural.
fn union_into<T: PartialEq + Clone>(source: &[T], target: &mut Option<Vec<T>>) {
    if source.is_empty() {
        return;
    }
    let target = target.get_or_insert_with(Vec::new);
    for item in source {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Combines two required node-affinity term lists.
///
/// Each list is a disjunction of conjunctive terms, so "policy AND pod" is the
/// product of the two lists, with every output term the union of one policy
/// term and one pod term (policy requirements first). An empty side yields the
/// other side unchanged.
fn cross_node_selector_terms(
    policy: &[NodeSelectorTerm],
    pod: &[NodeSelectorTerm],
) -> Vec<NodeSelectorTerm> {
    if policy.is_empty() {
        return pod.to_vec();
    }
    if pod.is_empty() {
        return policy.to_vec();
    }

    let mut product = Vec::with_capacity(policy.len() * pod.len());
    for p in policy {
        for q in pod {
            product.push(NodeSelectorTerm {
                match_expressions: union_requirements(
                    p.match_expressions.as_deref(),
                    q.match_expressions.as_deref(),
                ),
                match_fields: union_requirements(
                    p.match_fields.as_deref(),
                    q.match_fields.as_deref(),
                ),
            });
        }
    }
    product
}

fn union_requirements(
    policy: Option<&[NodeSelectorRequirement]>,
    pod: Option<&[NodeSelectorRequirement]>,
) -> Option<Vec<NodeSelectorRequirement>> {
    let mut merged: Vec<NodeSelectorRequirement> = policy.map(<[_]>::to_vec).unwrap_or_default();
    for req in pod.into_iter().flatten() {
        if !merged.contains(req) {
            merged.push(req.clone());
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

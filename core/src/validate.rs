//! Structural validation of policy objects.
//!
//! Mirrors the API server's own rules for the embedded pod scheduling fields
//! so that a policy admitted here can always be applied verbatim to a pod
//! template later.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodAffinity,
    PodAffinityTerm, PodAntiAffinity, PreferredSchedulingTerm, Toleration,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use regex::Regex;
use scheduling_policy_k8s_api::{
    labels::Selector,
    policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy},
};
use std::collections::BTreeMap;
use std::fmt;

const DNS1123_SUBDOMAIN: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const DNS1123_SUBDOMAIN_MAX: usize = 253;

const QUALIFIED_NAME: &str = r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";
const QUALIFIED_NAME_MAX: usize = 63;

const LABEL_VALUE_MAX: usize = 63;

/// A single field-scoped validation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn invalid(field: impl Into<String>, value: impl fmt::Debug, message: impl fmt::Display) -> Self {
        Self {
            field: field.into(),
            message: format!("invalid value {value:?}: {message}"),
        }
    }

    fn required(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Joins an error list into a single denial message.
pub fn aggregate(errs: &[FieldError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn validate_policy(policy: &PodSchedulingPolicy) -> Vec<FieldError> {
    let mut errs = Vec::new();
    validate_metadata(&policy.metadata, true, &mut errs);
    if let Some(selector) = policy.spec.pod_selector.as_ref() {
        validate_policy_selector(selector, "spec.podSelector", &mut errs);
    }
    validate_directives(
        policy.spec.node_selector.as_ref(),
        policy.spec.node_name.as_deref(),
        policy.spec.affinity.as_ref(),
        policy.spec.tolerations.as_deref(),
        &mut errs,
    );
    errs
}

pub fn validate_cluster_policy(policy: &ClusterPodSchedulingPolicy) -> Vec<FieldError> {
    let mut errs = Vec::new();
    validate_metadata(&policy.metadata, false, &mut errs);
    if let Some(selector) = policy.spec.namespace_selector.as_ref() {
        validate_policy_selector(selector, "spec.namespaceSelector", &mut errs);
    }
    if let Some(selector) = policy.spec.pod_selector.as_ref() {
        validate_policy_selector(selector, "spec.podSelector", &mut errs);
    }
    validate_directives(
        policy.spec.node_selector.as_ref(),
        policy.spec.node_name.as_deref(),
        policy.spec.affinity.as_ref(),
        policy.spec.tolerations.as_deref(),
        &mut errs,
    );
    errs
}

fn validate_directives(
    node_selector: Option<&BTreeMap<String, String>>,
    node_name: Option<&str>,
    affinity: Option<&Affinity>,
    tolerations: Option<&[Toleration]>,
    errs: &mut Vec<FieldError>,
) {
    if let Some(node_selector) = node_selector {
        for (key, value) in node_selector {
            validate_qualified_name(key, &format!("spec.nodeSelector.{key}"), errs);
            validate_label_value(value, &format!("spec.nodeSelector.{key}"), errs);
        }
    }

    if let Some(node_name) = node_name {
        if !node_name.is_empty() {
            validate_dns_subdomain(node_name, "spec.nodeName", errs);
        }
    }

    if let Some(affinity) = affinity {
        validate_affinity(affinity, "spec.affinity", errs);
    }

    for (i, toleration) in tolerations.into_iter().flatten().enumerate() {
        validate_toleration(toleration, &format!("spec.tolerations[{i}]"), errs);
    }
}

fn validate_metadata(meta: &ObjectMeta, namespaced: bool, errs: &mut Vec<FieldError>) {
    match meta.name.as_deref() {
        Some(name) if !name.is_empty() => validate_dns_subdomain(name, "metadata.name", errs),
        _ => match meta.generate_name.as_deref() {
            Some(prefix) if !prefix.is_empty() => {
                // A generated name gets a random suffix, so only the prefix
                // (sans any trailing dash) has to be a valid name.
                validate_dns_subdomain(
                    prefix.trim_end_matches('-'),
                    "metadata.generateName",
                    errs,
                );
            }
            _ => errs.push(FieldError::required(
                "metadata.name",
                "name or generateName is required",
            )),
        },
    }

    let has_namespace = meta.namespace.as_deref().is_some_and(|ns| !ns.is_empty());
    if namespaced && !has_namespace {
        errs.push(FieldError::required("metadata.namespace", "namespace is required"));
    }
    if !namespaced && has_namespace {
        errs.push(FieldError::required(
            "metadata.namespace",
            "namespace is not allowed on cluster-scoped objects",
        ));
    }
}

fn validate_policy_selector(selector: &Selector, field: &str, errs: &mut Vec<FieldError>) {
    if let Err(error) = selector.validate() {
        errs.push(FieldError::required(field, error.to_string()));
    }

    for (key, value) in selector.labels().into_iter().flatten() {
        validate_qualified_name(key, &format!("{field}.matchLabels.{key}"), errs);
        validate_label_value(value, &format!("{field}.matchLabels.{key}"), errs);
    }

    for (i, expr) in selector.expressions().into_iter().flatten().enumerate() {
        let expr_field = format!("{field}.matchExpressions[{i}]");
        validate_qualified_name(expr.key(), &format!("{expr_field}.key"), errs);
        for value in expr.values().into_iter().flatten() {
            validate_label_value(value, &format!("{expr_field}.values"), errs);
        }
    }
}

fn validate_affinity(affinity: &Affinity, field: &str, errs: &mut Vec<FieldError>) {
    if let Some(node_affinity) = affinity.node_affinity.as_ref() {
        validate_node_affinity(node_affinity, &format!("{field}.nodeAffinity"), errs);
    }
    if let Some(pod_affinity) = affinity.pod_affinity.as_ref() {
        validate_pod_affinity(pod_affinity, &format!("{field}.podAffinity"), errs);
    }
    if let Some(pod_anti_affinity) = affinity.pod_anti_affinity.as_ref() {
        validate_pod_anti_affinity(pod_anti_affinity, &format!("{field}.podAntiAffinity"), errs);
    }
}

fn validate_node_affinity(node_affinity: &NodeAffinity, field: &str, errs: &mut Vec<FieldError>) {
    if let Some(required) = node_affinity
        .required_during_scheduling_ignored_during_execution
        .as_ref()
    {
        validate_node_selector(
            required,
            &format!("{field}.requiredDuringSchedulingIgnoredDuringExecution"),
            errs,
        );
    }

    for (i, term) in node_affinity
        .preferred_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .enumerate()
    {
        validate_preferred_scheduling_term(
            term,
            &format!("{field}.preferredDuringSchedulingIgnoredDuringExecution[{i}]"),
            errs,
        );
    }
}

fn validate_node_selector(selector: &NodeSelector, field: &str, errs: &mut Vec<FieldError>) {
    if selector.node_selector_terms.is_empty() {
        errs.push(FieldError::required(
            format!("{field}.nodeSelectorTerms"),
            "must have at least one node selector term",
        ));
    }
    for (i, term) in selector.node_selector_terms.iter().enumerate() {
        validate_node_selector_term(term, &format!("{field}.nodeSelectorTerms[{i}]"), errs);
    }
}

fn validate_preferred_scheduling_term(
    term: &PreferredSchedulingTerm,
    field: &str,
    errs: &mut Vec<FieldError>,
) {
    if !(1..=100).contains(&term.weight) {
        errs.push(FieldError::invalid(
            format!("{field}.weight"),
            term.weight,
            "must be in the range 1-100",
        ));
    }
    validate_node_selector_term(&term.preference, &format!("{field}.preference"), errs);
}

fn validate_node_selector_term(term: &NodeSelectorTerm, field: &str, errs: &mut Vec<FieldError>) {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        errs.push(FieldError::required(
            field,
            "must have at least one node selector requirement",
        ));
    }

    for (i, req) in expressions.iter().enumerate() {
        validate_node_selector_requirement(req, &format!("{field}.matchExpressions[{i}]"), errs);
    }
    for (i, req) in fields.iter().enumerate() {
        validate_node_field_requirement(req, &format!("{field}.matchFields[{i}]"), errs);
    }
}

fn validate_node_selector_requirement(
    req: &NodeSelectorRequirement,
    field: &str,
    errs: &mut Vec<FieldError>,
) {
    validate_qualified_name(&req.key, &format!("{field}.key"), errs);

    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" | "NotIn" => {
            if values.is_empty() {
                errs.push(FieldError::required(
                    format!("{field}.values"),
                    "must be specified when `operator` is 'In' or 'NotIn'",
                ));
            }
        }
        "Exists" | "DoesNotExist" => {
            if !values.is_empty() {
                errs.push(FieldError::required(
                    format!("{field}.values"),
                    "may not be specified when `operator` is 'Exists' or 'DoesNotExist'",
                ));
            }
        }
        "Gt" | "Lt" => {
            if values.len() != 1 {
                errs.push(FieldError::required(
                    format!("{field}.values"),
                    "must have a single element when `operator` is 'Gt' or 'Lt'",
                ));
            }
            for value in values {
                if value.parse::<i64>().is_err() {
                    errs.push(FieldError::invalid(
                        format!("{field}.values"),
                        value,
                        "must be an integer when `operator` is 'Gt' or 'Lt'",
                    ));
                }
            }
        }
        operator => errs.push(FieldError::invalid(
            format!("{field}.operator"),
            operator,
            "not a valid selector operator",
        )),
    }
}

fn validate_node_field_requirement(
    req: &NodeSelectorRequirement,
    field: &str,
    errs: &mut Vec<FieldError>,
) {
    validate_qualified_name(&req.key, &format!("{field}.key"), errs);

    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" | "NotIn" => {
            if values.len() != 1 {
                errs.push(FieldError::required(
                    format!("{field}.values"),
                    "must have a single element",
                ));
            }
        }
        operator => errs.push(FieldError::invalid(
            format!("{field}.operator"),
            operator,
            "field selectors support only 'In' and 'NotIn'",
        )),
    }
}

fn validate_pod_affinity(affinity: &PodAffinity, field: &str, errs: &mut Vec<FieldError>) {
    for (i, term) in affinity
        .required_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .enumerate()
    {
        validate_pod_affinity_term(
            term,
            &format!("{field}.requiredDuringSchedulingIgnoredDuringExecution[{i}]"),
            errs,
        );
    }
    for (i, term) in affinity
        .preferred_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .enumerate()
    {
        validate_weighted_pod_affinity_term(
            term,
            &format!("{field}.preferredDuringSchedulingIgnoredDuringExecution[{i}]"),
            errs,
        );
    }
}

fn validate_pod_anti_affinity(affinity: &PodAntiAffinity, field: &str, errs: &mut Vec<FieldError>) {
    for (i, term) in affinity
        .required_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .enumerate()
    {
        validate_pod_affinity_term(
            term,
            &format!("{field}.requiredDuringSchedulingIgnoredDuringExecution[{i}]"),
            errs,
        );
    }
    for (i, term) in affinity
        .preferred_during_scheduling_ignored_during_execution
        .iter()
        .flatten()
        .enumerate()
    {
        validate_weighted_pod_affinity_term(
            term,
            &format!("{field}.preferredDuringSchedulingIgnoredDuringExecution[{i}]"),
            errs,
        );
    }
}

fn validate_weighted_pod_affinity_term(
    term: &WeightedPodAffinityTerm,
    field: &str,
    errs: &mut Vec<FieldError>,
) {
    if !(1..=100).contains(&term.weight) {
        errs.push(FieldError::invalid(
            format!("{field}.weight"),
            term.weight,
            "must be in the range 1-100",
        ));
    }
    validate_pod_affinity_term(&term.pod_affinity_term, &format!("{field}.podAffinityTerm"), errs);
}

fn validate_pod_affinity_term(term: &PodAffinityTerm, field: &str, errs: &mut Vec<FieldError>) {
    if term.topology_key.is_empty() {
        errs.push(FieldError::required(
            format!("{field}.topologyKey"),
            "can not be empty",
        ));
    }
    if let Some(selector) = term.label_selector.as_ref() {
        validate_label_selector(selector, &format!("{field}.labelSelector"), errs);
    }
    if let Some(selector) = term.namespace_selector.as_ref() {
        validate_label_selector(selector, &format!("{field}.namespaceSelector"), errs);
    }
}

fn validate_label_selector(selector: &LabelSelector, field: &str, errs: &mut Vec<FieldError>) {
    for (key, value) in selector.match_labels.iter().flatten() {
        validate_qualified_name(key, &format!("{field}.matchLabels.{key}"), errs);
        validate_label_value(value, &format!("{field}.matchLabels.{key}"), errs);
    }

    for (i, req) in selector.match_expressions.iter().flatten().enumerate() {
        let req_field = format!("{field}.matchExpressions[{i}]");
        validate_qualified_name(&req.key, &format!("{req_field}.key"), errs);
        let values = req.values.as_deref().unwrap_or_default();
        match req.operator.as_str() {
            "In" | "NotIn" => {
                if values.is_empty() {
                    errs.push(FieldError::required(
                        format!("{req_field}.values"),
                        "must be specified when `operator` is 'In' or 'NotIn'",
                    ));
                }
            }
            "Exists" | "DoesNotExist" => {
                if !values.is_empty() {
                    errs.push(FieldError::required(
                        format!("{req_field}.values"),
                        "may not be specified when `operator` is 'Exists' or 'DoesNotExist'",
                    ));
                }
            }
            operator => errs.push(FieldError::invalid(
                format!("{req_field}.operator"),
                operator,
                "not a valid selector operator",
            )),
        }
        for value in values {
            validate_label_value(value, &format!("{req_field}.values"), errs);
        }
    }
}

fn validate_toleration(toleration: &Toleration, field: &str, errs: &mut Vec<FieldError>) {
    let key = toleration.key.as_deref().unwrap_or_default();
    let operator = toleration.operator.as_deref().unwrap_or_default();
    let value = toleration.value.as_deref().unwrap_or_default();
    let effect = toleration.effect.as_deref().unwrap_or_default();

    if key.is_empty() && operator != "Exists" {
        errs.push(FieldError::invalid(
            format!("{field}.operator"),
            operator,
            "operator must be 'Exists' when `key` is empty",
        ));
    }
    if !key.is_empty() {
        validate_qualified_name(key, &format!("{field}.key"), errs);
    }

    match operator {
        // An empty operator means Equal.
        "" | "Equal" => validate_label_value(value, &format!("{field}.value"), errs),
        "Exists" => {
            if !value.is_empty() {
                errs.push(FieldError::invalid(
                    format!("{field}.operator"),
                    value,
                    "value must be empty when `operator` is 'Exists'",
                ));
            }
        }
        operator => errs.push(FieldError::invalid(
            format!("{field}.operator"),
            operator,
            "not a valid toleration operator",
        )),
    }

    if !effect.is_empty() && !matches!(effect, "NoSchedule" | "PreferNoSchedule" | "NoExecute") {
        errs.push(FieldError::invalid(
            format!("{field}.effect"),
            effect,
            "not a valid taint effect",
        ));
    }

    if toleration.toleration_seconds.is_some() && effect != "NoExecute" {
        errs.push(FieldError::invalid(
            format!("{field}.effect"),
            effect,
            "effect must be 'NoExecute' when `tolerationSeconds` is set",
        ));
    }
}

fn validate_dns_subdomain(name: &str, field: &str, errs: &mut Vec<FieldError>) {
    let regex = Regex::new(DNS1123_SUBDOMAIN).expect("should compile");
    if name.len() > DNS1123_SUBDOMAIN_MAX {
        errs.push(FieldError::invalid(
            field,
            name,
            format!("must be no more than {DNS1123_SUBDOMAIN_MAX} characters"),
        ));
    }
    if !regex.is_match(name) {
        errs.push(FieldError::invalid(
            field,
            name,
            "must be a lowercase RFC 1123 subdomain consisting of alphanumeric characters, \
             '-' or '.'",
        ));
    }
}

fn validate_qualified_name(name: &str, field: &str, errs: &mut Vec<FieldError>) {
    let (prefix, name_part) = match name.split_once('/') {
        Some((prefix, name_part)) => (Some(prefix), name_part),
        None => (None, name),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            errs.push(FieldError::invalid(field, name, "prefix part must be non-empty"));
        } else {
            validate_dns_subdomain(prefix, field, errs);
        }
    }

    let regex = Regex::new(QUALIFIED_NAME).expect("should compile");
    if name_part.is_empty() {
        errs.push(FieldError::invalid(field, name, "name part must be non-empty"));
    } else {
        if name_part.len() > QUALIFIED_NAME_MAX {
            errs.push(FieldError::invalid(
                field,
                name,
                format!("name part must be no more than {QUALIFIED_NAME_MAX} characters"),
            ));
        }
        if !regex.is_match(name_part) {
            errs.push(FieldError::invalid(
                field,
                name,
                "name part must consist of alphanumeric characters, '-', '_' or '.', and must \
                 start and end with an alphanumeric character",
            ));
        }
    }
}

fn validate_label_value(value: &str, field: &str, errs: &mut Vec<FieldError>) {
    if value.is_empty() {
        return;
    }
    if value.len() > LABEL_VALUE_MAX {
        errs.push(FieldError::invalid(
            field,
            value,
            format!("must be no more than {LABEL_VALUE_MAX} characters"),
        ));
    }
    let regex = Regex::new(QUALIFIED_NAME).expect("should compile");
    if !regex.is_match(value) {
        errs.push(FieldError::invalid(
            field,
            value,
            "must consist of alphanumeric characters, '-', '_' or '.', and must start and end \
             with an alphanumeric character",
        ));
    }
}

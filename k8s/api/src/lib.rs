#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::labels::Labels;
pub use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::{CronJob, Job},
    core::v1::{
        Affinity, Namespace, NodeAffinity, NodeSelector, NodeSelectorRequirement,
        NodeSelectorTerm, Pod, PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec,
        PodTemplateSpec, PreferredSchedulingTerm, ReplicationController, Toleration,
        WeightedPodAffinityTerm,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Resource, ResourceExt},
    Client, Error,
};

mod cluster_pod_scheduling_policy;
mod pod_scheduling_policy;

pub use self::cluster_pod_scheduling_policy::{
    ClusterPodSchedulingPolicy, ClusterPodSchedulingPolicySpec,
};
pub use self::pod_scheduling_policy::{PodSchedulingPolicy, PodSchedulingPolicySpec};

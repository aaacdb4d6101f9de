//! Locates the pod template embedded in each supported workload kind.

use kube::core::GroupVersionKind;
use scheduling_policy_k8s_api::{
    CronJob, DaemonSet, Deployment, Job, Labels, Pod, PodSpec, ReplicaSet,
    ReplicationController, StatefulSet,
};
use serde_json::Value;

/// A workload object decoded from an admission request. Each supported kind
/// embeds its pod template at a different path; this type is the only place
/// that knows where.
#[derive(Clone, Debug)]
pub enum Workload {
    Pod(Pod),
    ReplicationController(ReplicationController),
    ReplicaSet(ReplicaSet),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Job(Job),
    CronJob(CronJob),
}

impl Workload {
    /// Decodes the admitted object for a supported kind; `None` when the kind
    /// is not supported. The API version is deliberately ignored so that a
    /// kind served under several versions (`batch/v1beta1` CronJobs) keeps
    /// working.
    pub fn decode(kind: &GroupVersionKind, object: Value) -> Result<Option<Self>, serde_json::Error> {
        let workload = match (
            kind.group.to_ascii_lowercase().as_str(),
            kind.kind.to_ascii_lowercase().as_str(),
        ) {
            ("", "pod") => Self::Pod(serde_json::from_value(object)?),
            ("", "replicationcontroller") => {
                Self::ReplicationController(serde_json::from_value(object)?)
            }
            ("apps", "replicaset") => Self::ReplicaSet(serde_json::from_value(object)?),
            ("apps", "deployment") => Self::Deployment(serde_json::from_value(object)?),
            ("apps", "statefulset") => Self::StatefulSet(serde_json::from_value(object)?),
            ("apps", "daemonset") => Self::DaemonSet(serde_json::from_value(object)?),
            ("batch", "job") => Self::Job(serde_json::from_value(object)?),
            ("batch", "cronjob") => Self::CronJob(serde_json::from_value(object)?),
            _ => return Ok(None),
        };
        Ok(Some(workload))
    }

    /// JSON pointer to the pod spec within the serialized object.
    pub fn pod_spec_path(&self) -> &'static str {
        match self {
            Self::Pod(_) => "/spec",
            Self::CronJob(_) => "/spec/jobTemplate/spec/template/spec",
            _ => "/spec/template/spec",
        }
    }

    /// The embedded pod spec, when the object carries one.
    pub fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        match self {
            Self::Pod(pod) => pod.spec.as_mut(),
            Self::ReplicationController(rc) => rc.spec.as_mut()?.template.as_mut()?.spec.as_mut(),
            Self::ReplicaSet(rs) => rs.spec.as_mut()?.template.as_mut()?.spec.as_mut(),
            Self::Deployment(deployment) => deployment.spec.as_mut()?.template.spec.as_mut(),
            Self::StatefulSet(sts) => sts.spec.as_mut()?.template.spec.as_mut(),
            Self::DaemonSet(ds) => ds.spec.as_mut()?.template.spec.as_mut(),
            Self::Job(job) => job.spec.as_mut()?.template.spec.as_mut(),
            Self::CronJob(cj) => cj
                .spec
                .as_mut()?
                .job_template
                .spec
                .as_mut()?
                .template
                .spec
                .as_mut(),
        }
    }

    /// The labels of the pods the object will create, matched against policy
    /// pod selectors.
    pub fn pod_labels(&self) -> Labels {
        let labels = match self {
            Self::Pod(pod) => pod.metadata.labels.clone(),
            Self::ReplicationController(rc) => rc
                .spec
                .as_ref()
                .and_then(|spec| spec.template.as_ref())
                .and_then(|t| t.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::ReplicaSet(rs) => rs
                .spec
                .as_ref()
                .and_then(|spec| spec.template.as_ref())
                .and_then(|t| t.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::Deployment(deployment) => deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::StatefulSet(sts) => sts
                .spec
                .as_ref()
                .and_then(|spec| spec.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::DaemonSet(ds) => ds
                .spec
                .as_ref()
                .and_then(|spec| spec.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::Job(job) => job
                .spec
                .as_ref()
                .and_then(|spec| spec.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
            Self::CronJob(cj) => cj
                .spec
                .as_ref()
                .and_then(|spec| spec.job_template.spec.as_ref())
                .and_then(|spec| spec.template.metadata.as_ref())
                .and_then(|m| m.labels.clone()),
        };
        labels.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gvk(group: &str, kind: &str) -> GroupVersionKind {
        GroupVersionKind::gvk(group, "v1", kind)
    }

    #[test]
    fn unsupported_kind_is_none() {
        let decoded = Workload::decode(&gvk("", "Service"), json!({})).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn decodes_a_pod() {
        let mut workload = Workload::decode(
            &gvk("", "Pod"),
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "p", "labels": {"app": "web"}},
                "spec": {"containers": [{"name": "c", "image": "nginx"}]},
            }),
        )
        .unwrap()
        .unwrap();

        assert_eq!(workload.pod_spec_path(), "/spec");
        assert_eq!(
            workload.pod_labels(),
            Some(("app", "web")).into_iter().collect(),
        );
        assert!(workload.pod_spec_mut().is_some());
    }

    #[test]
    fn decodes_a_deployment_template() {
        let mut workload = Workload::decode(
            &gvk("apps", "Deployment"),
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "labels": {"top": "level"}},
                "spec": {
                    "selector": {"matchLabels": {"app": "web"}},
                    "template": {
                        "metadata": {"labels": {"app": "web"}},
                        "spec": {"containers": [{"name": "c", "image": "nginx"}]},
                    },
                },
            }),
        )
        .unwrap()
        .unwrap();

        assert_eq!(workload.pod_spec_path(), "/spec/template/spec");
        // Template labels, not the object's own labels.
        assert_eq!(
            workload.pod_labels(),
            Some(("app", "web")).into_iter().collect(),
        );
        workload.pod_spec_mut().unwrap().node_name = Some("node-7".to_string());
    }

    #[test]
    fn decodes_a_cron_job_template() {
        let mut workload = Workload::decode(
            &gvk("batch", "CronJob"),
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {"name": "tick"},
                "spec": {
                    "schedule": "* * * * *",
                    "jobTemplate": {
                        "spec": {
                            "template": {
                                "metadata": {"labels": {"app": "tick"}},
                                "spec": {"containers": [{"name": "c", "image": "busybox"}]},
                            },
                        },
                    },
                },
            }),
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            workload.pod_spec_path(),
            "/spec/jobTemplate/spec/template/spec",
        );
        assert_eq!(
            workload.pod_labels(),
            Some(("app", "tick")).into_iter().collect(),
        );
        assert!(workload.pod_spec_mut().is_some());
    }

    #[test]
    fn missing_template_yields_no_pod_spec() {
        let mut workload = Workload::decode(
            &gvk("", "ReplicationController"),
            json!({
                "apiVersion": "v1",
                "kind": "ReplicationController",
                "metadata": {"name": "rc"},
                "spec": {},
            }),
        )
        .unwrap()
        .unwrap();

        assert!(workload.pod_spec_mut().is_none());
        assert_eq!(workload.pod_labels(), Labels::default());
    }

    #[test]
    fn malformed_object_is_an_error() {
        let result = Workload::decode(
            &gvk("apps", "Deployment"),
            json!({"spec": {"template": "not-an-object"}}),
        );
        assert!(result.is_err());
    }
}

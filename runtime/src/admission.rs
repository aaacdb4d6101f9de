//! The admission service: validates policy objects and patches scheduling
//! directives into admitted workloads.
//!
//! Workload admission is fail-open: any infrastructure failure is reported as
//! an allow-with-message so that policy trouble never blocks rollouts. Policy
//! admission is fail-closed: a structurally invalid policy is denied.

use crate::{
    metrics::Metrics,
    store::{PolicyReader, Readiness},
    workload::Workload,
};
use anyhow::{anyhow, bail, Context, Result};
use futures::future;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource, ResourceExt};
use scheduling_policy_core::{inject::Injector, select, validate};
use scheduling_policy_k8s_api::{
    policy::{ClusterPodSchedulingPolicy, PodSchedulingPolicy},
    Labels,
};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, trace, warn, Instrument};

pub struct Admission<R> {
    reader: Arc<R>,
    readiness: Readiness,
    injector: Arc<Injector>,
    metrics: Metrics,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<R> Clone for Admission<R> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            readiness: self.readiness.clone(),
            injector: self.injector.clone(),
            metrics: self.metrics.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R> tower::Service<Request<hyper::body::Incoming>> for Admission<R>
where
    R: PolicyReader + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            use http_body_util::BodyExt;

            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match TryInto::<AdmissionRequest>::try_into(review) {
                Ok(req) => {
                    debug!(?req);
                    let span = tracing::info_span!(
                        "admission",
                        kind = %req.kind.kind,
                        namespace = %req.namespace.as_deref().unwrap_or_default(),
                        name = %req.name,
                    );
                    admission.admit(req).instrument(span).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl<R: PolicyReader> Admission<R> {
    pub fn new(reader: Arc<R>, readiness: Readiness, metrics: Metrics, timeout: Duration) -> Self {
        Self {
            reader,
            readiness,
            injector: Arc::new(Injector::default()),
            metrics,
            timeout,
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        // No admission proceeds until the caches have completed one sync.
        self.readiness.wait().await;
        self.metrics.incr_processed();

        if is_kind::<PodSchedulingPolicy>(&req) {
            return self.admit_policy(req, validate::validate_policy);
        }
        if is_kind::<ClusterPodSchedulingPolicy>(&req) {
            return self.admit_policy(req, validate::validate_cluster_policy);
        }

        let rsp = AdmissionResponse::from(&req);
        let mutation = match time::timeout(self.timeout, self.mutate(&req)).await {
            Ok(mutation) => mutation,
            Err(_) => Err(anyhow!("deadline exceeded while applying scheduling policies")),
        };
        match mutation {
            Ok(None) => {
                self.metrics.incr_allowed();
                rsp
            }
            Ok(Some(patch)) => match rsp.with_patch(patch) {
                Ok(rsp) => {
                    info!("Mutated response for request");
                    self.metrics.incr_allowed();
                    self.metrics.incr_mutated();
                    rsp
                }
                Err(error) => {
                    warn!(%error, "Failed to encode patch");
                    self.metrics.incr_error();
                    allow_with_message(AdmissionResponse::from(&req), error.to_string())
                }
            },
            Err(error) => {
                warn!(error = %format!("{error:#}"), "Failed to process admission request");
                self.metrics.incr_error();
                allow_with_message(AdmissionResponse::from(&req), format!("{error:#}"))
            }
        }
    }

    fn admit_policy<T>(
        &self,
        req: AdmissionRequest,
        validate: fn(&T) -> Vec<validate::FieldError>,
    ) -> AdmissionResponse
    where
        T: DeserializeOwned,
    {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();

        let Some(obj) = req.object else {
            self.metrics.incr_denied();
            return rsp.deny("admission request missing 'object'");
        };
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let policy: T = match serde_json::to_value(&obj).and_then(serde_json::from_value) {
            Ok(policy) => policy,
            Err(error) => {
                info!(%error, %kind, "Failed to deserialize policy");
                self.metrics.incr_denied();
                return rsp.deny(format!("failed to deserialize {kind}: {error}"));
            }
        };

        let errs = validate(&policy);
        if errs.is_empty() {
            self.metrics.incr_allowed();
            return rsp;
        }

        let message = validate::aggregate(&errs);
        info!(%message, %ns, %name, %kind, "Denied");
        self.metrics.incr_denied();
        rsp.deny(message)
    }

    /// Merges every applicable policy into the admitted object's pod template
    /// and returns the patch, or `None` when there is nothing to change.
    async fn mutate(&self, req: &AdmissionRequest) -> Result<Option<json_patch::Patch>> {
        let obj = req
            .object
            .as_ref()
            .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
        let original = serde_json::to_value(obj).context("failed to encode admitted object")?;

        let Some(mut workload) = Workload::decode(&req.kind, original.clone())
            .with_context(|| format!("failed to decode {}", req.kind.kind))?
        else {
            bail!(
                "no processor registered for kind: {}.{}.{}",
                req.kind.group,
                req.kind.version,
                req.kind.kind
            );
        };

        let namespace = req
            .namespace
            .clone()
            .or_else(|| obj.namespace())
            .ok_or_else(|| anyhow!("admission request missing 'namespace'"))?;

        let pod_labels = workload.pod_labels();

        let cluster = self
            .reader
            .list_cluster_policies()
            .await
            .context("failed to list cluster scheduling policies")?;
        let ns = self
            .reader
            .get_namespace(&namespace)
            .await
            .with_context(|| format!("failed to get namespace {namespace}"))?;
        let namespaced = self
            .reader
            .list_policies(&namespace)
            .await
            .context("failed to list scheduling policies")?;

        let ns_labels = Labels::from(ns.metadata.labels.clone());
        let directives = select::applicable(&cluster, &namespaced, &ns_labels, &pod_labels)?;
        if directives.is_empty() {
            debug!("No applicable scheduling policies");
            return Ok(None);
        }
        debug!(policies = directives.len(), "Applying scheduling policies");

        let template_path = workload.pod_spec_path();
        let Some(pod_spec) = workload.pod_spec_mut() else {
            debug!("Object carries no pod template");
            return Ok(None);
        };
        self.injector.apply_all(&directives, pod_spec);

        // Splice the mutated template back into the raw object so the patch
        // touches nothing outside it.
        let mut mutated = original.clone();
        let slot = mutated
            .pointer_mut(template_path)
            .ok_or_else(|| anyhow!("pod template missing at {template_path}"))?;
        *slot = serde_json::to_value(&*pod_spec).context("failed to encode pod template")?;

        let patch = json_patch::diff(&original, &mutated);
        if patch.0.is_empty() {
            return Ok(None);
        }
        Ok(Some(patch))
    }
}

fn allow_with_message(mut rsp: AdmissionResponse, message: String) -> AdmissionResponse {
    rsp.result.message = message;
    rsp
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

//! Readiness tracking for applied objects.
//!
//! Live objects come back from the transport as canonical trees; kinds
//! with rollout semantics get their `status` subtree decoded into the
//! typed k8s-openapi status structs before judging readiness. Spec-side
//! inputs (replica counts, generation) are read straight off the tree so
//! that sparse live objects still track. Everything else counts as ready
//! once the apply is acknowledged.

use futures_timer::Delay;
use k8s_openapi::api::apps::v1::{DeploymentStatus, StatefulSetStatus};
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::NamespaceStatus;
use std::convert::TryFrom;
use std::time::{Duration, Instant};

use super::kinds;
use super::kube::{is_transient, ClusterTransport};
use super::node::Node;
use super::{CanonicalObject, Identity};
use super::{ErrorKind, Result};

/// Where an object stands on its way to ready.
#[derive(Clone, Debug, PartialEq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    /// terminal: waiting longer cannot help
    Failed(String),
}

/// Decode the live `status` subtree into its typed view.
fn status_view<T: serde::de::DeserializeOwned>(obj: &CanonicalObject) -> Result<Option<T>> {
    match obj.tree().get("status") {
        None => Ok(None),
        Some(status) => {
            let value = serde_json::to_value(status)?;
            Ok(Some(serde_json::from_value(value)?))
        }
    }
}

fn spec_replicas(obj: &CanonicalObject) -> i32 {
    obj.tree()
        .dig(&["spec", "replicas"])
        .and_then(Node::as_i64)
        .unwrap_or(1) as i32
}

fn generation(obj: &CanonicalObject) -> i64 {
    obj.tree()
        .dig(&["metadata", "generation"])
        .and_then(Node::as_i64)
        .unwrap_or(0)
}

/// A summary of a Deployment's rollout state
#[derive(Debug)]
pub struct DeploySummary {
    pub expected: i32,
    pub ready: i32,
    pub generation: i64,
    pub observed_generation: i64,
    pub failure: Option<String>,
}

impl TryFrom<&CanonicalObject> for DeploySummary {
    type Error = super::Error;

    fn try_from(obj: &CanonicalObject) -> Result<DeploySummary> {
        let status: DeploymentStatus = status_view(obj)?.unwrap_or_default();
        let mut failure = None;
        if let Some(conds) = &status.conditions {
            if let Some(pcond) = conds.iter().find(|c| c.type_ == "Progressing") {
                if pcond.reason.as_deref() == Some("ProgressDeadlineExceeded") {
                    failure = Some(
                        pcond
                            .message
                            .clone()
                            .unwrap_or_else(|| "progress deadline exceeded".into()),
                    );
                }
            }
        }
        Ok(DeploySummary {
            expected: spec_replicas(obj),
            ready: status.ready_replicas.unwrap_or(0),
            generation: generation(obj),
            observed_generation: status.observed_generation.unwrap_or(0),
            failure,
        })
    }
}

impl DeploySummary {
    fn readiness(&self) -> Readiness {
        if let Some(reason) = &self.failure {
            return Readiness::Failed(reason.clone());
        }
        if self.observed_generation >= self.generation && self.ready >= self.expected {
            Readiness::Ready
        } else {
            Readiness::NotReady(format!("{}/{} replicas ready", self.ready, self.expected))
        }
    }
}

/// A summary of a StatefulSet's rollout state
#[derive(Debug)]
pub struct StatefulSummary {
    pub expected: i32,
    pub ready: i32,
    pub generation: i64,
    pub observed_generation: i64,
}

impl TryFrom<&CanonicalObject> for StatefulSummary {
    type Error = super::Error;

    fn try_from(obj: &CanonicalObject) -> Result<StatefulSummary> {
        let status: Option<StatefulSetStatus> = status_view(obj)?;
        let (ready, observed) = match status {
            Some(st) => (
                st.ready_replicas.unwrap_or(0),
                st.observed_generation.unwrap_or(0),
            ),
            None => (0, 0),
        };
        Ok(StatefulSummary {
            expected: spec_replicas(obj),
            ready,
            generation: generation(obj),
            observed_generation: observed,
        })
    }
}

impl StatefulSummary {
    fn readiness(&self) -> Readiness {
        if self.observed_generation >= self.generation && self.ready >= self.expected {
            Readiness::Ready
        } else {
            Readiness::NotReady(format!("{}/{} replicas ready", self.ready, self.expected))
        }
    }
}

fn job_readiness(obj: &CanonicalObject) -> Result<Readiness> {
    let status: JobStatus = status_view(obj)?.unwrap_or_default();
    if status.succeeded.unwrap_or(0) >= 1 {
        return Ok(Readiness::Ready);
    }
    if let Some(conds) = &status.conditions {
        if let Some(failed) = conds
            .iter()
            .find(|c| c.type_ == "Failed" && c.status == "True")
        {
            return Ok(Readiness::Failed(
                failed
                    .message
                    .clone()
                    .unwrap_or_else(|| "job failed".into()),
            ));
        }
    }
    Ok(Readiness::NotReady("job has not succeeded yet".into()))
}

fn namespace_readiness(obj: &CanonicalObject) -> Result<Readiness> {
    let status: NamespaceStatus = status_view(obj)?.unwrap_or_default();
    Ok(match status.phase {
        Some(ref phase) if phase == "Active" => Readiness::Ready,
        Some(phase) => Readiness::NotReady(format!("phase {}", phase)),
        None => Readiness::NotReady("phase unknown".into()),
    })
}

/// Judge an object's readiness from its live state.
pub fn status(obj: &CanonicalObject) -> Result<Readiness> {
    let readiness = match obj.kind() {
        "Deployment" => DeploySummary::try_from(obj)?.readiness(),
        "StatefulSet" => StatefulSummary::try_from(obj)?.readiness(),
        "Job" => job_readiness(obj)?,
        "Namespace" => namespace_readiness(obj)?,
        _ => Readiness::Ready,
    };
    Ok(readiness)
}

/// Poll the transport until the object is ready, fails, or the budget
/// runs out. Transient read errors just wait for the next poll.
pub async fn await_ready<T: ClusterTransport + ?Sized>(
    transport: &T,
    id: &Identity,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    if !kinds::has_readiness(&id.kind) {
        return Ok(());
    }
    let started = Instant::now();
    loop {
        match transport.get(id).await {
            Ok(Some(live)) => match status(&live)? {
                Readiness::Ready => {
                    debug!("{} is ready after {:?}", id, started.elapsed());
                    return Ok(());
                }
                Readiness::NotReady(msg) => {
                    debug!("{} not ready: {}", id, msg);
                }
                Readiness::Failed(reason) => {
                    return Err(ErrorKind::WorkloadFailed(id.to_string(), reason).into());
                }
            },
            Ok(None) => debug!("{} not visible yet", id),
            Err(ref e) if is_transient(e) => {
                debug!("{} readiness read failed transiently: {}", id, e);
            }
            Err(e) => return Err(e),
        }
        if started.elapsed() >= timeout {
            return Err(ErrorKind::ReadinessTimeout(id.to_string(), timeout.as_secs()).into());
        }
        Delay::new(poll).await;
    }
}

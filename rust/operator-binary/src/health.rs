use std::time::Duration;

use flux_kustomize_operator_crd::HealthCheckReference;
use kube::{
    api::{DynamicObject, GroupVersionKind},
    core::GroupVersion,
    discovery::ApiResource,
    Api, Client, Discovery,
};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::utils::dynamic_api;

/// Backoff bounds for readiness polling.
const POLL_BASE: Duration = Duration::from_secs(1);
const POLL_CAP: Duration = Duration::from_secs(30);

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Health check {} has an invalid apiVersion: {}", object, source))]
    InvalidApiVersion {
        object: String,
        source: kube::core::gvk::ParseGroupVersionError,
    },

    #[snafu(display("Failed to poll {}: {}", object, source))]
    PollObject { object: String, source: kube::Error },

    #[snafu(display("Health check failed for {}: {}", object, reason))]
    CheckFailed { object: String, reason: String },

    #[snafu(display("Timed out waiting for {}: {}", object, last))]
    CheckTimeout { object: String, last: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of one readiness computation, kstatus style.
#[derive(Clone, Debug, PartialEq)]
pub enum Readiness {
    Current,
    InProgress(String),
    /// Terminal: further polling cannot succeed.
    Failed(String),
}

/// Waits for every declared health check concurrently; the first terminal
/// failure or deadline ends the stage.
pub async fn check_all(
    client: &Client,
    discovery: &Discovery,
    checks: &[HealthCheckReference],
    default_namespace: &str,
    deadline: Instant,
) -> Result<()> {
    futures::future::try_join_all(checks.iter().map(|check| {
        await_ready(client, discovery, check, default_namespace, deadline)
    }))
    .await?;
    Ok(())
}

/// Polls one object with exponential backoff until it reports Current, a
/// terminal failure, or the deadline elapses.
pub async fn await_ready(
    client: &Client,
    discovery: &Discovery,
    check: &HealthCheckReference,
    default_namespace: &str,
    deadline: Instant,
) -> Result<()> {
    let object = check.to_string();
    let gv: GroupVersion = check
        .api_version
        .parse()
        .context(InvalidApiVersionSnafu { object: &object })?;
    let gvk = GroupVersionKind {
        group: gv.group,
        version: gv.version,
        kind: check.kind.clone(),
    };
    let namespace = check.namespace.as_deref().unwrap_or(default_namespace);

    let api = match discovery.resolve_gvk(&gvk) {
        Some((ar, caps)) => dynamic_api(ar, caps, client.clone(), Some(namespace), false),
        // Unknown to discovery (e.g. a CRD applied moments ago): fall back
        // to the inferred resource, assuming namespace scope.
        None => Api::namespaced_with(client.clone(), namespace, &ApiResource::from_gvk(&gvk)),
    };

    let mut backoff = POLL_BASE;
    let mut last = "object not found".to_string();
    loop {
        match api.get_opt(&check.name).await {
            Ok(Some(found)) => match assess(&found) {
                Readiness::Current => {
                    debug!("Health check passed for {}", object);
                    return Ok(());
                }
                Readiness::Failed(reason) => {
                    return CheckFailedSnafu { object, reason }.fail();
                }
                Readiness::InProgress(reason) => {
                    trace!("Health check pending for {}: {}", object, reason);
                    last = reason;
                }
            },
            // Not found is in-progress: the object may still be created by
            // a slower controller.
            Ok(None) => last = "object not found".to_string(),
            Err(source) => return Err(Error::PollObject { object, source }),
        }

        if Instant::now() + backoff >= deadline {
            return CheckTimeoutSnafu { object, last }.fail();
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(POLL_CAP);
    }
}

/// Computes readiness from the object's status, with kind-specific
/// predicates for the builtin workload kinds and a generic kstatus
/// computation for everything else.
pub fn assess(obj: &DynamicObject) -> Readiness {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    let generation = obj.metadata.generation;
    match kind {
        "Deployment" => assess_deployment(generation, &obj.data),
        "StatefulSet" => assess_stateful_set(generation, &obj.data),
        "DaemonSet" => assess_daemon_set(generation, &obj.data),
        "Job" => assess_job(&obj.data),
        "Pod" => assess_pod(&obj.data),
        "PersistentVolumeClaim" => assess_pvc(&obj.data),
        _ => assess_generic(generation, &obj.data),
    }
}

fn assess_deployment(generation: Option<i64>, data: &Value) -> Readiness {
    let status = &data["status"];
    if stale_generation(generation, status) {
        return Readiness::InProgress("observed generation is stale".into());
    }
    if let Some(reason) = condition(status, "Progressing").filter(|c| {
        c["reason"].as_str() == Some("ProgressDeadlineExceeded") && c["status"] == "False"
    }) {
        return Readiness::Failed(
            reason["message"]
                .as_str()
                .unwrap_or("progress deadline exceeded")
                .to_string(),
        );
    }
    if condition_status(status, "Available") != Some("True") {
        return Readiness::InProgress("Available condition is not True".into());
    }
    let want = data["spec"]["replicas"].as_i64().unwrap_or(1);
    let updated = status["updatedReplicas"].as_i64().unwrap_or(0);
    if updated < want {
        return Readiness::InProgress(format!("{updated} of {want} replicas updated"));
    }
    Readiness::Current
}

fn assess_stateful_set(generation: Option<i64>, data: &Value) -> Readiness {
    let status = &data["status"];
    if stale_generation(generation, status) {
        return Readiness::InProgress("observed generation is stale".into());
    }
    let want = data["spec"]["replicas"].as_i64().unwrap_or(1);
    let ready = status["readyReplicas"].as_i64().unwrap_or(0);
    if ready < want {
        return Readiness::InProgress(format!("{ready} of {want} replicas ready"));
    }
    if status["currentRevision"] != status["updateRevision"] {
        return Readiness::InProgress("update revision not rolled out".into());
    }
    Readiness::Current
}

fn assess_daemon_set(generation: Option<i64>, data: &Value) -> Readiness {
    let status = &data["status"];
    if stale_generation(generation, status) {
        return Readiness::InProgress("observed generation is stale".into());
    }
    let want = status["desiredNumberScheduled"].as_i64().unwrap_or(0);
    let ready = status["numberReady"].as_i64().unwrap_or(0);
    if ready < want {
        return Readiness::InProgress(format!("{ready} of {want} pods ready"));
    }
    Readiness::Current
}

fn assess_job(data: &Value) -> Readiness {
    let status = &data["status"];
    if let Some(failed) = condition(status, "Failed").filter(|c| c["status"] == "True") {
        return Readiness::Failed(
            failed["message"].as_str().unwrap_or("job failed").to_string(),
        );
    }
    if condition_status(status, "Complete") == Some("True") {
        return Readiness::Current;
    }
    Readiness::InProgress("job has not completed".into())
}

fn assess_pod(data: &Value) -> Readiness {
    let status = &data["status"];
    match status["phase"].as_str() {
        Some("Succeeded") => Readiness::Current,
        Some("Failed") => Readiness::Failed(
            status["reason"].as_str().unwrap_or("pod failed").to_string(),
        ),
        Some("Running") if condition_status(status, "Ready") == Some("True") => {
            Readiness::Current
        }
        phase => Readiness::InProgress(format!(
            "pod phase is {}",
            phase.unwrap_or("unknown")
        )),
    }
}

fn assess_pvc(data: &Value) -> Readiness {
    match data["status"]["phase"].as_str() {
        Some("Bound") => Readiness::Current,
        Some("Lost") => Readiness::Failed("claim lost its volume".into()),
        phase => Readiness::InProgress(format!(
            "claim phase is {}",
            phase.unwrap_or("unknown")
        )),
    }
}

/// Generic kstatus computation over `status.observedGeneration` and
/// `status.conditions`. Objects without a status are Current once they
/// exist.
fn assess_generic(generation: Option<i64>, data: &Value) -> Readiness {
    let status = &data["status"];
    if status.is_null() {
        return Readiness::Current;
    }
    if stale_generation(generation, status) {
        return Readiness::InProgress("observed generation is stale".into());
    }
    for terminal in ["Stalled", "Failed"] {
        if let Some(c) = condition(status, terminal).filter(|c| c["status"] == "True") {
            return Readiness::Failed(
                c["message"].as_str().unwrap_or("terminal condition").to_string(),
            );
        }
    }
    for positive in ["Ready", "Available"] {
        match condition_status(status, positive) {
            Some("True") => return Readiness::Current,
            Some(_) => {
                return Readiness::InProgress(format!("{positive} condition is not True"))
            }
            None => {}
        }
    }
    Readiness::Current
}

fn stale_generation(generation: Option<i64>, status: &Value) -> bool {
    match (generation, status["observedGeneration"].as_i64()) {
        (Some(generation), Some(observed)) => observed < generation,
        _ => false,
    }
}

fn condition<'a>(status: &'a Value, type_: &str) -> Option<&'a Value> {
    status["conditions"]
        .as_array()?
        .iter()
        .find(|c| c["type"] == type_)
}

fn condition_status<'a>(status: &'a Value, type_: &str) -> Option<&'a str> {
    condition(status, type_)?["status"].as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(manifest: &str) -> DynamicObject {
        serde_yaml::from_str(manifest).unwrap()
    }

    #[test]
    fn deployment_ready() {
        let obj = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n  generation: 2\n\
             spec:\n  replicas: 3\n\
             status:\n  observedGeneration: 2\n  updatedReplicas: 3\n  conditions:\n  - type: Available\n    status: \"True\"\n",
        );
        assert_eq!(assess(&obj), Readiness::Current);
    }

    #[test]
    fn deployment_stale_generation_is_in_progress() {
        let obj = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n  generation: 3\n\
             spec:\n  replicas: 1\n\
             status:\n  observedGeneration: 2\n  updatedReplicas: 1\n  conditions:\n  - type: Available\n    status: \"True\"\n",
        );
        assert!(matches!(assess(&obj), Readiness::InProgress(_)));
    }

    #[test]
    fn deployment_rollout_pending() {
        let obj = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n  generation: 1\n\
             spec:\n  replicas: 3\n\
             status:\n  observedGeneration: 1\n  updatedReplicas: 1\n  conditions:\n  - type: Available\n    status: \"True\"\n",
        );
        assert_eq!(
            assess(&obj),
            Readiness::InProgress("1 of 3 replicas updated".into())
        );
    }

    #[test]
    fn deployment_progress_deadline_is_terminal() {
        let obj = object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n\
             status:\n  conditions:\n  - type: Progressing\n    status: \"False\"\n    reason: ProgressDeadlineExceeded\n    message: deadline exceeded\n",
        );
        assert_eq!(assess(&obj), Readiness::Failed("deadline exceeded".into()));
    }

    #[test]
    fn job_outcomes() {
        let complete = object(
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: migrate\n\
             status:\n  conditions:\n  - type: Complete\n    status: \"True\"\n",
        );
        assert_eq!(assess(&complete), Readiness::Current);

        let failed = object(
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: migrate\n\
             status:\n  conditions:\n  - type: Failed\n    status: \"True\"\n    message: backoff limit exceeded\n",
        );
        assert_eq!(
            assess(&failed),
            Readiness::Failed("backoff limit exceeded".into())
        );
    }

    #[test]
    fn pvc_bound() {
        let obj = object(
            "apiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: data\n\
             status:\n  phase: Bound\n",
        );
        assert_eq!(assess(&obj), Readiness::Current);
    }

    #[test]
    fn custom_resource_generic_kstatus() {
        let ready = object(
            "apiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n  generation: 1\n\
             status:\n  observedGeneration: 1\n  conditions:\n  - type: Ready\n    status: \"True\"\n",
        );
        assert_eq!(assess(&ready), Readiness::Current);

        let stale = object(
            "apiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n  generation: 2\n\
             status:\n  observedGeneration: 1\n  conditions:\n  - type: Ready\n    status: \"True\"\n",
        );
        assert!(matches!(assess(&stale), Readiness::InProgress(_)));

        let stalled = object(
            "apiVersion: example.io/v1\nkind: Widget\nmetadata:\n  name: w\n\
             status:\n  conditions:\n  - type: Stalled\n    status: \"True\"\n    message: wedged\n",
        );
        assert_eq!(assess(&stalled), Readiness::Failed("wedged".into()));
    }

    #[test]
    fn statusless_object_is_current() {
        let obj = object("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n");
        assert_eq!(assess(&obj), Readiness::Current);
    }

    #[test]
    fn statefulset_revision_gate() {
        let obj = object(
            "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\n  generation: 1\n\
             spec:\n  replicas: 2\n\
             status:\n  observedGeneration: 1\n  readyReplicas: 2\n  currentRevision: db-1\n  updateRevision: db-2\n",
        );
        assert_eq!(
            assess(&obj),
            Readiness::InProgress("update revision not rolled out".into())
        );
    }
}

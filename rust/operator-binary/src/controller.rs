use std::{sync::Arc, time::Duration};

use flux_kustomize_operator_crd::{
    reason, Kustomization, KustomizationStatus, DEPENDENCY_REQUEUE, FINALIZER,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Patch, PatchParams},
    runtime::{controller::Action, events::EventType},
    Api, Client, Discovery, Resource, ResourceExt,
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    cluster::ClusterResolver,
    engine::Engine,
    event, finalizer,
    inventory::{self, Owner},
    scheduler::{self, WatchIndex},
};

pub static CONTROLLER_NAME: &str = "kustomize-controller";

/// Fallback requeue when the spec is too broken to parse an interval from.
const INVALID_SPEC_REQUEUE: Duration = Duration::from_secs(60);

/// Deletion work is not bounded by `spec.timeout`.
const FINALIZER_TIMEOUT: Duration = Duration::from_secs(300);

const STATUS_UPDATE_ATTEMPTS: usize = 3;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed retrive namespace from resource: {}", name))]
    KustomizationMissingNamespace { name: String },

    #[snafu(display("Failed to add finalizer: {}", source))]
    AddFinalizer { source: kube::Error },

    #[snafu(display("Failed to delete finalizer: {}", source))]
    DeleteFinalizer { source: kube::Error },

    #[snafu(display("Failed to update status: {}", source))]
    UpdateStatus { source: kube::Error },

    #[snafu(display("Failed to serialize status: {}", source))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: event::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Context injected with each `reconcile` and `error_policy` invocation.
pub struct ContextData {
    /// Client bound to the host cluster, where the Kustomizations live.
    pub client: Client,

    pub engine: Engine,
    pub resolver: ClusterResolver,
    pub index: Arc<WatchIndex>,
}

pub async fn reconcile(
    kustomization: Arc<Kustomization>,
    context: Arc<ContextData>,
) -> Result<Action> {
    let client = context.client.clone();
    let name = kustomization.name_any();
    let namespace = kustomization
        .namespace()
        .context(KustomizationMissingNamespaceSnafu { name: &name })?;
    let key = scheduler::key_of(&kustomization);

    if kustomization.meta().deletion_timestamp.is_some() {
        return finalize(&kustomization, &context).await;
    }

    // The finalizer goes on before anything is applied, so nothing this
    // object creates can outlive it unpruned.
    finalizer::add(client.clone(), &kustomization)
        .await
        .context(AddFinalizerSnafu)?;

    if kustomization.spec.suspend {
        info!(
            kustomization = format!("{namespace}/{name}"),
            "Reconciliation is suspended"
        );
        update_status(
            &client,
            &kustomization,
            |status, ks| {
                set_ready(status, ks, false, reason::SUSPENDED, "Reconciliation is suspended");
            },
        )
        .await?;
        return Ok(Action::await_change());
    }

    if let Err(invalid) = kustomization.validate() {
        return fail(
            &context,
            &kustomization,
            reason::RECONCILIATION_FAILED,
            invalid.to_string(),
            None,
            INVALID_SPEC_REQUEUE,
        )
        .await;
    }
    let interval = kustomization.interval().unwrap_or(INVALID_SPEC_REQUEUE);
    let timeout = kustomization.timeout().unwrap_or(interval);

    // Keep the trigger indexes current before anything can fail, so watch
    // events keep fanning out even for broken objects.
    context.index.set_source(
        key.clone(),
        (
            kustomization.spec.source_ref.kind.clone(),
            kustomization
                .spec
                .source_ref
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.clone()),
            kustomization.spec.source_ref.name.clone(),
        ),
    );
    let dependencies: Vec<_> = kustomization
        .spec
        .depends_on
        .iter()
        .map(|d| d.resolve(&namespace))
        .collect();
    if let Some(cycle) = context
        .index
        .set_dependencies(key.clone(), dependencies.clone())
    {
        let path = cycle
            .iter()
            .map(|(ns, n)| format!("{ns}/{n}"))
            .collect::<Vec<_>>()
            .join(" -> ");
        warn!(
            kustomization = format!("{namespace}/{name}"),
            "Dependency cycle detected: {}", path
        );
        return fail(
            &context,
            &kustomization,
            reason::DEPENDENCY_NOT_READY,
            format!("dependency cycle detected: {path}"),
            None,
            DEPENDENCY_REQUEUE,
        )
        .await;
    }

    for dependency in &dependencies {
        if let Err(why) = scheduler::dependency_ready(&client, dependency).await {
            return fail(
                &context,
                &kustomization,
                reason::DEPENDENCY_NOT_READY,
                why,
                None,
                DEPENDENCY_REQUEUE,
            )
            .await;
        }
    }

    // First reconciliation of this object: let watchers see it in flight.
    let never_applied = kustomization
        .status
        .as_ref()
        .map(|s| s.last_applied_revision.is_none())
        .unwrap_or(true);
    if never_applied {
        update_status(&client, &kustomization, |status, ks| {
            set_ready(
                status,
                ks,
                false,
                reason::PROGRESSING,
                "Reconciliation in progress",
            );
        })
        .await?;
    }

    let artefact = match context.engine.resolve_source(&kustomization).await {
        Ok(artefact) => artefact,
        Err(source_error) => {
            return fail(
                &context,
                &kustomization,
                source_error.reason(),
                source_error.to_string(),
                None,
                interval,
            )
            .await;
        }
    };
    let revision = artefact.revision();

    let target = match context.resolver.resolve(&kustomization).await {
        Ok(target) => target,
        Err(cluster_error) => {
            return fail(
                &context,
                &kustomization,
                reason::RECONCILIATION_FAILED,
                cluster_error.to_string(),
                Some(revision),
                interval,
            )
            .await;
        }
    };

    let deadline = Instant::now() + timeout;
    let run = tokio::time::timeout(
        timeout,
        context.engine.run(&kustomization, &artefact, target, deadline),
    )
    .await;

    match run {
        Err(_elapsed) => {
            fail(
                &context,
                &kustomization,
                reason::RECONCILIATION_FAILED,
                format!(
                    "reconciliation timed out after {}",
                    humantime::format_duration(timeout)
                ),
                Some(revision),
                interval,
            )
            .await
        }
        Ok(Err(stage_error)) => {
            fail(
                &context,
                &kustomization,
                stage_error.reason(),
                stage_error.to_string(),
                Some(revision),
                interval,
            )
            .await
        }
        Ok(Ok(outcome)) => {
            let message = format!("Applied revision: {}", outcome.revision);
            update_status(&client, &kustomization, |status, ks| {
                set_ready(status, ks, true, reason::RECONCILIATION_SUCCEEDED, &message);
                status.last_attempted_revision = Some(outcome.revision.clone());
                status.last_applied_revision = Some(outcome.revision.clone());
                status.snapshot = outcome.snapshot.clone();
                status.last_handled_reconcile_at = ks.reconcile_request();
            })
            .await?;

            info!(
                kustomization = format!("{namespace}/{name}"),
                output = ?outcome.report.summary(),
                pruned = outcome.pruned.len(),
                "Reconciliation finished, next run in {}",
                humantime::format_duration(interval)
            );
            event::publish(
                kustomization.clone(),
                client.clone(),
                EventType::Normal,
                reason::RECONCILIATION_SUCCEEDED.into(),
                Some(message),
            )
            .await
            .context(PublishEventSnafu)?;

            Ok(Action::requeue(interval))
        }
    }
}

/// Failure bookkeeping shared by every stage: condition, attempted revision,
/// event, log, retry at the caller's pace. `lastAppliedRevision` and the
/// snapshot are left exactly as they were.
async fn fail(
    context: &ContextData,
    kustomization: &Arc<Kustomization>,
    why: &'static str,
    message: String,
    attempted_revision: Option<String>,
    requeue: Duration,
) -> Result<Action> {
    let name = kustomization.name_any();
    let namespace = kustomization.namespace().unwrap_or_default();
    warn!(
        kustomization = format!("{namespace}/{name}"),
        reason = why,
        "Reconciliation failed: {}",
        message
    );

    update_status(&context.client, kustomization, |status, ks| {
        set_ready(status, ks, false, why, &message);
        if let Some(revision) = &attempted_revision {
            status.last_attempted_revision = Some(revision.clone());
        }
        status.last_handled_reconcile_at = ks.reconcile_request();
    })
    .await?;

    let note = match &attempted_revision {
        Some(revision) => format!("{message} (revision {revision})"),
        None => message,
    };
    event::publish(
        kustomization.clone(),
        context.client.clone(),
        EventType::Warning,
        why.into(),
        Some(note),
    )
    .await
    .context(PublishEventSnafu)?;

    Ok(Action::requeue(requeue))
}

/// Deletion: prune the whole inventory on the target cluster, then let the
/// object go. Cleanup failures are logged, not allowed to wedge deletion.
async fn finalize(
    kustomization: &Arc<Kustomization>,
    context: &ContextData,
) -> Result<Action> {
    let name = kustomization.name_any();
    let namespace = kustomization.namespace().unwrap_or_default();

    if kustomization.finalizers().iter().any(|f| f == FINALIZER) {
        let snapshot = kustomization
            .status
            .as_ref()
            .and_then(|s| s.snapshot.clone());
        if let Some(snapshot) = snapshot {
            if let Err(cleanup_error) =
                tokio::time::timeout(FINALIZER_TIMEOUT, prune_all(kustomization, context, snapshot))
                    .await
                    .unwrap_or_else(|_| Err("cleanup timed out".to_string()))
            {
                error!(
                    kustomization = format!("{namespace}/{name}"),
                    "Failed to clean up inventory: {}", cleanup_error
                );
            }
        }

        context.index.forget(&scheduler::key_of(kustomization));
        finalizer::remove(context.client.clone(), kustomization)
            .await
            .context(DeleteFinalizerSnafu)?;
        info!(
            kustomization = format!("{namespace}/{name}"),
            "Removed finalizer, all inventoried resources deleted"
        );
    }

    Ok(Action::await_change())
}

/// The finalizer path is pruning against the empty set.
async fn prune_all(
    kustomization: &Kustomization,
    context: &ContextData,
    snapshot: flux_kustomize_operator_crd::Snapshot,
) -> std::result::Result<(), String> {
    let target = context
        .resolver
        .resolve(kustomization)
        .await
        .map_err(|e| e.to_string())?;
    let discovery = Discovery::new(target.clone())
        .run()
        .await
        .map_err(|e| e.to_string())?;
    let owner = Owner {
        name: kustomization.name_any(),
        namespace: kustomization.namespace().unwrap_or_default(),
    };
    inventory::prune(&target, &discovery, &owner, &snapshot, &Default::default())
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Sets the Ready condition, preserving the transition time when nothing
/// about it changed, and records the observed generation.
fn set_ready(
    status: &mut KustomizationStatus,
    kustomization: &Kustomization,
    ready: bool,
    why: &str,
    message: &str,
) {
    let generation = kustomization.metadata.generation;
    let condition_status = if ready { "True" } else { "False" };

    let last_transition_time = status
        .ready_condition()
        .filter(|c| c.status == condition_status && c.reason == why)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| Time(k8s_openapi::chrono::Utc::now()));

    status.conditions.retain(|c| c.type_ != "Ready");
    status.conditions.push(Condition {
        type_: "Ready".into(),
        status: condition_status.into(),
        reason: why.into(),
        message: message.into(),
        last_transition_time,
        observed_generation: generation,
    });
    status.observed_generation = generation;
}

/// Applies `mutate` on top of the current status and merge-patches the
/// result, retrying a bounded number of times on write conflicts.
async fn update_status<F>(
    client: &Client,
    kustomization: &Kustomization,
    mutate: F,
) -> Result<()>
where
    F: Fn(&mut KustomizationStatus, &Kustomization),
{
    let name = kustomization.name_any();
    let namespace = kustomization.namespace().unwrap_or_default();
    let api = Api::<Kustomization>::namespaced(client.clone(), &namespace);

    let mut attempt = 0;
    let mut current = kustomization.clone();
    loop {
        attempt += 1;

        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status, &current);

        let mut value = serde_json::to_value(&status).context(SerializeStatusSnafu)?;
        // A merge patch cannot drop a field by omission; a cleared snapshot
        // (prune turned off) must be sent as an explicit null.
        if status.snapshot.is_none() {
            value["snapshot"] = serde_json::Value::Null;
        }

        let patch = serde_json::json!({ "status": value });
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(response))
                if response.code == 409 && attempt < STATUS_UPDATE_ATTEMPTS =>
            {
                current = api
                    .get(&name)
                    .await
                    .context(UpdateStatusSnafu)?;
            }
            Err(source) => return Err(Error::UpdateStatus { source }),
        }
    }
}

/// Requeue policy when `reconcile` itself errored (status writes, event
/// publishing). Stage failures are handled inside `reconcile`.
pub fn error_policy(
    kustomization: Arc<Kustomization>,
    error: &Error,
    context: Arc<ContextData>,
) -> Action {
    error!(
        kustomization = format!(
            "{}/{}",
            kustomization.namespace().unwrap_or_default(),
            kustomization.name_any()
        ),
        "Reconciliation error: {}", error
    );
    let interval = kustomization.interval().unwrap_or(INVALID_SPEC_REQUEUE);
    let client = context.client.clone();
    tokio::spawn(event::publish(
        kustomization,
        client,
        EventType::Warning,
        reason::RECONCILIATION_FAILED.into(),
        Some(error.to_string()),
    ));
    Action::requeue(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_kustomize_operator_crd::Snapshot;

    fn kustomization() -> Kustomization {
        serde_yaml::from_str(
            "apiVersion: kustomize.toolkit.fluxcd.io/v1beta1\n\
             kind: Kustomization\n\
             metadata:\n  name: backend\n  namespace: dev\n  generation: 4\n\
             spec:\n  sourceRef:\n    kind: GitRepository\n    name: webapp\n  interval: 5m\n",
        )
        .unwrap()
    }

    #[test]
    fn set_ready_replaces_the_condition_and_tracks_generation() {
        let ks = kustomization();
        let mut status = KustomizationStatus::default();

        set_ready(&mut status, &ks, false, reason::PROGRESSING, "in progress");
        set_ready(
            &mut status,
            &ks,
            true,
            reason::RECONCILIATION_SUCCEEDED,
            "Applied revision: main/abc",
        );

        assert_eq!(status.conditions.len(), 1);
        let ready = status.ready_condition().unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, reason::RECONCILIATION_SUCCEEDED);
        assert_eq!(status.observed_generation, Some(4));
    }

    #[test]
    fn unchanged_condition_keeps_its_transition_time() {
        let ks = kustomization();
        let mut status = KustomizationStatus::default();

        set_ready(&mut status, &ks, false, reason::ARTIFACT_FAILED, "first");
        let original = status.ready_condition().unwrap().last_transition_time.clone();

        set_ready(&mut status, &ks, false, reason::ARTIFACT_FAILED, "second");
        assert_eq!(
            status.ready_condition().unwrap().last_transition_time,
            original
        );

        set_ready(&mut status, &ks, true, reason::RECONCILIATION_SUCCEEDED, "ok");
        // A status flip is a real transition.
        assert_eq!(status.ready_condition().unwrap().message, "ok");
    }

    #[test]
    fn failure_bookkeeping_preserves_last_applied() {
        let ks = kustomization();
        let mut status = KustomizationStatus {
            last_applied_revision: Some("main/abc".into()),
            last_attempted_revision: Some("main/abc".into()),
            snapshot: Some(Snapshot {
                checksum: "c".into(),
                entries: vec![],
            }),
            ..Default::default()
        };

        // What `fail` applies when a later revision breaks.
        set_ready(&mut status, &ks, false, reason::BUILD_FAILED, "boom");
        status.last_attempted_revision = Some("main/def".into());

        assert_eq!(status.last_applied_revision.as_deref(), Some("main/abc"));
        assert_eq!(status.last_attempted_revision.as_deref(), Some("main/def"));
        assert!(status.snapshot.is_some());
    }
}

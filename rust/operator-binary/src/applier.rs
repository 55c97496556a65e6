use std::{collections::BTreeMap, fmt, time::Duration};

use flux_kustomize_operator_crd::ResourceRef;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{DynamicObject, GroupVersionKind, Patch, PatchParams},
    discovery::ApiResource,
    runtime::wait::{await_condition, conditions},
    Api, Client, Discovery, ResourceExt,
};
use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, warn};

use crate::utils::{dynamic_api, resource_ref};

/// Bounded wait for a freshly applied CRD to become established before any
/// custom resource of that kind is submitted.
const CRD_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Validation of {} was rejected: {}", object, message))]
    ObjectRejected { object: String, message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ApplyAction {
    Created,
    Configured,
    Unchanged,
    Failed,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplyAction::Created => "created",
            ApplyAction::Configured => "configured",
            ApplyAction::Unchanged => "unchanged",
            ApplyAction::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ApplyEntry {
    pub id: ResourceRef,
    pub action: ApplyAction,
    pub message: Option<String>,
}

/// Per-object outcome of one apply pass. A single failed object does not
/// abort the batch; the batch fails iff any entry failed.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub entries: Vec<ApplyEntry>,
}

impl ApplyReport {
    pub fn first_failure(&self) -> Option<&ApplyEntry> {
        self.entries
            .iter()
            .find(|e| e.action == ApplyAction::Failed)
    }

    pub fn changed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, ApplyAction::Created | ApplyAction::Configured))
            .count()
    }

    /// `<kind>.<group>/<name>` -> action, the shape success logs carry.
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| {
                let group = if e.id.group.is_empty() {
                    "core"
                } else {
                    e.id.group.as_str()
                };
                (
                    format!("{}.{}/{}", e.id.kind, group, e.id.name),
                    e.action.to_string(),
                )
            })
            .collect()
    }
}

/// Applies object streams through server-side apply with a stable field
/// manager, leaving diffing to the API server.
pub struct Applier {
    client: Client,
    field_manager: String,
}

impl Applier {
    pub fn new(client: Client, field_manager: String) -> Self {
        Self {
            client,
            field_manager,
        }
    }

    /// Applies the stream in order. CRDs were sorted to the front by the
    /// build; each one is awaited until established so custom resources of
    /// that kind do not bounce off an unknown API.
    pub async fn apply(
        &self,
        discovery: &Discovery,
        objects: &[DynamicObject],
        default_namespace: &str,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        for obj in objects {
            let id = match resource_ref(obj, default_namespace) {
                Ok(id) => id,
                Err(error) => {
                    report.entries.push(ApplyEntry {
                        id: unidentified(obj, default_namespace),
                        action: ApplyAction::Failed,
                        message: Some(error.to_string()),
                    });
                    continue;
                }
            };

            let entry = match self.apply_object(discovery, obj, &id, false).await {
                Ok(action) => ApplyEntry {
                    id,
                    action,
                    message: None,
                },
                Err(message) => {
                    warn!("Failed to apply {}: {}", id, message);
                    ApplyEntry {
                        id,
                        action: ApplyAction::Failed,
                        message: Some(message),
                    }
                }
            };

            if entry.action != ApplyAction::Failed && is_crd(obj) {
                if let Err(message) = self.wait_crd_established(&entry.id.name).await {
                    warn!("{}", message);
                    report.entries.push(ApplyEntry {
                        message: Some(message),
                        action: ApplyAction::Failed,
                        ..entry
                    });
                    continue;
                }
            }

            report.entries.push(entry);
        }
        report
    }

    /// Submits every object with `dryRun: All`; the first rejection aborts.
    pub async fn validate(
        &self,
        discovery: &Discovery,
        objects: &[DynamicObject],
        default_namespace: &str,
    ) -> Result<()> {
        for obj in objects {
            let id = resource_ref(obj, default_namespace)
                .map_err(|e| Error::ObjectRejected {
                    object: obj.name_any(),
                    message: e.to_string(),
                })?;
            self.apply_object(discovery, obj, &id, true)
                .await
                .map_err(|message| Error::ObjectRejected {
                    object: id.to_string(),
                    message,
                })?;
        }
        Ok(())
    }

    async fn apply_object(
        &self,
        discovery: &Discovery,
        obj: &DynamicObject,
        id: &ResourceRef,
        dry_run: bool,
    ) -> std::result::Result<ApplyAction, String> {
        let gvk = GroupVersionKind {
            group: id.group.clone(),
            version: id.version.clone(),
            kind: id.kind.clone(),
        };
        let api = match discovery.resolve_gvk(&gvk) {
            Some((ar, caps)) => dynamic_api(
                ar,
                caps,
                self.client.clone(),
                id.namespace.as_deref(),
                false,
            ),
            // Discovery predates this reconciliation's CRDs; fall back to
            // the inferred resource.
            None => Api::namespaced_with(
                self.client.clone(),
                id.namespace.as_deref().unwrap_or_default(),
                &ApiResource::from_gvk(&gvk),
            ),
        };

        let name = obj.name_any();
        let prior = api
            .get_opt(&name)
            .await
            .map_err(|e| format!("failed to read current state: {e}"))?;

        let mut pp = PatchParams::apply(&self.field_manager).force();
        pp.dry_run = dry_run;

        let applied = api
            .patch(&name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| match e {
                kube::Error::Api(response) => response.message,
                other => other.to_string(),
            })?;

        let action = match &prior {
            None => ApplyAction::Created,
            Some(prior) if prior.resource_version() != applied.resource_version() => {
                ApplyAction::Configured
            }
            Some(_) => ApplyAction::Unchanged,
        };
        debug!("Applied {}: {}", id, action);
        Ok(action)
    }

    async fn wait_crd_established(&self, name: &str) -> std::result::Result<(), String> {
        let api = Api::<CustomResourceDefinition>::all(self.client.clone());
        tokio::time::timeout(
            CRD_ESTABLISHED_TIMEOUT,
            await_condition(api, name, conditions::is_crd_established()),
        )
        .await
        .map_err(|_| format!("CRD {name} was not established in time"))?
        .map_err(|e| format!("failed to await CRD {name}: {e}"))?;
        Ok(())
    }
}

fn is_crd(obj: &DynamicObject) -> bool {
    obj.types
        .as_ref()
        .map(|t| t.kind == "CustomResourceDefinition")
        .unwrap_or(false)
}

fn unidentified(obj: &DynamicObject, default_namespace: &str) -> ResourceRef {
    ResourceRef {
        group: String::new(),
        version: String::new(),
        kind: obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default(),
        namespace: Some(default_namespace.to_string()),
        name: obj.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, group: &str, name: &str, action: ApplyAction) -> ApplyEntry {
        ApplyEntry {
            id: ResourceRef {
                group: group.into(),
                version: "v1".into(),
                kind: kind.into(),
                namespace: Some("dev".into()),
                name: name.into(),
            },
            action,
            message: None,
        }
    }

    #[test]
    fn report_summary_uses_kind_group_name() {
        let report = ApplyReport {
            entries: vec![
                entry("Deployment", "apps", "backend", ApplyAction::Created),
                entry("Service", "", "backend", ApplyAction::Unchanged),
            ],
        };
        let summary = report.summary();
        assert_eq!(summary["Deployment.apps/backend"], "created");
        assert_eq!(summary["Service.core/backend"], "unchanged");
        assert_eq!(report.changed(), 1);
    }

    #[test]
    fn batch_fails_iff_any_entry_failed() {
        let healthy = ApplyReport {
            entries: vec![entry("Service", "", "a", ApplyAction::Configured)],
        };
        assert!(healthy.first_failure().is_none());

        let broken = ApplyReport {
            entries: vec![
                entry("Service", "", "a", ApplyAction::Unchanged),
                entry("Deployment", "apps", "b", ApplyAction::Failed),
                entry("Deployment", "apps", "c", ApplyAction::Failed),
            ],
        };
        assert_eq!(broken.first_failure().unwrap().id.name, "b");
    }
}

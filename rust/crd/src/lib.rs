use std::{collections::BTreeSet, time::Duration};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

pub const APP_NAME: &str = "kustomization";

/// API group of the `Kustomization` custom resource and of the identity
/// labels stamped on every applied object when pruning is enabled.
pub const API_GROUP: &str = "kustomize.toolkit.fluxcd.io";

pub const NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
pub const NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";
pub const CHECKSUM_LABEL: &str = "kustomize.toolkit.fluxcd.io/checksum";

/// Annotation that forces a reconciliation whenever its value differs from
/// `status.lastHandledReconcileAt`.
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

pub const FINALIZER: &str = "kustomize.toolkit.fluxcd.io/finalizer";

/// Smallest admissible apply interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Requeue used while a dependency is not yet ready, regardless of
/// `spec.interval`.
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace associated"))]
    NoNamespace,

    #[snafu(display("failed to parse {} {:?}: {}", field, value, source))]
    InvalidDuration {
        field: &'static str,
        value: String,
        source: humantime::DurationError,
    },

    #[snafu(display("interval {:?} is below the minimum of 60s", value))]
    IntervalTooShort { value: String },

    #[snafu(display("path {:?} must be relative and start with \"./\"", value))]
    InvalidPath { value: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Condition reasons written to the `Ready` condition. The vocabulary is
/// closed; the reconciler maps each failed stage onto exactly one of these.
pub mod reason {
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
    pub const PROGRESSING: &str = "Progressing";
    pub const SUSPENDED: &str = "Suspended";
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    pub const PRUNE_FAILED: &str = "PruneFailed";
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
    pub const BUILD_FAILED: &str = "BuildFailed";
    pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1beta1",
    kind = "Kustomization",
    shortname = "ks",
    status = "KustomizationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Reference to the source object holding the manifest artifact.
    pub source_ref: SourceReference,

    /// Path within the source artifact to the directory to build.
    /// Must be relative and rooted at "./".
    #[serde(default = "default_path")]
    #[schemars(regex(pattern = r"^\./"))]
    pub path: String,

    /// Interval at which the declared state is re-applied, e.g. "5m".
    /// Must be at least one minute.
    pub interval: String,

    /// Wall-clock budget for a single reconciliation. Defaults to the
    /// interval when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// When true all triggers are ignored until the flag is cleared.
    #[serde(default)]
    pub suspend: bool,

    /// Garbage-collect objects that were applied previously but are no
    /// longer part of the build.
    #[serde(default)]
    pub prune: bool,

    /// Kustomizations that must be Ready before this one reconciles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<CrossNamespaceReference>,

    /// Objects to wait on after apply before the reconciliation is
    /// considered successful.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<Decryption>,

    /// Service account to impersonate while applying to the target cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Kubeconfig for applying to a remote cluster. When set it wins for API
    /// targeting; impersonation still applies within that target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfig>,

    /// Namespace to set on all namespaced objects of the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default)]
    pub validation: ValidationMode,
}

fn default_path() -> String {
    "./".to_string()
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// Kind of the source referent, one of ('GitRepository', 'OCIRepository').
    pub kind: String,

    pub name: String,

    /// Namespace of the source, defaults to the namespace of the
    /// Kustomization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl CrossNamespaceReference {
    /// Resolves the reference against the namespace of the referring object.
    pub fn resolve(&self, default_namespace: &str) -> (String, String) {
        (
            self.namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            self.name.clone(),
        )
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl std::fmt::Display for HealthCheckReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decryption {
    /// Only 'sops' is supported.
    pub provider: DecryptionProvider,

    /// Secret holding the private keys, in the same namespace as the
    /// Kustomization.
    pub secret_ref: LocalObjectReference,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum DecryptionProvider {
    #[serde(rename = "sops")]
    Sops,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    /// Secret whose `value` key holds a self-contained kubeconfig.
    pub secret_ref: LocalObjectReference,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    None,
    #[default]
    Client,
    Server,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Revision of the last build that was applied successfully. Never
    /// rolled back on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// Revision of the last attempted build, successful or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// Value of the reconcile request annotation last acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,

    /// Inventory of the last successful apply, sole source of truth for
    /// pruning. Survives controller restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl KustomizationStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == "Ready")
    }
}

/// True when a status carries `Ready=True` and has observed the given spec
/// generation. This is the eligibility predicate dependents are gated on.
pub fn is_ready_with_generation(
    status: Option<&KustomizationStatus>,
    generation: Option<i64>,
) -> bool {
    status
        .map(|s| {
            s.observed_generation == generation
                && s.ready_condition()
                    .map(|c| c.status == "True")
                    .unwrap_or(false)
        })
        .unwrap_or(false)
}

/// The set of object identities applied by the last successful
/// reconciliation, plus the checksum of the built stream they came from.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub checksum: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<ResourceRef>,
}

impl Snapshot {
    /// Entries present here but absent from `next`.
    pub fn orphans(&self, next: &Snapshot) -> Vec<ResourceRef> {
        let keep: BTreeSet<&ResourceRef> = next.entries.iter().collect();
        self.entries
            .iter()
            .filter(|e| !keep.contains(e))
            .cloned()
            .collect()
    }
}

/// A fully qualified object identity, the unit of inventory tracking.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = if self.group.is_empty() {
            "core".to_string()
        } else {
            self.group.clone()
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}/{}/{}", self.kind, group, ns, self.name),
            None => write!(f, "{}.{}/{}", self.kind, group, self.name),
        }
    }
}

impl Kustomization {
    /// Validates the invariants the schema cannot express. Violations are
    /// terminal for the attempt; retries happen at the regular interval.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.spec.path.starts_with("./"),
            InvalidPathSnafu {
                value: self.spec.path.clone(),
            }
        );
        let interval = self.interval()?;
        ensure!(
            interval >= MIN_INTERVAL,
            IntervalTooShortSnafu {
                value: self.spec.interval.clone(),
            }
        );
        self.timeout()?;
        Ok(())
    }

    pub fn interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.spec.interval).context(InvalidDurationSnafu {
            field: "spec.interval",
            value: self.spec.interval.clone(),
        })
    }

    /// Total wall-clock budget for one reconciliation.
    pub fn timeout(&self) -> Result<Duration> {
        match &self.spec.timeout {
            Some(timeout) => humantime::parse_duration(timeout).context(InvalidDurationSnafu {
                field: "spec.timeout",
                value: timeout.clone(),
            }),
            None => self.interval(),
        }
    }

    /// Namespace the source reference resolves to.
    pub fn source_namespace(&self) -> Result<String> {
        self.spec
            .source_ref
            .namespace
            .clone()
            .or_else(|| self.metadata.namespace.clone())
            .ok_or(Error::NoNamespace)
    }

    /// Value of the on-demand trigger annotation, if any.
    pub fn reconcile_request(&self) -> Option<String> {
        self.annotations()
            .get(RECONCILE_REQUEST_ANNOTATION)
            .cloned()
    }

    /// True when the trigger annotation carries a value the controller has
    /// not acted upon yet.
    pub fn reconcile_requested(&self) -> bool {
        match self.reconcile_request() {
            Some(requested) => {
                self.status
                    .as_ref()
                    .and_then(|s| s.last_handled_reconcile_at.as_deref())
                    != Some(requested.as_str())
            }
            None => false,
        }
    }

    /// Field manager identity used for server-side apply, stable per object
    /// so repeated applies reconcile fields instead of conflicting.
    pub fn field_manager(&self) -> String {
        format!(
            "kustomize-controller/{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.name_any()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kustomization(spec: &str) -> Kustomization {
        let manifest = format!(
            "apiVersion: kustomize.toolkit.fluxcd.io/v1beta1\n\
             kind: Kustomization\n\
             metadata:\n  name: backend\n  namespace: dev\n\
             spec:\n{spec}"
        );
        serde_yaml::from_str(&manifest).expect("valid manifest")
    }

    const MINIMAL: &str = "  sourceRef:\n    kind: GitRepository\n    name: webapp\n  interval: 5m\n";

    #[test]
    fn minimal_spec_defaults() {
        let ks = kustomization(MINIMAL);
        assert_eq!(ks.spec.path, "./");
        assert!(!ks.spec.prune);
        assert!(!ks.spec.suspend);
        assert_eq!(ks.spec.validation, ValidationMode::Client);
        ks.validate().unwrap();
    }

    #[test]
    fn timeout_defaults_to_interval() {
        let ks = kustomization(MINIMAL);
        assert_eq!(ks.timeout().unwrap(), Duration::from_secs(300));

        let ks = kustomization(&format!("{MINIMAL}  timeout: 2m\n"));
        assert_eq!(ks.timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(ks.interval().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn interval_below_minimum_is_rejected() {
        let ks = kustomization(
            "  sourceRef:\n    kind: GitRepository\n    name: webapp\n  interval: 30s\n",
        );
        assert!(matches!(
            ks.validate(),
            Err(Error::IntervalTooShort { .. })
        ));
    }

    #[test]
    fn path_must_be_rooted() {
        let ks = kustomization(&format!("{MINIMAL}  path: /etc/overlays\n"));
        assert!(matches!(ks.validate(), Err(Error::InvalidPath { .. })));

        let ks = kustomization(&format!("{MINIMAL}  path: ./webapp/backend\n"));
        ks.validate().unwrap();
    }

    #[test]
    fn reconcile_request_compares_against_handled() {
        let mut ks = kustomization(MINIMAL);
        assert!(!ks.reconcile_requested());

        ks.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RECONCILE_REQUEST_ANNOTATION.into(), "T1".into());
        assert!(ks.reconcile_requested());

        ks.status = Some(KustomizationStatus {
            last_handled_reconcile_at: Some("T1".into()),
            ..Default::default()
        });
        assert!(!ks.reconcile_requested());
    }

    #[test]
    fn dependency_reference_namespace_defaulting() {
        let reference = CrossNamespaceReference {
            name: "common".into(),
            namespace: None,
        };
        assert_eq!(
            reference.resolve("dev"),
            ("dev".to_string(), "common".to_string())
        );

        let reference = CrossNamespaceReference {
            name: "common".into(),
            namespace: Some("infra".into()),
        };
        assert_eq!(
            reference.resolve("dev"),
            ("infra".to_string(), "common".to_string())
        );
    }

    #[test]
    fn readiness_gate_requires_observed_generation() {
        let mut ks = kustomization(MINIMAL);
        ks.metadata.generation = Some(2);
        assert!(!is_ready_with_generation(None, Some(2)));

        let status = KustomizationStatus {
            observed_generation: Some(1),
            conditions: vec![Condition {
                type_: "Ready".into(),
                status: "True".into(),
                reason: reason::RECONCILIATION_SUCCEEDED.into(),
                message: String::new(),
                last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    k8s_openapi::chrono::Utc::now(),
                ),
                observed_generation: None,
            }],
            ..Default::default()
        };
        // Ready but stale generation: not eligible.
        assert!(!is_ready_with_generation(Some(&status), ks.metadata.generation));

        let status = KustomizationStatus {
            observed_generation: Some(2),
            ..status
        };
        assert!(is_ready_with_generation(Some(&status), ks.metadata.generation));
    }

    #[test]
    fn snapshot_orphan_diff() {
        let deployment = ResourceRef {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            namespace: Some("dev".into()),
            name: "backend".into(),
        };
        let service = ResourceRef {
            group: "".into(),
            version: "v1".into(),
            kind: "Service".into(),
            namespace: Some("dev".into()),
            name: "backend".into(),
        };

        let old = Snapshot {
            checksum: "a".into(),
            entries: vec![deployment.clone(), service.clone()],
        };
        let new = Snapshot {
            checksum: "b".into(),
            entries: vec![deployment],
        };

        assert_eq!(old.orphans(&new), vec![service]);
        // Pruning against the empty set equals the finalizer path.
        let all = old.orphans(&Snapshot::default());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn resource_ref_display() {
        let r = ResourceRef {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            namespace: Some("dev".into()),
            name: "backend".into(),
        };
        assert_eq!(r.to_string(), "Deployment.apps/dev/backend");
    }

    #[test]
    fn field_manager_is_stable_per_object() {
        let ks = kustomization(MINIMAL);
        assert_eq!(ks.field_manager(), "kustomize-controller/dev/backend");
    }
}

use std::sync::Arc;

use flux_kustomize_operator_crd::{
    reason, Kustomization, ResourceRef, Snapshot, ValidationMode,
};
use fluxcd_rs::{is_ready, ArtifactFetcher, FluxSourceArtefact, GitRepository, OCIRepository};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DynamicObject, GroupVersionKind},
    Api, Client, Discovery, ResourceExt,
};
use kustomize_render::{decrypt_tree, BuildOptions, Builder, Decrypter, Identity};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    applier::{self, Applier},
    health,
    inventory::{self, Owner},
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("Unsupported source kind {:?}", kind))]
    SourceKindUnsupported { kind: String },

    #[snafu(display("Failed to look up source {}: {}", name, source))]
    SourceNotFound { name: String, source: kube::Error },

    #[snafu(display("Source {} is not ready", name))]
    SourceNotReady { name: String },

    #[snafu(display("Source {} has not produced an artifact", name))]
    SourceMissingArtifact { name: String },

    #[snafu(display("Failed to download artifact: {}", source))]
    DownloadArtifact {
        source: fluxcd_rs::downloader::error::FetcherError,
    },

    #[snafu(display("Failed to read decryption secret {}: {}", name, source))]
    ReadDecryptionSecret { name: String, source: kube::Error },

    #[snafu(display("Decryption secret {} holds no keys", name))]
    DecryptionSecretEmpty { name: String },

    #[snafu(display("Failed to decrypt sources: {}", source))]
    Decrypt { source: kustomize_render::sops::Error },

    #[snafu(display("Failed to build kustomization: {}", source))]
    Build {
        source: kustomize_render::builder::Error,
    },

    #[snafu(display("Failed to discover target cluster APIs: {}", source))]
    DiscoverApi { source: kube::Error },

    #[snafu(display("Validation failed for {}: {}", object, message))]
    Validation { object: String, message: String },

    #[snafu(display("Failed to apply {}: {}", object, message))]
    ApplyFailed { object: String, message: String },

    #[snafu(display("Failed to prune: {}", source))]
    Prune { source: inventory::Error },

    #[snafu(display("{}", source))]
    HealthCheck { source: health::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Maps a failed stage onto its Ready-condition reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::SourceKindUnsupported { .. }
            | Error::SourceNotFound { .. }
            | Error::SourceNotReady { .. }
            | Error::SourceMissingArtifact { .. }
            | Error::DownloadArtifact { .. } => reason::ARTIFACT_FAILED,
            Error::ReadDecryptionSecret { .. }
            | Error::DecryptionSecretEmpty { .. }
            | Error::Decrypt { .. }
            | Error::Build { .. } => reason::BUILD_FAILED,
            Error::Validation { .. } => reason::VALIDATION_FAILED,
            Error::Prune { .. } => reason::PRUNE_FAILED,
            Error::HealthCheck { .. } => reason::HEALTH_CHECK_FAILED,
            Error::ObjectHasNoNamespace
            | Error::DiscoverApi { .. }
            | Error::ApplyFailed { .. } => reason::RECONCILIATION_FAILED,
        }
    }
}

/// Everything a successful reconciliation produced, ready to be persisted
/// into the status in one update.
pub struct Outcome {
    pub revision: String,
    pub snapshot: Option<Snapshot>,
    pub report: applier::ApplyReport,
    pub pruned: Vec<ResourceRef>,
}

/// Runs the stages of one reconciliation in order:
/// fetch, decrypt, build, validate, apply, prune, health check.
pub struct Engine {
    client: Client,
    fetcher: ArtifactFetcher,
    decrypter: Arc<dyn Decrypter>,
}

impl Engine {
    pub fn new(client: Client, fetcher: ArtifactFetcher, decrypter: Arc<dyn Decrypter>) -> Self {
        Self {
            client,
            fetcher,
            decrypter,
        }
    }

    /// Resolves the referenced source object on the host cluster and returns
    /// its artifact. The revision is known from here on, so even a failed
    /// attempt can record what it tried to apply.
    pub async fn resolve_source(&self, kustomization: &Kustomization) -> Result<FluxSourceArtefact> {
        let source = &kustomization.spec.source_ref;
        let namespace = source
            .namespace
            .clone()
            .or_else(|| kustomization.namespace())
            .context(ObjectHasNoNamespaceSnafu)?;
        let name = &source.name;

        match source.kind.as_str() {
            "GitRepository" => {
                let repo = Api::<GitRepository>::namespaced(self.client.clone(), &namespace)
                    .get(name)
                    .await
                    .context(SourceNotFoundSnafu { name })?;
                let status = repo.status.context(SourceNotReadySnafu { name })?;
                snafu::ensure!(
                    is_ready(status.conditions.as_ref()),
                    SourceNotReadySnafu { name }
                );
                Ok(FluxSourceArtefact::Git(
                    status.artifact.context(SourceMissingArtifactSnafu { name })?,
                ))
            }
            "OCIRepository" => {
                let repo = Api::<OCIRepository>::namespaced(self.client.clone(), &namespace)
                    .get(name)
                    .await
                    .context(SourceNotFoundSnafu { name })?;
                let status = repo.status.context(SourceNotReadySnafu { name })?;
                snafu::ensure!(
                    is_ready(status.conditions.as_ref()),
                    SourceNotReadySnafu { name }
                );
                Ok(FluxSourceArtefact::Oci(
                    status.artifact.context(SourceMissingArtifactSnafu { name })?,
                ))
            }
            kind => SourceKindUnsupportedSnafu { kind }.fail(),
        }
    }

    /// Runs everything after source resolution against the target cluster.
    /// The scratch directory lives exactly as long as this call.
    pub async fn run(
        &self,
        kustomization: &Kustomization,
        artefact: &FluxSourceArtefact,
        target: Client,
        deadline: Instant,
    ) -> Result<Outcome> {
        let name = kustomization.name_any();
        let namespace = kustomization.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let revision = artefact.revision();

        let root = self
            .fetcher
            .fetch(artefact)
            .await
            .context(DownloadArtifactSnafu)?;

        if let Some(decryption) = &kustomization.spec.decryption {
            let keys = self
                .decryption_keys(&namespace, &decryption.secret_ref.name)
                .await?;
            decrypt_tree(self.decrypter.as_ref(), root.path(), &keys)
                .await
                .context(DecryptSnafu)?;
        }

        let options = BuildOptions {
            identity: kustomization.spec.prune.then(|| Identity {
                name: name.clone(),
                namespace: namespace.clone(),
            }),
            target_namespace: kustomization.spec.target_namespace.clone(),
        };
        let stream = Builder::new(root.join(&kustomization.spec.path))
            .context(BuildSnafu)?
            .build(&options)
            .context(BuildSnafu)?;
        debug!(
            kustomization = format!("{namespace}/{name}"),
            "Built {} objects at revision {} (checksum {})",
            stream.objects.len(),
            revision,
            stream.checksum
        );

        let default_namespace = kustomization
            .spec
            .target_namespace
            .clone()
            .unwrap_or_else(|| namespace.clone());

        let discovery = Discovery::new(target.clone())
            .run()
            .await
            .context(DiscoverApiSnafu)?;
        let applier = Applier::new(target.clone(), kustomization.field_manager());

        match kustomization.spec.validation {
            ValidationMode::None => {}
            ValidationMode::Client => validate_client(&stream.objects)?,
            ValidationMode::Server => {
                applier
                    .validate(&discovery, &stream.objects, &default_namespace)
                    .await
                    .map_err(|error| match error {
                        applier::Error::ObjectRejected { object, message } => {
                            Error::Validation { object, message }
                        }
                    })?;
            }
        }

        let report = applier
            .apply(&discovery, &stream.objects, &default_namespace)
            .await;
        if let Some(failure) = report.first_failure() {
            return ApplyFailedSnafu {
                object: failure.id.to_string(),
                message: failure.message.clone().unwrap_or_default(),
            }
            .fail();
        }

        let (snapshot, pruned) = if kustomization.spec.prune {
            let next = inventory::snapshot_from_stream(
                &stream.checksum,
                &stream.objects,
                &default_namespace,
            );
            let previous = kustomization
                .status
                .as_ref()
                .and_then(|s| s.snapshot.clone())
                .unwrap_or_default();
            let owner = Owner {
                name: name.clone(),
                namespace: namespace.clone(),
            };
            let pruned = inventory::prune(&target, &discovery, &owner, &previous, &next)
                .await
                .context(PruneSnafu)?;
            (Some(next), pruned)
        } else {
            (None, Vec::new())
        };

        if !kustomization.spec.health_checks.is_empty() {
            health::check_all(
                &target,
                &discovery,
                &kustomization.spec.health_checks,
                &default_namespace,
                deadline,
            )
            .await
            .context(HealthCheckSnafu)?;
        }

        info!(
            kustomization = format!("{namespace}/{name}"),
            "Reconciled revision {} ({} of {} objects changed)",
            revision,
            report.changed(),
            report.entries.len()
        );

        Ok(Outcome {
            revision,
            snapshot,
            report,
            pruned,
        })
    }

    /// All data values of the decryption secret are candidate private keys.
    async fn decryption_keys(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .context(ReadDecryptionSecretSnafu { name })?;
        let keys: Vec<String> = secret
            .data
            .unwrap_or_default()
            .into_values()
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .collect();
        snafu::ensure!(!keys.is_empty(), DecryptionSecretEmptySnafu { name });
        Ok(keys)
    }
}

/// Structural validation of the built stream: parseable type metadata and
/// legal object names. Everything deeper is the server's call.
fn validate_client(objects: &[DynamicObject]) -> Result<()> {
    for obj in objects {
        let name = obj.name_any();
        let Some(types) = obj.types.as_ref() else {
            return ValidationSnafu {
                object: name,
                message: "object has no apiVersion or kind".to_string(),
            }
            .fail();
        };
        if let Err(error) = GroupVersionKind::try_from(types) {
            return ValidationSnafu {
                object: format!("{}/{}", types.kind, name),
                message: error.to_string(),
            }
            .fail();
        }
        if !valid_dns_subdomain(&name) {
            return ValidationSnafu {
                object: format!("{}/{}", types.kind, name),
                message: format!("{name:?} is not a valid object name"),
            }
            .fail();
        }
    }
    Ok(())
}

fn valid_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(manifest: &str) -> DynamicObject {
        serde_yaml::from_str(manifest).unwrap()
    }

    #[test]
    fn client_validation_accepts_well_formed_objects() {
        let objects = vec![object(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n",
        )];
        assert!(validate_client(&objects).is_ok());
    }

    #[test]
    fn client_validation_rejects_bad_names() {
        let objects = vec![object(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: Backend_Svc\n",
        )];
        let error = validate_client(&objects).unwrap_err();
        assert_eq!(error.reason(), reason::VALIDATION_FAILED);
    }

    #[test]
    fn stage_reason_mapping() {
        assert_eq!(
            Error::SourceNotReady {
                name: "webapp".into()
            }
            .reason(),
            reason::ARTIFACT_FAILED
        );
        assert_eq!(
            Error::DecryptionSecretEmpty {
                name: "sops-keys".into()
            }
            .reason(),
            reason::BUILD_FAILED
        );
        assert_eq!(
            Error::ApplyFailed {
                object: "Service.core/dev/backend".into(),
                message: "denied".into()
            }
            .reason(),
            reason::RECONCILIATION_FAILED
        );
        assert_eq!(
            Error::Prune {
                source: inventory::Error::DeleteObject {
                    object: "Service.core/dev/backend".into(),
                    message: "forbidden".into()
                }
            }
            .reason(),
            reason::PRUNE_FAILED
        );
    }

    #[test]
    fn dns_subdomain_rules() {
        assert!(valid_dns_subdomain("backend"));
        assert!(valid_dns_subdomain("backend-v2.staging"));
        assert!(!valid_dns_subdomain("Backend"));
        assert!(!valid_dns_subdomain("-backend"));
        assert!(!valid_dns_subdomain(""));
    }
}

pub mod git_repository;
pub mod oci_repository;

pub use git_repository::*;
pub use oci_repository::*;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

/// The `status.artifact` of a Flux source object, the contract consumed by
/// artifact-driven controllers: where the tarball lives, what revision it
/// represents and the digest to verify it against.
#[derive(Debug, Clone)]
pub enum FluxSourceArtefact {
    Git(GitRepositoryStatusArtifact),
    Oci(OCIRepositoryStatusArtifact),
}

impl FluxSourceArtefact {
    pub fn url(&self) -> String {
        match self {
            FluxSourceArtefact::Git(artefact) => artefact.url.clone(),
            FluxSourceArtefact::Oci(artefact) => artefact.url.clone(),
        }
    }

    /// Revision identifier, e.g. `main/1d1d7f9` for Git sources.
    pub fn revision(&self) -> String {
        match self {
            FluxSourceArtefact::Git(artefact) => artefact.revision.clone(),
            FluxSourceArtefact::Oci(artefact) => artefact.revision.clone(),
        }
    }

    /// Content digest in `<algo>:<hex>` form, when the source advertises one.
    pub fn digest(&self) -> Option<String> {
        match self {
            FluxSourceArtefact::Git(artefact) => artefact.digest.clone(),
            FluxSourceArtefact::Oci(artefact) => artefact.digest.clone(),
        }
    }
}

/// True when a `Ready` condition with status `"True"` is present.
pub fn is_ready(conditions: Option<&Vec<Condition>>) -> bool {
    conditions
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, status: &str) -> Condition {
        Condition {
            type_: type_.into(),
            status: status.into(),
            reason: "Succeeded".into(),
            message: String::new(),
            last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ),
            observed_generation: None,
        }
    }

    #[test]
    fn readiness_requires_ready_true() {
        assert!(!is_ready(None));
        assert!(!is_ready(Some(&vec![condition("Ready", "False")])));
        assert!(!is_ready(Some(&vec![condition("Reconciling", "True")])));
        assert!(is_ready(Some(&vec![
            condition("Reconciling", "False"),
            condition("Ready", "True"),
        ])));
    }

    #[test]
    fn artefact_accessors() {
        let artefact = FluxSourceArtefact::Git(GitRepositoryStatusArtifact {
            digest: Some("sha256:abc".into()),
            last_update_time: "2026-01-01T00:00:00Z".into(),
            path: "gitrepository/dev/webapp/1d1d7f9.tar.gz".into(),
            revision: "main/1d1d7f9".into(),
            size: Some(1024),
            url: "http://source-controller.flux-system.svc/gitrepository/dev/webapp/1d1d7f9.tar.gz"
                .into(),
        });
        assert_eq!(artefact.revision(), "main/1d1d7f9");
        assert_eq!(artefact.digest().as_deref(), Some("sha256:abc"));
    }
}

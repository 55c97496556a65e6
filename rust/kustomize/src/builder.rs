use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::debug;
use walkdir::WalkDir;

pub const NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
pub const NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";
pub const CHECKSUM_LABEL: &str = "kustomize.toolkit.fluxcd.io/checksum";

const ROOT_MANIFEST_NAMES: [&str; 2] = ["kustomization.yaml", "kustomization.yml"];

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Build root {} does not exist", path.display()))]
    RootNotFound { path: PathBuf },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to walk {}: {}", path.display(), source))]
    WalkTree {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Failed to parse root manifest {}: {}", path.display(), source))]
    ParseRootManifest {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Resource entry {} not found under {}", entry, root.display()))]
    ResourceEntryNotFound { entry: String, root: PathBuf },

    #[snafu(display("Failed to deserialize manifest {}: {}", path.display(), source))]
    WrongYamlManifest {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Object in {} has no kind or apiVersion", path.display()))]
    MissingTypeMeta { path: PathBuf },

    #[snafu(display("Object {:?} in {} has no name", kind, path.display()))]
    MissingName { kind: String, path: PathBuf },

    #[snafu(display("Build produced no objects under {}", path.display()))]
    EmptyStream { path: PathBuf },

    #[snafu(display("Failed to serialize object {}: {}", name, source))]
    Canonicalize {
        name: String,
        source: serde_json::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of the owning Kustomization, stamped as labels on every built
/// object when pruning is enabled.
#[derive(Clone, Debug)]
pub struct Identity {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// When set, the three identity labels are injected into every object.
    pub identity: Option<Identity>,

    /// Overrides the namespace of all namespaced objects.
    pub target_namespace: Option<String>,
}

/// The ordered result of one overlay build.
pub struct BuiltStream {
    pub objects: Vec<DynamicObject>,

    /// Digest of the canonicalized stream. Identical trees and options
    /// produce identical checksums.
    pub checksum: String,
}

/// Renders a filesystem tree into an ordered stream of Kubernetes objects.
///
/// A root manifest (`kustomization.yaml`) is honored verbatim when present;
/// otherwise every `*.yaml`/`*.yml` under the root is listed
/// lexicographically, which keeps the build deterministic.
pub struct Builder {
    root: PathBuf,
}

/// The subset of a root manifest the builder consumes: the ordered resource
/// list, each entry a file or a directory relative to the manifest.
#[derive(Debug, Default, Deserialize)]
struct RootManifest {
    #[serde(default)]
    resources: Vec<String>,
}

impl Builder {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        ensure!(
            root.is_dir(),
            RootNotFoundSnafu { path: root.clone() }
        );
        Ok(Self { root })
    }

    pub fn build(&self, options: &BuildOptions) -> Result<BuiltStream> {
        let mut objects = Vec::new();
        load_directory(&self.root, &mut objects)?;
        ensure!(
            !objects.is_empty(),
            EmptyStreamSnafu {
                path: self.root.clone(),
            }
        );

        // Stable sort: kinds that must precede others (namespaces, CRDs)
        // float to the front, source order breaks ties.
        objects.sort_by_key(|obj| {
            kind_priority(obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""))
        });

        if let Some(namespace) = &options.target_namespace {
            for obj in objects.iter_mut() {
                let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
                if !is_cluster_scoped(kind) {
                    obj.metadata.namespace = Some(namespace.clone());
                }
            }
        }

        // The checksum is computed before the identity labels go in, so the
        // label value never feeds its own hash.
        let checksum = stream_checksum(&objects)?;

        if let Some(identity) = &options.identity {
            for obj in objects.iter_mut() {
                let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
                labels.insert(NAME_LABEL.to_string(), identity.name.clone());
                labels.insert(NAMESPACE_LABEL.to_string(), identity.namespace.clone());
                labels.insert(CHECKSUM_LABEL.to_string(), checksum.clone());
            }
        }

        debug!(
            "Built {} objects from {} (checksum {})",
            objects.len(),
            self.root.display(),
            checksum
        );
        Ok(BuiltStream { objects, checksum })
    }
}

/// Loads a directory: through its root manifest when one exists, otherwise
/// through a synthesized lexicographic listing.
fn load_directory(dir: &Path, out: &mut Vec<DynamicObject>) -> Result<()> {
    match root_manifest(dir) {
        Some(manifest_path) => {
            let raw = std::fs::read_to_string(&manifest_path).context(ReadFileSnafu {
                path: manifest_path.clone(),
            })?;
            let manifest: RootManifest =
                serde_yaml::from_str(&raw).context(ParseRootManifestSnafu {
                    path: manifest_path.clone(),
                })?;
            for entry in &manifest.resources {
                let path = dir.join(entry);
                if path.is_dir() {
                    load_directory(&path, out)?;
                } else if path.is_file() {
                    load_file(&path, out)?;
                } else {
                    return ResourceEntryNotFoundSnafu {
                        entry: entry.clone(),
                        root: dir.to_path_buf(),
                    }
                    .fail();
                }
            }
            Ok(())
        }
        None => {
            for path in manifest_files(dir)? {
                load_file(&path, out)?;
            }
            Ok(())
        }
    }
}

fn root_manifest(dir: &Path) -> Option<PathBuf> {
    ROOT_MANIFEST_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Every `*.yaml`/`*.yml` under `dir`, recursively, in lexicographic order
/// of the relative path.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.context(WalkTreeSnafu {
            path: dir.to_path_buf(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

fn load_file(path: &Path, out: &mut Vec<DynamicObject>) -> Result<()> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: path.to_path_buf(),
    })?;
    for document in multidoc_deserialize(&raw).context(WrongYamlManifestSnafu {
        path: path.to_path_buf(),
    })? {
        let types = document.types.as_ref().context(MissingTypeMetaSnafu {
            path: path.to_path_buf(),
        })?;
        ensure!(
            !types.kind.is_empty() && !types.api_version.is_empty(),
            MissingTypeMetaSnafu {
                path: path.to_path_buf(),
            }
        );
        ensure!(
            document.metadata.name.is_some(),
            MissingNameSnafu {
                kind: types.kind.clone(),
                path: path.to_path_buf(),
            }
        );
        out.push(document);
    }
    Ok(())
}

/// Splits a multi-document YAML string into dynamic objects, skipping empty
/// documents.
pub fn multidoc_deserialize(data: &str) -> std::result::Result<Vec<DynamicObject>, serde_yaml::Error> {
    use serde::Deserialize;
    let mut docs = vec![];
    for de in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(de)?;
        if value.is_null() {
            continue;
        }
        docs.push(serde_yaml::from_value(value)?);
    }
    Ok(docs)
}

/// Digest over the canonical JSON rendering of the stream. serde_json maps
/// are ordered, so re-parsing the same bytes yields the same digest.
/// Truncated to 40 hex characters so the value fits a label.
fn stream_checksum(objects: &[DynamicObject]) -> Result<String> {
    let mut hasher = Sha256::new();
    for obj in objects {
        let canonical = serde_json::to_string(obj).context(CanonicalizeSnafu {
            name: obj.name_any(),
        })?;
        hasher.update(canonical.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..40].to_string())
}

/// Apply-order priority. Kinds other objects depend on come first, admission
/// webhooks last so they cannot reject the very stream that ships them.
fn kind_priority(kind: &str) -> usize {
    const ORDER: [&str; 22] = [
        "Namespace",
        "ResourceQuota",
        "StorageClass",
        "CustomResourceDefinition",
        "ServiceAccount",
        "PodSecurityPolicy",
        "Role",
        "ClusterRole",
        "RoleBinding",
        "ClusterRoleBinding",
        "ConfigMap",
        "Secret",
        "Endpoints",
        "Service",
        "LimitRange",
        "PriorityClass",
        "PersistentVolume",
        "PersistentVolumeClaim",
        "Deployment",
        "StatefulSet",
        "CronJob",
        "PodDisruptionBudget",
    ];
    const WEBHOOKS: [&str; 2] = [
        "ValidatingWebhookConfiguration",
        "MutatingWebhookConfiguration",
    ];

    if let Some(position) = ORDER.iter().position(|k| *k == kind) {
        position
    } else if WEBHOOKS.contains(&kind) {
        ORDER.len() + 1
    } else {
        ORDER.len()
    }
}

fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PersistentVolume"
            | "StorageClass"
            | "PriorityClass"
            | "ValidatingWebhookConfiguration"
            | "MutatingWebhookConfiguration"
            | "APIService"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\nspec:\n  replicas: 1\n";
    const SERVICE: &str =
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: backend\nspec:\n  type: ClusterIP\n";
    const NAMESPACE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: dev\n";

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn kinds(stream: &BuiltStream) -> Vec<String> {
        stream
            .objects
            .iter()
            .map(|o| o.types.as_ref().unwrap().kind.clone())
            .collect()
    }

    #[test]
    fn synthesized_root_lists_recursively() {
        let dir = tree(&[
            ("base/deployment.yaml", DEPLOYMENT),
            ("base/service.yaml", SERVICE),
            ("notes.txt", "not a manifest"),
        ]);
        let stream = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        assert_eq!(kinds(&stream), vec!["Service", "Deployment"]);
    }

    #[test]
    fn root_manifest_is_honored_verbatim() {
        let dir = tree(&[
            ("kustomization.yaml", "resources:\n- service.yaml\n"),
            ("service.yaml", SERVICE),
            ("ignored.yaml", DEPLOYMENT),
        ]);
        let stream = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        assert_eq!(kinds(&stream), vec!["Service"]);
    }

    #[test]
    fn missing_resource_entry_fails() {
        let dir = tree(&[("kustomization.yaml", "resources:\n- gone.yaml\n")]);
        let result = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default());
        assert!(matches!(
            result,
            Err(Error::ResourceEntryNotFound { .. })
        ));
    }

    #[test]
    fn namespaces_sort_before_workloads() {
        let dir = tree(&[
            ("a-deployment.yaml", DEPLOYMENT),
            ("z-namespace.yaml", NAMESPACE),
        ]);
        let stream = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        assert_eq!(kinds(&stream), vec!["Namespace", "Deployment"]);
    }

    #[test]
    fn build_is_deterministic() {
        let files = [
            ("base/deployment.yaml", DEPLOYMENT),
            ("base/service.yaml", SERVICE),
        ];
        let dir_a = tree(&files);
        let dir_b = tree(&files);
        let a = Builder::new(dir_a.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        let b = Builder::new(dir_b.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn checksum_tracks_content() {
        let dir = tree(&[("deployment.yaml", DEPLOYMENT)]);
        let before = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();

        fs::write(
            dir.path().join("deployment.yaml"),
            DEPLOYMENT.replace("replicas: 1", "replicas: 3"),
        )
        .unwrap();
        let after = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        assert_ne!(before.checksum, after.checksum);
    }

    #[test]
    fn identity_labels_are_injected_after_hashing() {
        let dir = tree(&[("deployment.yaml", DEPLOYMENT)]);
        let plain = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default())
            .unwrap();
        let labeled = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions {
                identity: Some(Identity {
                    name: "backend".into(),
                    namespace: "dev".into(),
                }),
                ..Default::default()
            })
            .unwrap();

        // Same content, same checksum, labels or not.
        assert_eq!(plain.checksum, labeled.checksum);

        let labels = labeled.objects[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(NAME_LABEL).unwrap(), "backend");
        assert_eq!(labels.get(NAMESPACE_LABEL).unwrap(), "dev");
        assert_eq!(labels.get(CHECKSUM_LABEL).unwrap(), &labeled.checksum);
        assert!(labeled.checksum.len() <= 63);

        // Without identity no checksum label appears at all.
        assert!(plain.objects[0].metadata.labels.is_none());
    }

    #[test]
    fn target_namespace_overrides_namespaced_objects_only() {
        let dir = tree(&[
            ("deployment.yaml", DEPLOYMENT),
            ("namespace.yaml", NAMESPACE),
        ]);
        let stream = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions {
                target_namespace: Some("staging".into()),
                ..Default::default()
            })
            .unwrap();

        let namespace = &stream.objects[0];
        assert_eq!(namespace.types.as_ref().unwrap().kind, "Namespace");
        assert_eq!(namespace.metadata.namespace, None);

        let deployment = &stream.objects[1];
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("staging"));
    }

    #[test]
    fn multidoc_splits_and_skips_empty_documents() {
        let docs = multidoc_deserialize(&format!("{DEPLOYMENT}---\n---\n{SERVICE}")).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn object_without_name_fails_the_build() {
        let dir = tree(&[(
            "bad.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  labels: {}\n",
        )]);
        let result = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default());
        assert!(matches!(result, Err(Error::MissingName { .. })));
    }

    #[test]
    fn empty_tree_fails_the_build() {
        let dir = TempDir::new().unwrap();
        let result = Builder::new(dir.path())
            .unwrap()
            .build(&BuildOptions::default());
        assert!(matches!(result, Err(Error::EmptyStream { .. })));
    }
}

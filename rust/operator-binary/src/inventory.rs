use std::collections::{BTreeMap, BTreeSet};

use flux_kustomize_operator_crd::{
    ResourceRef, Snapshot, NAMESPACE_LABEL, NAME_LABEL,
};
use kube::{
    api::{DeleteParams, DynamicObject, GroupVersionKind},
    Client, Discovery,
};
use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{info, warn};

use crate::utils::{dynamic_api, resource_ref};

/// Kinds whose children should go away with them: deletions use foreground
/// propagation so the orphan count the user sees is honest.
const FOREGROUND_KINDS: [&str; 6] = [
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "Job",
    "CronJob",
];

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to delete {}: {}", object, message))]
    DeleteObject { object: String, message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of the Kustomization owning an inventory.
#[derive(Clone, Debug)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
}

/// Computes the inventory of a built stream: the sorted, de-duplicated set
/// of object identities together with the stream checksum.
pub fn snapshot_from_stream(
    checksum: &str,
    objects: &[DynamicObject],
    default_namespace: &str,
) -> Snapshot {
    let entries: BTreeSet<ResourceRef> = objects
        .iter()
        .filter_map(|obj| resource_ref(obj, default_namespace).ok())
        .collect();
    Snapshot {
        checksum: checksum.to_string(),
        entries: entries.into_iter().collect(),
    }
}

/// Deletes every object of `previous` that is absent from `next` on the
/// target cluster. Passing an empty `next` is the finalizer path: the whole
/// inventory goes.
///
/// Objects whose identity labels name a different owner are skipped; each
/// owner only ever garbage-collects what it labeled itself. Failures do not
/// stop the sweep and never roll anything back; the first one is reported.
pub async fn prune(
    client: &Client,
    discovery: &Discovery,
    owner: &Owner,
    previous: &Snapshot,
    next: &Snapshot,
) -> Result<Vec<ResourceRef>> {
    let mut deleted = Vec::new();
    let mut first_failure: Option<Error> = None;

    for orphan in previous.orphans(next) {
        let gvk = GroupVersionKind {
            group: orphan.group.clone(),
            version: orphan.version.clone(),
            kind: orphan.kind.clone(),
        };
        let Some((ar, caps)) = discovery.resolve_gvk(&gvk) else {
            // The API that served this object is gone; nothing left to
            // delete.
            warn!("Failed to resolve {} while pruning, skipping", orphan);
            continue;
        };

        let api = dynamic_api(
            ar,
            caps,
            client.clone(),
            orphan.namespace.as_deref(),
            false,
        );

        match api.get_opt(&orphan.name).await {
            Ok(Some(found)) => {
                if !owned_by(found.metadata.labels.as_ref(), owner) {
                    warn!("Skipping {} owned by another Kustomization", orphan);
                    continue;
                }
            }
            Ok(None) => continue,
            Err(error) => {
                record_failure(&mut first_failure, &orphan, error.to_string());
                continue;
            }
        }

        let delete_params = if FOREGROUND_KINDS.contains(&orphan.kind.as_str()) {
            DeleteParams::foreground()
        } else {
            DeleteParams::background()
        };

        match api.delete(&orphan.name, &delete_params).await {
            Ok(_) => {
                info!("Pruned {}", orphan);
                deleted.push(orphan);
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                deleted.push(orphan);
            }
            Err(error) => record_failure(&mut first_failure, &orphan, error.to_string()),
        }
    }

    match first_failure {
        Some(error) => Err(error),
        None => Ok(deleted),
    }
}

fn record_failure(first: &mut Option<Error>, orphan: &ResourceRef, message: String) {
    warn!("Failed to prune {}: {}", orphan, message);
    if first.is_none() {
        *first = Some(Error::DeleteObject {
            object: orphan.to_string(),
            message,
        });
    }
}

/// An object belongs to `owner` iff both identity labels match. Objects
/// labeled by a sibling Kustomization are out of bounds even when they sit
/// in this inventory (last-writer-wins overlap).
fn owned_by(labels: Option<&BTreeMap<String, String>>, owner: &Owner) -> bool {
    labels
        .map(|labels| {
            labels.get(NAME_LABEL) == Some(&owner.name)
                && labels.get(NAMESPACE_LABEL) == Some(&owner.namespace)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_entries_are_sorted_and_unique() {
        let objects: Vec<DynamicObject> = vec![
            serde_yaml::from_str(
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: backend\n",
            )
            .unwrap(),
            serde_yaml::from_str(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: backend\n",
            )
            .unwrap(),
            serde_yaml::from_str(
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: backend\n",
            )
            .unwrap(),
        ];
        let snapshot = snapshot_from_stream("abc", &objects, "dev");
        assert_eq!(snapshot.checksum, "abc");
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.entries.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ownership_requires_both_labels() {
        let owner = Owner {
            name: "backend".into(),
            namespace: "dev".into(),
        };
        let mut labels = BTreeMap::new();
        assert!(!owned_by(None, &owner));
        labels.insert(NAME_LABEL.to_string(), "backend".to_string());
        assert!(!owned_by(Some(&labels), &owner));
        labels.insert(NAMESPACE_LABEL.to_string(), "dev".to_string());
        assert!(owned_by(Some(&labels), &owner));
        labels.insert(NAMESPACE_LABEL.to_string(), "prod".to_string());
        assert!(!owned_by(Some(&labels), &owner));
    }

    #[test]
    fn workload_kinds_cascade_in_foreground() {
        assert!(FOREGROUND_KINDS.contains(&"Deployment"));
        assert!(!FOREGROUND_KINDS.contains(&"ConfigMap"));
    }
}

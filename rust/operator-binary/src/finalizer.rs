use flux_kustomize_operator_crd::{Kustomization, FINALIZER};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Error, ResourceExt,
};
use serde_json::{json, Value};

/// Ensures the controller finalizer is present, keeping any foreign
/// finalizers intact.
pub(crate) async fn add(
    client: Client,
    kustomization: &Kustomization,
) -> Result<Option<Kustomization>, Error> {
    let mut finalizers = kustomization.finalizers().to_vec();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(None);
    }
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(client, kustomization, finalizers)
        .await
        .map(Some)
}

/// Removes the controller finalizer, allowing the object to go away.
pub(crate) async fn remove(
    client: Client,
    kustomization: &Kustomization,
) -> Result<Kustomization, Error> {
    let finalizers = kustomization
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(client, kustomization, finalizers).await
}

async fn patch_finalizers(
    client: Client,
    kustomization: &Kustomization,
    finalizers: Vec<String>,
) -> Result<Kustomization, Error> {
    let namespace = kustomization.namespace().unwrap_or_default();
    let api: Api<Kustomization> = Api::namespaced(client, &namespace);
    let patch: Value = json!({
      "metadata": {
          "finalizers": finalizers
      }
    });

    api.patch(
        &kustomization.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
}

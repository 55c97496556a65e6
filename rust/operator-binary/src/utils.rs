use flux_kustomize_operator_crd::ResourceRef;
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{ApiCapabilities, Scope},
    Api, Client, ResourceExt,
};

/// Builds a dynamic API handle scoped the way the resource demands.
pub fn dynamic_api(
    ar: ApiResource,
    caps: ApiCapabilities,
    client: Client,
    ns: Option<&str>,
    all: bool,
) -> Api<DynamicObject> {
    if caps.scope == Scope::Cluster || all {
        Api::all_with(client, &ar)
    } else if let Some(namespace) = ns {
        Api::namespaced_with(client, namespace, &ar)
    } else {
        Api::default_namespaced_with(client, &ar)
    }
}

/// Inventory identity of a built object, with the namespace defaulted the
/// same way the applier defaults it.
pub fn resource_ref(
    obj: &DynamicObject,
    default_namespace: &str,
) -> Result<ResourceRef, kube::core::gvk::ParseGroupVersionError> {
    let gvk = obj
        .types
        .as_ref()
        .map(GroupVersionKind::try_from)
        .transpose()?
        .unwrap_or_else(|| GroupVersionKind::gvk("", "", ""));
    Ok(ResourceRef {
        group: gvk.group,
        version: gvk.version,
        kind: gvk.kind,
        namespace: Some(
            obj.metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
        ),
        name: obj.name_any(),
    })
}

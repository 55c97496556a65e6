use flux_kustomize_operator_crd::Kustomization;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, ResourceExt,
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::debug;

/// Keys probed in the kubeconfig secret, in order.
const KUBECONFIG_SECRET_KEYS: [&str; 2] = ["value", "value.yaml"];

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("Failed to read kubeconfig secret {}: {}", name, source))]
    ReadKubeconfigSecret { name: String, source: kube::Error },

    #[snafu(display("Kubeconfig secret {} has no {:?} key", name, KUBECONFIG_SECRET_KEYS))]
    KubeconfigSecretMissingValue { name: String },

    #[snafu(display("Kubeconfig secret {} is not valid UTF-8", name))]
    KubeconfigNotUtf8 {
        name: String,
        source: std::str::Utf8Error,
    },

    #[snafu(display("Failed to parse kubeconfig from secret {}: {}", name, source))]
    ParseKubeconfig {
        name: String,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display(
        "Kubeconfig from secret {} is not self-contained: {}",
        name,
        reason
    ))]
    NotSelfContained { name: String, reason: String },

    #[snafu(display("Failed to load kubeconfig contexts: {}", source))]
    LoadKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("Failed to build cluster client: {}", source))]
    BuildClient { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds the API client a reconciliation applies through: the controller's
/// own identity, an impersonated service account, a remote cluster from a
/// kubeconfig secret, or the latter two composed.
pub struct ClusterResolver {
    client: Client,
    config: Config,
}

impl ClusterResolver {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    pub async fn resolve(&self, kustomization: &Kustomization) -> Result<Client> {
        let namespace = kustomization.namespace().context(ObjectHasNoNamespaceSnafu)?;

        let mut config = match &kustomization.spec.kube_config {
            Some(kube_config) => {
                let name = &kube_config.secret_ref.name;
                let kubeconfig = self.load_kubeconfig(&namespace, name).await?;
                ensure_self_contained(&kubeconfig).map_err(|reason| Error::NotSelfContained {
                    name: name.clone(),
                    reason,
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context(LoadKubeconfigSnafu)?
            }
            None if kustomization.spec.service_account_name.is_none() => {
                return Ok(self.client.clone());
            }
            None => self.config.clone(),
        };

        // Impersonation applies inside whichever cluster was targeted above.
        if let Some(service_account) = &kustomization.spec.service_account_name {
            config.auth_info.impersonate =
                Some(impersonation_user(&namespace, service_account));
            config.auth_info.impersonate_groups = None;
            debug!(
                "Impersonating {} on target cluster",
                config.auth_info.impersonate.as_deref().unwrap_or_default()
            );
        }

        Client::try_from(config).context(BuildClientSnafu)
    }

    async fn load_kubeconfig(&self, namespace: &str, name: &str) -> Result<Kubeconfig> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .context(ReadKubeconfigSecretSnafu { name })?;

        let data = secret.data.unwrap_or_default();
        let bytes = KUBECONFIG_SECRET_KEYS
            .iter()
            .find_map(|key| data.get(*key))
            .context(KubeconfigSecretMissingValueSnafu { name })?;

        let raw = std::str::from_utf8(&bytes.0).context(KubeconfigNotUtf8Snafu { name })?;
        Kubeconfig::from_yaml(raw).context(ParseKubeconfigSnafu { name })
    }
}

pub fn impersonation_user(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{namespace}:{service_account}")
}

/// A kubeconfig loaded from a secret must carry everything inline: exec
/// plugins and file-path credentials would resolve inside the controller
/// pod, not the cluster the user meant.
fn ensure_self_contained(kubeconfig: &Kubeconfig) -> std::result::Result<(), String> {
    for named in &kubeconfig.clusters {
        let Some(cluster) = &named.cluster else {
            continue;
        };
        if cluster.certificate_authority.is_some() {
            return Err(format!(
                "cluster {:?} references a certificate-authority file",
                named.name
            ));
        }
    }
    for named in &kubeconfig.auth_infos {
        let Some(auth) = &named.auth_info else {
            continue;
        };
        if auth.exec.is_some() {
            return Err(format!("user {:?} uses an exec credential plugin", named.name));
        }
        if auth.auth_provider.is_some() {
            return Err(format!("user {:?} uses an auth provider plugin", named.name));
        }
        if auth.token_file.is_some() {
            return Err(format!("user {:?} references a token file", named.name));
        }
        if auth.client_certificate.is_some() || auth.client_key.is_some() {
            return Err(format!(
                "user {:?} references client certificate files",
                named.name
            ));
        }
    }
    Ok(())
}

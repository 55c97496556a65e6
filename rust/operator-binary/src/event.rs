use std::sync::Arc;

use flux_kustomize_operator_crd::Kustomization;
use kube::{
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
    },
    Client,
};

use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: kube::Error },
}

/// Publishes a Kubernetes event on the Kustomization. The reason mirrors the
/// Ready condition reason so events and conditions tell one story.
pub async fn publish(
    kustomization: Arc<Kustomization>,
    client: Client,
    type_: EventType,
    reason: String,
    note: Option<String>,
) -> Result<(), Error> {
    let reporter: Reporter = crate::controller::CONTROLLER_NAME.into();

    let object_ref = ObjectRef::from_obj(kustomization.as_ref());

    let recorder = Recorder::new(client.to_owned(), reporter, object_ref.into());
    recorder
        .publish(Event {
            action: "Reconcile".into(),
            reason,
            note,
            type_,
            secondary: None,
        })
        .await
        .context(PublishEventSnafu)
}

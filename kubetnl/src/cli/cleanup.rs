//! The `cleanup` command: remove leftover cluster objects from crashed runs.
//!
//! The controller deletes its objects on every graceful exit, but a
//! force-killed process leaves them behind. All of them carry the shared
//! tunnel label, so they can be found and removed by selector afterwards.

use clap::Args;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service, ServiceAccount};
use kube::{
    Api, Resource,
    api::{DeleteParams, ListParams},
};
use kubetnl_base::consts::k8s::labels;

use crate::cli::{Error, error};

#[derive(Args, Clone)]
pub struct CleanupCommand {
    #[arg(short = 'n', long = "namespace", help = "Namespace to search for leftover resources.")]
    pub namespace: Option<String>,

    #[arg(
        value_name = "NAME",
        help = "Tunnel names to clean up. Every kubetnl-labelled resource in the namespace is \
                removed when no name is given."
    )]
    pub names: Vec<String>,
}

impl CleanupCommand {
    pub async fn run(self, kube_client: kube::Client) -> Result<(), Error> {
        let Self { namespace, names } = self;

        let namespace = namespace
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| kube_client.default_namespace().to_string());

        let selectors = if names.is_empty() {
            vec![labels::TUNNEL.to_string()]
        } else {
            names.iter().map(|name| format!("{}={name}", labels::TUNNEL)).collect()
        };

        let futs = selectors.into_iter().map(|selector| {
            let kube_client = kube_client.clone();
            let namespace = namespace.clone();
            async move { cleanup_selector(kube_client, &namespace, &selector).await }
        });
        let failures = futures::stream::iter(futs)
            .buffer_unordered(5)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        if failures.is_empty() {
            Ok(())
        } else {
            error::CleanupIncompleteSnafu { failures }.fail()
        }
    }
}

/// Deletes every tunnel-owned kind matching one label selector. Failures are
/// collected instead of short-circuiting so one broken kind does not leave
/// the others behind.
async fn cleanup_selector(
    kube_client: kube::Client,
    namespace: &str,
    selector: &str,
) -> Vec<String> {
    let mut failures = Vec::new();
    delete_labelled::<Pod>(&kube_client, "pods", namespace, selector, &mut failures).await;
    delete_labelled::<Service>(&kube_client, "services", namespace, selector, &mut failures)
        .await;
    delete_labelled::<ConfigMap>(&kube_client, "configmaps", namespace, selector, &mut failures)
        .await;
    delete_labelled::<ServiceAccount>(
        &kube_client,
        "serviceaccounts",
        namespace,
        selector,
        &mut failures,
    )
    .await;
    failures
}

async fn delete_labelled<K>(
    client: &kube::Client,
    kind: &str,
    namespace: &str,
    selector: &str,
    failures: &mut Vec<String>,
) where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(selector);
    match api.delete_collection(&DeleteParams::foreground(), &params).await {
        Ok(_) => tracing::info!("Deleted {kind} labelled {selector} in namespace {namespace}"),
        Err(source) => {
            tracing::warn!("Failed to delete {kind} labelled {selector}: {source}");
            failures.push(format!("{kind} ({selector}): {source}"));
        }
    }
}

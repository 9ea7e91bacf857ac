//! Creation, readiness and deletion of the cluster objects backing a tunnel.

use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service, ServiceAccount};
use kube::{
    Api, Resource,
    api::{DeleteParams, PostParams},
    runtime::wait::{Condition, await_condition},
};
use tokio_util::sync::CancellationToken;

use crate::tunnel::{TunnelSpec, error, error::Error, objects};

/// Upper bound on waiting for the tunnel pod to pass its readiness probe.
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-deletion bound during cleanup. Cleanup runs after the session context
/// is already cancelled, so each call carries its own deadline instead.
const CLEANUP_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The typed API handles for one tunnel plus the record of which objects
/// this session actually created and therefore owns for deletion.
pub struct TunnelResources {
    name: String,
    namespace: String,
    service_accounts: Api<ServiceAccount>,
    config_maps: Api<ConfigMap>,
    pods: Api<Pod>,
    services: Api<Service>,
    created_service_account: bool,
    created_config_map: bool,
    created_pod: bool,
    created_service: bool,
}

impl TunnelResources {
    pub fn new(client: kube::Client, name: impl Into<String>, namespace: &str) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.to_string(),
            service_accounts: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            services: Api::namespaced(client, namespace),
            created_service_account: false,
            created_config_map: false,
            created_pod: false,
            created_service: false,
        }
    }

    /// Creates ServiceAccount, ConfigMap, Pod and Service, in that order.
    ///
    /// An already existing ServiceAccount is treated as success: a previous
    /// run may have left it behind and the account carries no state. Every
    /// created object is recorded so a later [`cleanup_all`](Self::cleanup_all)
    /// deletes exactly what this session owns.
    pub async fn create_all(&mut self, spec: &TunnelSpec) -> Result<(), Error> {
        let params = PostParams::default();

        tracing::debug!("Creating ServiceAccount {}", self.name);
        match self.service_accounts.create(&params, &objects::service_account(spec)).await {
            Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {
                self.created_service_account = true;
            }
            Err(source) => {
                return Err(Error::CreateResource {
                    kind: "ServiceAccount",
                    name: self.name.clone(),
                    namespace: self.namespace.clone(),
                    source: Box::new(source),
                });
            }
        }

        tracing::debug!("Creating ConfigMap {}", self.name);
        let _created = self
            .config_maps
            .create(&params, &objects::config_map(spec))
            .await
            .map_err(|source| self.create_error("ConfigMap", source))?;
        self.created_config_map = true;

        tracing::debug!("Creating Pod {}", self.name);
        let _created = self
            .pods
            .create(&params, &objects::pod(spec))
            .await
            .map_err(|source| self.create_error("Pod", source))?;
        self.created_pod = true;

        tracing::debug!("Creating Service {}", self.name);
        let _created = self
            .services
            .create(&params, &objects::service(spec))
            .await
            .map_err(|source| self.create_error("Service", source))?;
        self.created_service = true;

        Ok(())
    }

    /// Waits until the pod's `Ready` condition turns `True`.
    ///
    /// Returns [`Error::Interrupted`] when the session is cancelled while
    /// waiting and [`Error::PodReadyTimeout`] after the bounded window.
    pub async fn wait_ready(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        tracing::debug!("Waiting for pod {} to become ready", self.name);

        let wait = tokio::time::timeout(
            POD_READY_TIMEOUT,
            await_condition(self.pods.clone(), &self.name, is_pod_ready()),
        );
        tokio::select! {
            () = shutdown.cancelled() => Err(Error::Interrupted),
            result = wait => match result {
                Ok(Ok(_pod)) => {
                    tracing::debug!("Pod {} is ready", self.name);
                    Ok(())
                }
                Ok(Err(source)) => Err(Error::WatchPod {
                    name: self.name.clone(),
                    namespace: self.namespace.clone(),
                    source: Box::new(source),
                }),
                Err(_elapsed) => error::PodReadyTimeoutSnafu {
                    name: self.name.clone(),
                    seconds: POD_READY_TIMEOUT.as_secs(),
                }
                .fail(),
            },
        }
    }

    /// Deletes every object this session created, in the order Pod,
    /// ServiceAccount, ConfigMap, Service, with foreground propagation.
    ///
    /// A failed deletion is logged and collected but never stops the
    /// remaining deletions; the composite outcome is reported at the end.
    /// Callers invoke this on a fresh code path that does not consult the
    /// cancelled session token, so interrupts cannot skip deletions.
    pub async fn cleanup_all(&mut self) -> Result<(), Error> {
        let mut failures = Vec::new();

        if self.created_pod {
            self.delete(&self.pods.clone(), "Pod", &mut failures).await;
            self.created_pod = false;
        }
        if self.created_service_account {
            self.delete(&self.service_accounts.clone(), "ServiceAccount", &mut failures).await;
            self.created_service_account = false;
        }
        if self.created_config_map {
            self.delete(&self.config_maps.clone(), "ConfigMap", &mut failures).await;
            self.created_config_map = false;
        }
        if self.created_service {
            self.delete(&self.services.clone(), "Service", &mut failures).await;
            self.created_service = false;
        }

        if failures.is_empty() { Ok(()) } else { Err(Error::Cleanup { failures }) }
    }

    async fn delete<K>(&self, api: &Api<K>, kind: &str, failures: &mut Vec<String>)
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        tracing::debug!("Cleanup: deleting {kind} {}", self.name);
        let params = DeleteParams::foreground();
        let delete = api.delete(&self.name, &params);
        match tokio::time::timeout(CLEANUP_CALL_TIMEOUT, delete).await {
            Ok(Ok(_)) | Ok(Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. }))) => {}
            Ok(Err(source)) => {
                tracing::warn!("Cleanup: failed to delete {kind} {}: {source}", self.name);
                failures.push(format!("{kind} {}: {source}", self.name));
            }
            Err(_elapsed) => {
                tracing::warn!("Cleanup: timed out deleting {kind} {}", self.name);
                failures.push(format!("{kind} {}: deletion timed out", self.name));
            }
        }
    }

    fn create_error(&self, kind: &'static str, source: kube::Error) -> Error {
        Error::CreateResource {
            kind,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            source: Box::new(source),
        }
    }
}

fn is_pod_ready() -> impl Condition<Pod> {
    |obj: Option<&Pod>| {
        obj.and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
            })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use kube::runtime::wait::Condition;

    use super::is_pod_ready;

    fn pod_with_conditions(conditions: Vec<PodCondition>) -> Pod {
        Pod {
            status: Some(PodStatus { conditions: Some(conditions), ..PodStatus::default() }),
            ..Pod::default()
        }
    }

    fn condition(type_: &str, status: &str) -> PodCondition {
        PodCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..PodCondition::default()
        }
    }

    #[test]
    fn test_ready_condition_true_matches() {
        let pod = pod_with_conditions(vec![
            condition("PodScheduled", "True"),
            condition("Ready", "True"),
        ]);
        assert!(is_pod_ready().matches_object(Some(&pod)));
    }

    #[test]
    fn test_ready_condition_false_does_not_match() {
        let pod = pod_with_conditions(vec![condition("Ready", "False")]);
        assert!(!is_pod_ready().matches_object(Some(&pod)));
    }

    #[test]
    fn test_missing_status_does_not_match() {
        assert!(!is_pod_ready().matches_object(Some(&Pod::default())));
        assert!(!is_pod_ready().matches_object(None));
    }
}

//! The composite tunnel controller.
//!
//! One tunnel session chains three transports: the cluster's pod
//! port-forward (local TCP port to the SSH daemon in the pod), an SSH
//! session over that port, and one reverse listener per port mapping opened
//! through the SSH session. The controller materialises the backing cluster
//! objects, brings the layers up in order, and guarantees that cluster-side
//! state is removed again no matter which layer failed.

mod error;
pub mod objects;
mod resources;

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use self::error::Error;
use self::resources::TunnelResources;
use crate::{port::Mapping, port_forwarder::PodForwarder, ssh::SshTunnel};

/// Immutable description of one tunnel session.
#[derive(Clone, Debug)]
pub struct TunnelSpec {
    /// Name of the tunnel; also the name of every derived cluster object
    /// and the value of their shared label.
    pub name: String,

    pub namespace: String,

    /// Image of the in-pod SSH daemon.
    pub image: String,

    /// Ordered port mappings served by this tunnel.
    pub mappings: Vec<Mapping>,

    /// Operator-side TCP port receiving the pod-forwarded SSH stream. Must
    /// be free when the session starts.
    pub local_ssh_port: u16,

    /// Port the SSH daemon listens on inside the pod. Chosen to avoid every
    /// mapped container port.
    pub remote_ssh_port: u16,

    /// Whether a failing port mapping leaves the remaining mappings (and
    /// the session) alive.
    pub continue_on_tunnel_error: bool,
}

/// A tunnel session: owns the cluster objects and both transport layers.
pub struct Tunnel {
    spec: TunnelSpec,
    client: kube::Client,
    resources: TunnelResources,
    shutdown: CancellationToken,
    ready_sender: watch::Sender<bool>,
    ready: watch::Receiver<bool>,
    forwarder: Option<PodForwarder>,
    ssh: Option<SshTunnel>,
}

impl Tunnel {
    pub fn new(client: kube::Client, spec: TunnelSpec, shutdown: CancellationToken) -> Self {
        let resources = TunnelResources::new(client.clone(), spec.name.as_str(), &spec.namespace);
        let (ready_sender, ready) = watch::channel(false);
        Self {
            spec,
            client,
            resources,
            shutdown,
            ready_sender,
            ready,
            forwarder: None,
            ssh: None,
        }
    }

    /// Brings the session up: cluster objects, pod readiness, pod
    /// port-forward, SSH session, remote listeners, in that order. The
    /// ready latch flips only after the remote listeners are open.
    ///
    /// Any failure before readiness tears down whatever already came up,
    /// including the cluster objects, and surfaces the causing error;
    /// cancellation surfaces [`Error::Interrupted`].
    pub async fn run(&mut self) -> Result<(), Error> {
        if let Err(source) = self.establish().await {
            self.close_transports().await;
            if let Err(cleanup_error) = self.resources.cleanup_all().await {
                tracing::warn!("{cleanup_error}");
            }
            return Err(source);
        }

        let _unused = self.ready_sender.send(true);
        Ok(())
    }

    async fn establish(&mut self) -> Result<(), Error> {
        self.resources.create_all(&self.spec).await?;
        self.resources.wait_ready(&self.shutdown).await?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.spec.namespace);
        let mut forwarder = PodForwarder::spawn(
            pods,
            self.spec.name.as_str(),
            self.spec.local_ssh_port,
            self.spec.remote_ssh_port,
            self.shutdown.child_token(),
        );

        tracing::debug!("Waiting for SSH port-forward to be ready...");
        let forwarder_ready = tokio::select! {
            () = self.shutdown.cancelled() => false,
            ready = forwarder.ready() => ready,
        };
        if !forwarder_ready {
            let result = forwarder.join().await;
            self.forwarder = Some(forwarder);
            return match result {
                Err(source) => Err(source.into()),
                Ok(()) => Err(Error::Interrupted),
            };
        }
        self.forwarder = Some(forwarder);

        tracing::debug!("SSH port-forward is ready: starting SSH connection...");
        let mut ssh = SshTunnel::dial(
            self.spec.local_ssh_port,
            &self.spec.mappings,
            self.spec.continue_on_tunnel_error,
            &self.shutdown,
        )
        .await?;
        ssh.open_remote_forwards(&self.spec.mappings).await?;
        self.ssh = Some(ssh);

        Ok(())
    }

    /// Resolves once the session is fully up. The latch flips at most once
    /// and only after at least one remote listener is open.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        let _unused = ready.wait_for(|ready| *ready).await;
    }

    /// Runs a ready session until the operator cancels it.
    ///
    /// A dying SSH session after readiness is a policy decision: with
    /// `continue_on_tunnel_error` the remaining layers keep running until
    /// the operator interrupts, otherwise the whole session is brought
    /// down and the failure is surfaced.
    pub async fn wait(&self) -> Result<(), Error> {
        let Some(ssh) = &self.ssh else {
            self.shutdown.cancelled().await;
            return Ok(());
        };

        tokio::select! {
            () = self.shutdown.cancelled() => Ok(()),
            () = ssh.session_closed() => {
                tracing::error!("SSH session ended unexpectedly");
                if self.spec.continue_on_tunnel_error {
                    self.shutdown.cancelled().await;
                    Ok(())
                } else {
                    self.shutdown.cancel();
                    Err(Error::SshSessionClosed)
                }
            }
        }
    }

    /// Tears the session down in order: remote listeners, SSH client, pod
    /// port-forwarder, cluster objects. Reports the composite cleanup
    /// outcome.
    ///
    /// Deletions run on their own short deadlines and never consult the
    /// cancelled session token, so an interrupt cannot skip them.
    pub async fn stop(mut self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.close_transports().await;
        self.resources.cleanup_all().await
    }

    async fn close_transports(&mut self) {
        if let Some(ssh) = self.ssh.take() {
            ssh.close().await;
        }
        if let Some(mut forwarder) = self.forwarder.take() {
            forwarder.stop();
            if let Err(source) = forwarder.join().await {
                tracing::warn!("Port-forwarder ended with error: {source}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh;

    #[test]
    fn test_cleanup_error_reports_every_failure() {
        let error = Error::Cleanup {
            failures: vec!["Pod s1: boom".to_string(), "Service s1: boom".to_string()],
        };
        let message = error.to_string();

        assert!(message.contains("Pod s1: boom"));
        assert!(message.contains("Service s1: boom"));
        assert!(message.contains("kubetnl cleanup"));
    }

    #[test]
    fn test_ssh_interrupt_stays_an_interrupt() {
        let error = Error::from(ssh::Error::Interrupted);
        assert!(matches!(error, Error::Interrupted));
    }

    #[test]
    fn test_ssh_failure_is_not_an_interrupt() {
        let error = Error::from(ssh::Error::RemoteForwardRejected { port: 80 });
        assert!(matches!(error, Error::Ssh { .. }));
    }
}

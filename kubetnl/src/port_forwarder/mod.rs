//! The first transport layer: a local TCP listener relaying every accepted
//! connection to one port of the tunnel pod over the API server's
//! `portforward` subresource.

mod error;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

pub use self::error::Error;
use crate::splice;

/// Pause between attempts to establish a pod-port-forward stream. Hides
/// transient control-plane blips from the SSH client sitting above.
const REDIAL_INTERVAL: Duration = Duration::from_millis(500);

/// A running pod-port-forwarder.
///
/// The local listen socket is bound exactly once and stays bound for the
/// whole lifetime of the forwarder; per-connection forward sessions behind
/// it may come and go. The ready latch therefore flips once and never
/// resets.
pub struct PodForwarder {
    shutdown: CancellationToken,
    ready: watch::Receiver<bool>,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

impl PodForwarder {
    /// Starts a forwarder from `127.0.0.1:<local_port>` to `remote_port` of
    /// the named pod. The worker exits when `shutdown` is cancelled.
    pub fn spawn(
        api: Api<Pod>,
        pod_name: impl Into<String>,
        local_port: u16,
        remote_port: u16,
        shutdown: CancellationToken,
    ) -> Self {
        let (ready_sender, ready) = watch::channel(false);
        let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_port);
        let worker = tokio::spawn(run(
            api,
            pod_name.into(),
            local_addr,
            remote_port,
            shutdown.clone(),
            ready_sender,
        ));

        Self { shutdown, ready, worker: Some(worker) }
    }

    /// Waits until the local listener is accepting connections. Returns
    /// `false` when the worker exited before ever becoming ready; the exit
    /// error is then available from [`join`](Self::join).
    pub async fn ready(&mut self) -> bool {
        self.ready.wait_for(|ready| *ready).await.is_ok()
    }

    /// Requests the worker to tear down the forward and exit. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the worker to fully exit and returns its outcome.
    pub async fn join(&mut self) -> Result<(), Error> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::warn!("Port-forward worker ended abnormally: {join_error}");
                Ok(())
            }
        }
    }
}

async fn run(
    api: Api<Pod>,
    pod_name: String,
    local_addr: SocketAddr,
    remote_port: u16,
    shutdown: CancellationToken,
    ready: watch::Sender<bool>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(&local_addr)
        .await
        .map_err(|source| Error::BindTcpSocket { socket_address: local_addr, source })?;
    let actual_addr = listener
        .local_addr()
        .map_err(|source| Error::BindTcpSocket { socket_address: local_addr, source })?;

    tracing::info!("Forwarding from: {actual_addr} -> {pod_name}:{remote_port}");
    let _unused = ready.send(true);

    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!("Shutdown requested, closing port forwarder");
                break;
            }

            connection = listener.accept() => {
                let (local_stream, peer) = connection.map_err(|source| Error::AcceptTcpSocket {
                    socket_address: actual_addr,
                    source,
                })?;
                relays.spawn(relay(
                    api.clone(),
                    pod_name.clone(),
                    remote_port,
                    local_stream,
                    peer,
                    shutdown.clone(),
                ));
            }

            // Reap finished relays so the set does not grow unbounded.
            Some(result) = relays.join_next() => {
                if let Err(join_error) = result {
                    tracing::warn!("Relay task ended abnormally: {join_error}");
                }
            }
        }
    }

    relays.shutdown().await;
    Ok(())
}

/// Relays one accepted connection to the pod, dialing a fresh port-forward
/// stream for it. Failed dials are retried every [`REDIAL_INTERVAL`] until
/// shutdown, so a control-plane blip delays the connection instead of
/// killing it.
async fn relay(
    api: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    mut local_stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut pod_stream = loop {
        let stream = match api.portforward(&pod_name, &[remote_port]).await {
            Ok(mut forward) => forward.take_stream(remote_port),
            Err(source) => {
                tracing::debug!(
                    "Failed to open port-forward to {pod_name}:{remote_port}: {source}. \
                     Retrying..."
                );
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(REDIAL_INTERVAL) => continue,
                }
            }
        };
        match stream {
            Some(stream) => break stream,
            None => return,
        }
    };

    tracing::debug!("Relaying connection [{peer} -> {pod_name}:{remote_port}]");
    tokio::select! {
        () = shutdown.cancelled() => {
            tracing::debug!("Closing relay [{peer} -> {pod_name}:{remote_port}] due to shutdown");
        }
        result = splice::splice(&mut local_stream, &mut pod_stream) => match result {
            Ok((sent, received)) => {
                tracing::debug!("Relay closed: sent {sent}, received {received}");
            }
            // One broken relay never brings down the forwarder.
            Err(source) => tracing::warn!("Relay stream error: {source}"),
        }
    }
}

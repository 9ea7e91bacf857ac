//! The second transport layer: an SSH session over the forwarded local port,
//! carrying one reverse listener per port mapping.
//!
//! The daemon inside the pod listens on `0.0.0.0:<container_port>` for each
//! mapping (a `tcpip-forward` global request) and hands accepted connections
//! back over the session, where they are spliced onto fresh TCP connections
//! to the mapping's target.

mod error;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use russh::{
    Channel, Disconnect,
    client::{self, Msg},
    keys::PublicKey,
};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub use self::error::Error;
use crate::{port::Mapping, splice};

const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Dial attempts logged at debug only after this many failures; the daemon
/// regularly needs a few seconds after pod-ready before sshd accepts.
const SILENT_DIAL_ATTEMPTS: u32 = 3;

/// Remote listeners must bind the wildcard address; sshd does not deliver
/// forwarded connections for listeners bound to a specific remote IP.
const REMOTE_BIND_ADDRESS: &str = "0.0.0.0";

/// Client handler accepting any host key.
///
/// The TCP link to the daemon runs entirely inside the cluster-authenticated
/// port-forward, so the host key adds nothing and the daemon generates a
/// fresh one on every pod start anyway.
struct Handler {
    targets: Arc<HashMap<u16, String>>,
    splices: TaskTracker,
    closed: CancellationToken,
}

impl Drop for Handler {
    // The handler lives as long as the session task; its drop is the one
    // reliable signal that the SSH session is gone.
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let port = u16::try_from(connected_port).unwrap_or_default();
        let Some(target) = self.targets.get(&port).cloned() else {
            tracing::warn!(
                "Dropping forwarded connection for unmapped port {connected_address}:\
                 {connected_port}"
            );
            return Ok(());
        };

        let origin = format!("{originator_address}:{originator_port}");
        let _task = self.splices.spawn(async move {
            let mut channel_stream = channel.into_stream();
            // The outbound dial happens only now, after acceptance.
            match TcpStream::connect(&target).await {
                Ok(mut target_stream) => {
                    tracing::debug!("Tunneling connection from {origin} to {target}");
                    match splice::splice(&mut channel_stream, &mut target_stream).await {
                        Ok((sent, received)) => tracing::debug!(
                            "Connection from {origin} closed: sent {sent}, received {received}"
                        ),
                        Err(source) => {
                            tracing::warn!("Stream error tunneling to {target}: {source}");
                        }
                    }
                }
                // Dropping the channel reports connection-refused to the
                // in-cluster caller; other mappings are unaffected.
                Err(source) => {
                    tracing::warn!(
                        "Failed to dial target {target} for connection from {origin}: {source}"
                    );
                }
            }
        });

        Ok(())
    }
}

/// An established SSH session and the remote listeners opened through it.
pub struct SshTunnel {
    handle: client::Handle<Handler>,
    opened_ports: Vec<u16>,
    splices: TaskTracker,
    closed: CancellationToken,
    continue_on_tunnel_error: bool,
}

impl SshTunnel {
    /// Dials the SSH daemon through the forwarded local port.
    ///
    /// Every failure is retried after one second, indefinitely: cluster-side
    /// restarts can legitimately take minutes, so only cancellation bounds
    /// the loop. The first few attempts stay silent because the daemon
    /// almost never accepts on the very first try.
    pub async fn dial(
        local_ssh_port: u16,
        mappings: &[Mapping],
        continue_on_tunnel_error: bool,
        shutdown: &CancellationToken,
    ) -> Result<Self, Error> {
        let targets = Arc::new(
            mappings
                .iter()
                .map(|mapping| (mapping.container_port, mapping.target_address()))
                .collect::<HashMap<_, _>>(),
        );
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..client::Config::default()
        });
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_ssh_port);

        tracing::debug!("Establishing SSH connection to {addr}...");
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let splices = TaskTracker::new();
            let closed = CancellationToken::new();
            let handler = Handler {
                targets: Arc::clone(&targets),
                splices: splices.clone(),
                closed: closed.clone(),
            };

            let connect = async {
                let mut handle = client::connect(Arc::clone(&config), addr, handler).await?;
                let auth_result = handle
                    .authenticate_password(
                        kubetnl_base::consts::SSH_USER,
                        kubetnl_base::consts::SSH_PASSWORD,
                    )
                    .await?;
                Ok::<_, russh::Error>((handle, auth_result.success()))
            };

            let failure = tokio::select! {
                () = shutdown.cancelled() => return Err(Error::Interrupted),
                result = connect => match result {
                    Ok((handle, true)) => {
                        tracing::debug!("SSH connection to {addr} established");
                        return Ok(Self {
                            handle,
                            opened_ports: Vec::new(),
                            splices,
                            closed,
                            continue_on_tunnel_error,
                        });
                    }
                    Ok((_, false)) => "authentication rejected".to_string(),
                    Err(source) => source.to_string(),
                },
            };

            if attempts > SILENT_DIAL_ATTEMPTS {
                tracing::debug!("Failed to dial ssh {addr}: {failure}. Retrying...");
            } else {
                tracing::trace!("Error dialing ssh {addr}: {failure}");
            }
            tokio::select! {
                () = shutdown.cancelled() => return Err(Error::Interrupted),
                () = tokio::time::sleep(DIAL_RETRY_INTERVAL) => {}
            }
        }
    }

    /// Requests one remote listener per mapping.
    ///
    /// A refused listener fails the whole tunnel unless
    /// `continue_on_tunnel_error` is set, in which case the mapping is
    /// logged as unavailable and the rest proceed. A tunnel with zero
    /// listeners is an error either way.
    pub async fn open_remote_forwards(&mut self, mappings: &[Mapping]) -> Result<(), Error> {
        for mapping in mappings {
            let port = mapping.container_port;
            let result = self
                .handle
                .tcpip_forward(REMOTE_BIND_ADDRESS, u32::from(port))
                .await
                .map_err(|source| Error::RemoteForwardRequest { port, source })
                .and_then(
                    |accepted| {
                        if accepted { Ok(()) } else { Err(Error::RemoteForwardRejected { port }) }
                    },
                );

            match result {
                Ok(()) => {
                    tracing::debug!(
                        "Tunneling from kube:{port} --> {}",
                        mapping.target_address()
                    );
                    self.opened_ports.push(port);
                }
                Err(source) if self.continue_on_tunnel_error => {
                    tracing::error!(
                        "Failed to listen on remote {REMOTE_BIND_ADDRESS}:{port}: {source}. \
                         No tunnel created for this mapping."
                    );
                }
                Err(source) => {
                    self.cancel_remote_forwards().await;
                    return Err(source);
                }
            }
        }

        snafu::ensure!(!self.opened_ports.is_empty(), error::NoRemoteForwardOpenSnafu);
        Ok(())
    }

    /// Resolves once the underlying SSH session has ended, for whatever
    /// reason. Used by the controller's post-ready failure policy.
    pub async fn session_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Closes the remote listeners, disconnects the session and waits for
    /// in-flight splices to finish. Errors are logged, never surfaced:
    /// teardown must run to completion.
    pub async fn close(mut self) {
        self.cancel_remote_forwards().await;
        if let Err(source) =
            self.handle.disconnect(Disconnect::ByApplication, "", "English").await
        {
            tracing::debug!("Failed to disconnect SSH session: {source}");
        }
        self.splices.close();
        // The disconnect unblocks every splice; the bound only covers a
        // transport that failed to notice it went away.
        if tokio::time::timeout(Duration::from_secs(5), self.splices.wait()).await.is_err() {
            tracing::debug!("Timed out waiting for in-flight connections to finish");
        }
    }

    async fn cancel_remote_forwards(&mut self) {
        for port in std::mem::take(&mut self.opened_ports) {
            if let Err(source) =
                self.handle.cancel_tcpip_forward(REMOTE_BIND_ADDRESS, u32::from(port)).await
            {
                tracing::debug!("Failed to cancel remote listener on port {port}: {source}");
            }
        }
    }
}

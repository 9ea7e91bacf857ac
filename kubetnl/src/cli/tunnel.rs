//! The `tunnel` command: expose a locally reachable endpoint as a Service
//! inside the cluster.

use clap::Args;
use sigfinn::{ExitStatus, LifecycleManager};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{Error, error},
    config::Config,
    graceful, net, port,
    tunnel::{Tunnel, TunnelSpec},
};

#[derive(Args, Clone)]
pub struct TunnelCommand {
    #[arg(
        short = 'n',
        long = "namespace",
        help = "Kubernetes namespace to create the tunnel in. Defaults to the current Kubernetes \
                context's namespace."
    )]
    pub namespace: Option<String>,

    #[arg(long = "image", help = "The container image that gets deployed to serve an SSH server.")]
    pub image: Option<String>,

    #[arg(
        long = "local-ssh-port",
        help = "Local TCP port that receives the pod-forwarded SSH stream. A free port is picked \
                when omitted."
    )]
    pub local_ssh_port: Option<u16>,

    #[arg(
        long = "continue-on-tunnel-error",
        help = "Keep the remaining port mappings and the session alive when one mapping fails."
    )]
    pub continue_on_tunnel_error: bool,

    #[arg(help = "Name of the tunnel. Also the name of the Service reachable inside the cluster.")]
    pub name: String,

    #[arg(
        required = true,
        num_args = 1..,
        value_name = "TARGET_ADDR:SERVICE_PORT",
        help = "Port mappings in the form [TARGET_ADDR:]TARGET_PORT:SERVICE_PORT[/PROTOCOL], \
                e.g. 8080:80 or 10.0.0.5:3306:3306."
    )]
    pub mappings: Vec<String>,
}

impl TunnelCommand {
    pub async fn run(self, kube_client: kube::Client, config: Config) -> Result<(), Error> {
        let Self { namespace, image, local_ssh_port, continue_on_tunnel_error, name, mappings } =
            self;

        let namespace = namespace
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| kube_client.default_namespace().to_string());
        let mappings = port::parse_mappings(&mappings)?;
        let remote_ssh_port = net::free_ssh_port_in_container(&mappings)?;
        let local_ssh_port = match local_ssh_port {
            Some(port) if port != 0 => port,
            _ => net::free_local_port()?,
        };

        let spec = TunnelSpec {
            name,
            namespace,
            image: image.unwrap_or(config.image),
            mappings,
            local_ssh_port,
            remote_ssh_port,
            continue_on_tunnel_error,
        };

        graceful::spawn_force_exit_watcher().context(error::CreateSignalStreamSnafu)?;

        let lifecycle_manager = LifecycleManager::<Error>::new();
        let _handle = lifecycle_manager.spawn("tunnel-session", move |shutdown_signal| {
            run_session(kube_client, spec, shutdown_signal)
        });

        if let Ok(Err(err)) = lifecycle_manager.serve().await {
            tracing::error!("{err}");
            Err(err)
        } else {
            Ok(())
        }
    }
}

/// Runs one tunnel session to completion under the lifecycle manager.
///
/// An operator interrupt is a success: the session tears itself down,
/// deletes its cluster objects and the process exits zero.
async fn run_session(
    kube_client: kube::Client,
    spec: TunnelSpec,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> ExitStatus<Error> {
    let shutdown = CancellationToken::new();
    let _signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal.await;
            shutdown.cancel();
        }
    });

    let service_address = format!("{}.{}.svc", spec.name, spec.namespace);
    let mut tunnel = Tunnel::new(kube_client, spec, shutdown);

    // Pre-ready failures have already cleaned up their cluster objects.
    match tunnel.run().await {
        Ok(()) => {}
        Err(crate::tunnel::Error::Interrupted) => return ExitStatus::Success,
        Err(source) => return ExitStatus::Error(Error::from(source)),
    }
    tunnel.ready().await;

    tracing::info!("Tunnel is ready: {service_address} now reaches the configured targets.");
    tracing::info!("Press Ctrl+C to stop.");
    let session_result = tunnel.wait().await;

    // Teardown and cluster cleanup always run, whatever ended the session.
    let stop_result = tunnel.stop().await;
    match session_result.and(stop_result) {
        Ok(()) => ExitStatus::Success,
        Err(source) => ExitStatus::Error(Error::from(source)),
    }
}

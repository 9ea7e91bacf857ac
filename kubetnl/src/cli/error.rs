use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Configuration { source: crate::config::Error },

    #[snafu(display("{source}"))]
    PortMapping { source: crate::port::Error },

    #[snafu(display("{source}"))]
    Net { source: crate::net::Error },

    #[snafu(display("{source}"))]
    Tunnel { source: crate::tunnel::Error },

    #[snafu(display("Failed to initialize Kubernetes client configuration, error: {source}"))]
    KubeConfig { source: kube::Error },

    #[snafu(display("Failed to create tokio runtime, error: {source}"))]
    InitializeTokioRuntime { source: std::io::Error },

    #[snafu(display("Failed to create signal stream, error: {source}"))]
    CreateSignalStream { source: std::io::Error },

    #[snafu(display(
        "Cleanup did not remove everything ({details}). Re-run \"kubetnl cleanup\" once the \
         cluster is reachable again.",
        details = failures.join("; ")
    ))]
    CleanupIncomplete { failures: Vec<String> },
}

impl From<crate::config::Error> for Error {
    fn from(source: crate::config::Error) -> Self { Self::Configuration { source } }
}

impl From<crate::port::Error> for Error {
    fn from(source: crate::port::Error) -> Self { Self::PortMapping { source } }
}

impl From<crate::net::Error> for Error {
    fn from(source: crate::net::Error) -> Self { Self::Net { source } }
}

impl From<crate::tunnel::Error> for Error {
    fn from(source: crate::tunnel::Error) -> Self { Self::Tunnel { source } }
}

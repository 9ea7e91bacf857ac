use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to create {kind} {name} in namespace {namespace}, error: {source}"))]
    CreateResource {
        kind: &'static str,
        name: String,
        namespace: String,
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },

    #[snafu(display("Failed to watch pod {name} in namespace {namespace}, error: {source}"))]
    WatchPod {
        name: String,
        namespace: String,
        #[snafu(source(from(kube::runtime::wait::Error, Box::new)))]
        source: Box<kube::runtime::wait::Error>,
    },

    #[snafu(display("Timed out after {seconds}s waiting for pod {name} to become ready"))]
    PodReadyTimeout { name: String, seconds: u64 },

    #[snafu(display("{source}"))]
    PortForward { source: crate::port_forwarder::Error },

    #[snafu(display("{source}"))]
    Ssh { source: crate::ssh::Error },

    /// The operator cancelled the session. Graceful outcome, suppressed at
    /// the top level; never caused by a system error.
    #[snafu(display("Interrupted"))]
    Interrupted,

    #[snafu(display("The SSH session ended unexpectedly"))]
    SshSessionClosed,

    #[snafu(display(
        "Cleanup left resources behind ({details}). Run \"kubetnl cleanup\" to delete any \
         leftover resources.",
        details = failures.join("; ")
    ))]
    Cleanup { failures: Vec<String> },
}

impl From<crate::port_forwarder::Error> for Error {
    fn from(source: crate::port_forwarder::Error) -> Self { Self::PortForward { source } }
}

impl From<crate::ssh::Error> for Error {
    fn from(source: crate::ssh::Error) -> Self {
        // Cancellation keeps its meaning across layer boundaries.
        match source {
            crate::ssh::Error::Interrupted => Self::Interrupted,
            source => Self::Ssh { source },
        }
    }
}

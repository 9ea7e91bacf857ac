use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The SSH dial was cancelled by the operator. Graceful outcome, not a
    /// failure; the dial loop itself retries every transport error.
    #[snafu(display("Interrupted while establishing SSH connection"))]
    Interrupted,

    #[snafu(display("Failed to request a remote listener on port {port}, error: {source}"))]
    RemoteForwardRequest { port: u16, source: russh::Error },

    #[snafu(display("The SSH server refused a remote listener on port {port}"))]
    RemoteForwardRejected { port: u16 },

    #[snafu(display("No remote listener could be opened, the tunnel carries no traffic"))]
    NoRemoteForwardOpen,
}

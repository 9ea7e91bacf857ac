//! kubetnl tunnels TCP connections from within a Kubernetes cluster to an
//! endpoint outside of the cluster, the functional inverse of
//! `kubectl port-forward`.

mod cli;
mod config;
mod graceful;
mod net;
mod port;
mod port_forwarder;
mod splice;
mod ssh;
mod tunnel;

/// Build-time information embedded via `shadow-rs`: version, commit hash and
/// build date, rendered by the CLI's long version output.
mod shadow {
    #![allow(clippy::needless_raw_string_hashes)]
    use shadow_rs::shadow;
    shadow!(build);

    pub use self::build::*;
}

use self::cli::Cli;

fn main() {
    match Cli::default().run() {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

//! Second-stage signal handling.
//!
//! The first interrupt is consumed by the lifecycle manager and starts the
//! graceful teardown: close the tunnels, delete the cluster objects, exit
//! zero. The watcher armed here covers the escalation path: another
//! interrupt while teardown is running, or a SIGTERM at any point, ends the
//! process immediately with the conventional fatal-signal exit code.

use tokio::signal::unix::{SignalKind, signal};

const SIGINT_EXIT_CODE: i32 = 130;
const SIGTERM_EXIT_CODE: i32 = 143;

/// Spawns the force-exit watcher. Must be called from within the runtime.
pub fn spawn_force_exit_watcher() -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let _task = tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => std::process::exit(SIGTERM_EXIT_CODE),
            _ = interrupt.recv() => {
                // Graceful shutdown is under way in the lifecycle manager.
                eprintln!("Shutting down gracefully. Interrupt again to force.");
            }
        }

        tokio::select! {
            _ = terminate.recv() => std::process::exit(SIGTERM_EXIT_CODE),
            _ = interrupt.recv() => std::process::exit(SIGINT_EXIT_CODE),
        }
    });

    Ok(())
}

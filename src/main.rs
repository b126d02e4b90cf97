use attendance_scanner::app::{self, Options, RunError};
use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tokio::sync::oneshot;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;
const EXIT_CREDENTIALS: i32 = 3;

/// Initialize logging to stderr. `RUST_LOG` overrides the default level.
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default_level = if verbose { "attendance_scanner=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl+C elsewhere).
fn shutdown_signal() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => tracing::info!("received SIGINT"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                    }
                }
                (Err(error), _) | (_, Err(error)) => {
                    tracing::warn!(%error, "cannot install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(%error, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("received Ctrl+C");
        }

        let _ = tx.send(());
    });

    rx
}

#[tokio::main]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let shutdown = shutdown_signal();
    let shutdown = async move {
        let _ = shutdown.await;
    };

    match app::run(options, shutdown).await {
        Ok(snapshot) => {
            tracing::info!(
                verified = snapshot.verify_ok,
                failed = snapshot.verify_err,
                dropped = snapshot.frames_dropped_queue_full,
                "scanner stopped"
            );
            std::process::exit(EXIT_SUCCESS);
        }
        Err(why @ RunError::Credentials(_)) => {
            eprintln!("error: {}", why);
            eprintln!(
                "hint: make sure the scanner key was copied exactly and the scanner is registered as active for this gym"
            );
            std::process::exit(EXIT_CREDENTIALS);
        }
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}

use clap::Parser;
use rapt_pill_mqtt::app::{self, Options};
use std::panic::{self, PanicHookInfo};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_directive = if verbose {
        "rapt_pill_mqtt=debug"
    } else {
        "rapt_pill_mqtt=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve on SIGINT. If the handler cannot be installed this never
/// resolves, so shutdown falls back to SIGTERM.
async fn wait_for_ctrl_c(ctrl_c: impl Future<Output = std::io::Result<()>>) {
    match ctrl_c.await {
        Ok(()) => info!("received SIGINT"),
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = wait_for_ctrl_c(ctrl_c) => {}
                        _ = sigterm.recv() => info!("received SIGTERM"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    wait_for_ctrl_c(ctrl_c).await;
                }
            }
        }

        #[cfg(not(unix))]
        wait_for_ctrl_c(ctrl_c).await;

        token.cancel();
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match app::run(options, cancel).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!(error = %why, "fatal error");
            std::process::exit(EXIT_ERROR);
        }
    }
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::fs::read_to_string;
use tokio_util::sync::CancellationToken;

use ceph2zfs::config::Config;
use ceph2zfs::daemon::{run_scheduled, shutdown_signal};
use ceph2zfs::job::GlobalControl;

/// Misuse of the CLI (missing config, `-w` without `-d`) exits with this
/// code rather than a panic or a generic error (§6).
const EXIT_CLI_MISUSE: u8 = 50;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = concat!("v", env!("CARGO_PKG_VERSION"), "+", env!("GIT_SHA")))]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short = 'c', default_value = "/etc/ceph-to-zfs/config.toml")]
    config: String,

    /// Run as a scheduled daemon instead of a single one-shot pass.
    #[arg(long, short = 'd')]
    daemon: bool,

    /// Enable the HTTP status reporter. Requires `-d`.
    #[arg(long, short = 'w')]
    web: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if args.web && !args.daemon {
        tracing::error!("-w/--web requires -d/--daemon");
        return ExitCode::from(EXIT_CLI_MISUSE);
    }

    let Ok(file) = read_to_string(&args.config).await else {
        tracing::error!(path = %args.config, "configuration file not found");
        return ExitCode::from(EXIT_CLI_MISUSE);
    };

    let config = match Config::try_from(&file) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid configuration: {err}");
            return ExitCode::from(EXIT_CLI_MISUSE);
        }
    };

    let control = match GlobalControl::from_config(&config) {
        Ok(control) => Arc::new(control),
        Err(err) => {
            tracing::error!("invalid configuration: {err}");
            return ExitCode::from(EXIT_CLI_MISUSE);
        }
    };

    if !args.daemon {
        control.run_all().await;
        return ExitCode::SUCCESS;
    }

    let Some(schedule) = config.daemon.cron_schedule() else {
        tracing::error!("daemon mode (-d) requires [daemon] schedule in the configuration");
        return ExitCode::from(EXIT_CLI_MISUSE);
    };
    let schedule = match schedule {
        Ok(schedule) => schedule,
        Err(err) => {
            tracing::error!("invalid daemon schedule: {err}");
            return ExitCode::from(EXIT_CLI_MISUSE);
        }
    };

    let cancel_token = CancellationToken::new();
    let signal_cancel = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    if args.web {
        let web_control = Arc::clone(&control);
        let web_cancel = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = ceph2zfs::http::serve(web_control) => {
                    if let Err(err) = result {
                        tracing::error!("status reporter stopped: {err}");
                    }
                }
                _ = web_cancel.cancelled() => {}
            }
        });
    }

    run_scheduled(control, schedule, cancel_token).await;

    ExitCode::SUCCESS
}

//! Scheduled daemon loop (distilled spec §9, "Scheduled daemon loop"):
//! on a cron-driven cadence, invoke `run_all()` while respecting
//! `GlobalControl`'s "one run at a time" guard. Shaped after the
//! teacher's `run_scheduled_backups`/`shutdown_signal` select loop.

use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::job::GlobalControl;

/// Run `control.run_all()` once per schedule tick until cancelled.
pub async fn run_scheduled(
    control: Arc<GlobalControl>,
    schedule: Schedule,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::error!("cron schedule has no upcoming run; stopping daemon loop");
            break;
        };
        let Ok(duration) = (next - now).to_std() else {
            continue;
        };

        select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel_token.cancelled() => break,
        }
        if cancel_token.is_cancelled() {
            break;
        }

        if !control.run_all().await {
            tracing::warn!("scheduled run skipped: a run is already in progress");
        }
    }
}

/// Resolve on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    select! {
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT");
        }
    }
}

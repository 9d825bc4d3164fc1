use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::LedgerResult;

use super::service::LedgerService;

/// Actor recorded on EXPIRE entries written by the sweep.
pub const REAPER_ACTOR: &str = "system:expiry-reaper";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub credits_expired: i64,
}

/// key: expiry-reaper -> one pass over lapsed balances
/// Candidates are re-checked under the pair lock by `LedgerService::expire`,
/// so a record refreshed or already zeroed since the scan is skipped.
pub async fn sweep(service: &LedgerService, now: DateTime<Utc>) -> LedgerResult<SweepReport> {
    let candidates = service.expiry_candidates(now).await?;
    let mut report = SweepReport {
        scanned: candidates.len(),
        ..Default::default()
    };

    for key in candidates {
        match service
            .expire(&key, now, Some(REAPER_ACTOR.to_string()))
            .await
        {
            Ok(Some(entry)) => {
                report.expired += 1;
                report.credits_expired -= entry.amount;
            }
            Ok(None) => report.skipped += 1,
            Err(err) => {
                report.failed += 1;
                warn!(
                    ?err,
                    tenant_id = %key.tenant_id,
                    resource_type = %key.resource_type,
                    "failed to expire balance"
                );
            }
        }
    }

    Ok(report)
}

/// Running reaper task; dropping the handle leaves the task running.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(?err, "expiry reaper task ended abnormally");
        }
    }
}

/// key: expiry-reaper-scheduler -> periodic sweep
pub fn spawn(service: LedgerService, interval: Duration) -> ReaperHandle {
    let (shutdown, mut stop) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep(&service, Utc::now()).await {
                        Ok(report) if report.expired > 0 || report.failed > 0 => {
                            info!(
                                scanned = report.scanned,
                                expired = report.expired,
                                skipped = report.skipped,
                                failed = report.failed,
                                credits_expired = report.credits_expired,
                                "expiry sweep completed"
                            );
                        }
                        Ok(report) => debug!(scanned = report.scanned, "expiry sweep found nothing to expire"),
                        Err(err) => warn!(?err, "expiry sweep failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("expiry reaper stopping");
                        break;
                    }
                }
            }
        }
    });

    ReaperHandle { shutdown, task }
}

//! Progress reconciler
//!
//! Periodically folds live engine counters back into the registry and writes
//! them to the database in one transaction per sweep.

use chrono::Utc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, ProgressUpdate, TransfersDb};
use crate::engine_adapter::{HandleLookup, TorrentManager};
use crate::types::TransferStatus;
use crate::utils::format_bytes;

const VANISHED_MESSAGE: &str = "transfer is no longer known to the protocol engine";

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active transfers looked at
    pub considered: usize,
    pub completed: usize,
    pub errored: usize,
    /// Rows written, missing from the database, or failed
    pub written: usize,
    pub missing: usize,
    pub failed: usize,
}

pub struct ProgressReconciler {
    manager: TorrentManager,
    db: Database,
}

impl ProgressReconciler {
    pub fn new(manager: TorrentManager, db: Database) -> Self {
        Self { manager, db }
    }

    /// Run a single sweep over every active transfer
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut updates = Vec::new();

        for sample in self.manager.progress_snapshot() {
            if !sample.tracked.is_active() {
                continue;
            }
            report.considered += 1;
            let transfer = &sample.transfer;

            match sample.lookup {
                HandleLookup::Failed => continue,
                HandleLookup::Missing => {
                    if self.manager.apply_transition(
                        transfer,
                        sample.tracked,
                        TransferStatus::Error,
                        Some(VANISHED_MESSAGE),
                    ) {
                        log::error!(
                            "Transfer {} ({}) vanished from the engine",
                            transfer.descriptor.name,
                            transfer.id
                        );
                        report.errored += 1;
                        updates.push(ProgressUpdate {
                            id: transfer.id,
                            status: TransferStatus::Error,
                            bytes_downloaded: transfer.bytes_downloaded,
                            bytes_uploaded: transfer.bytes_uploaded,
                            error_message: Some(VANISHED_MESSAGE.to_string()),
                            completed_at: None,
                        });
                    }
                    continue;
                }
                HandleLookup::Found(_) => {}
            }

            let finished = sample.tracked == TransferStatus::Downloading && transfer.is_complete();
            let next = if finished {
                transfer.status
            } else {
                sample.tracked
            };

            if !self.manager.apply_transition(transfer, sample.tracked, next, None) {
                // Stopped or removed since the snapshot was taken.
                continue;
            }

            let completed_at = if finished {
                log::info!(
                    "Transfer {} completed ({})",
                    transfer.descriptor.name,
                    format_bytes(transfer.descriptor.total_length)
                );
                report.completed += 1;
                Some(Utc::now())
            } else {
                None
            };

            updates.push(ProgressUpdate {
                id: transfer.id,
                status: next,
                bytes_downloaded: transfer.bytes_downloaded,
                bytes_uploaded: transfer.bytes_uploaded,
                error_message: None,
                completed_at,
            });
        }

        if updates.is_empty() {
            return report;
        }

        match TransfersDb::apply_sweep(&self.db, &updates) {
            Ok(outcome) => {
                report.written = outcome.written;
                report.missing = outcome.missing;
                report.failed = outcome.failed;
            }
            Err(e) => {
                log::error!("Failed to persist progress sweep: {}", e);
                report.failed = updates.len();
            }
        }

        log::debug!("Reconciled {} transfers: {:?}", report.considered, report);
        report
    }

    /// Sweep on every tick until the token is cancelled
    pub async fn run(&self, token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        log::info!("Progress reconciler stopped");
    }
}

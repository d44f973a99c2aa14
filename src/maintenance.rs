//! Periodic shard maintenance: idle close, condense, retention.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{select, tick};
use tracing::{debug, info};

use crate::config::ConfigProvider;
use crate::error::Result;
use crate::shard::ShardManager;
use crate::worker::{StopSignal, Worker};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub condensed: u64,
    pub deleted: u64,
}

/// One maintenance pass over every registered shard.
pub fn run_once(manager: &ShardManager) -> MaintenanceReport {
    let started = Instant::now();
    manager.cleanup();
    let report = MaintenanceReport {
        condensed: manager.condense_all(),
        deleted: manager.delete_old_data_all(),
    };
    if report.condensed > 0 || report.deleted > 0 {
        info!(
            condensed = report.condensed,
            deleted = report.deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "maintenance pass"
        );
    } else {
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "maintenance pass, nothing to do");
    }
    report
}

/// Run `run_once` every `maintenance_interval` until stopped.
///
/// The interval is read at start; a changed interval applies after restart.
pub fn start(config: ConfigProvider, manager: Arc<ShardManager>) -> Result<Worker> {
    let interval = config().maintenance_interval();
    Worker::spawn("planb-maintenance", move |stop: StopSignal| {
        let ticker = tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    run_once(&manager);
                }
                recv(stop.receiver()) -> _ => break,
            }
        }
    })
}

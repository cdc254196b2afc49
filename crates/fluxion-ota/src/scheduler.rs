// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Periodic and on-demand update runs

use crate::client::OtaClient;
use crate::error::{OtaError, Result};
use crate::orchestrator::UpdateOutcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Countdown granularity; the check interval is counted in these ticks
pub const TICK_PERIOD: Duration = Duration::from_secs(60);

/// Runs `check_and_update()` on a countdown or on request, one run at a time
#[derive(Debug, Clone)]
pub struct Scheduler {
    client: OtaClient,
    running: Arc<AtomicBool>,
    tick_period: Duration,
}

/// Clears the running flag however the run ends
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    pub fn new(client: OtaClient) -> Self {
        Self {
            client,
            running: Arc::new(AtomicBool::new(false)),
            tick_period: TICK_PERIOD,
        }
    }

    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn one `check_and_update()` unless a run is already in flight
    pub fn trigger(&self) -> Result<JoinHandle<Result<UpdateOutcome>>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(OtaError::AlreadyRunning);
        }
        let flag = RunningFlag(Arc::clone(&self.running));
        let client = self.client.clone();

        Ok(tokio::spawn(async move {
            let _flag = flag;
            let outcome = client.check_and_update().await;
            match outcome {
                Ok(ref done) => info!("Update run finished: {done:?}"),
                Err(OtaError::NoValidAsset) => info!("Update run found no usable release"),
                Err(ref e) => error!("Update run failed: {e}"),
            }
            outcome
        }))
    }

    /// Run once right away
    pub fn start_once(&self) -> Result<JoinHandle<Result<UpdateOutcome>>> {
        self.trigger()
    }

    /// Count down the check interval and trigger a run each time it expires
    ///
    /// Ticks count even while a run holds the client guard.
    pub fn start_periodic(&self) -> PeriodicHandle {
        self.client.reset_countdown();

        let stop = Arc::new(Notify::new());
        let scheduler = self.clone();
        let stop_signal = Arc::clone(&stop);

        let task = tokio::spawn(async move {
            let period = scheduler.tick_period;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = stop_signal.notified() => {
                        debug!("Periodic scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => scheduler.on_tick(),
                }
            }
        });

        info!("Periodic update checks started");
        PeriodicHandle { stop, task }
    }

    fn on_tick(&self) {
        if !self.client.tick() {
            return;
        }
        match self.trigger() {
            Ok(_) => debug!("Countdown expired, update run started"),
            Err(e) => debug!("Countdown expired: {e}"),
        }
    }
}

/// Handle to the periodic countdown task
#[derive(Debug)]
pub struct PeriodicHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Stop the countdown; a run already in flight is left to finish
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            error!("Periodic scheduler task failed: {e}");
        }
    }
}

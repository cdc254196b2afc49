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

//! Public OTA client handle
//!
//! All state sits behind one guard. Entry points wait at most
//! `GUARD_TIMEOUT` for it and fail with `OtaError::GuardTimeout` instead of
//! queueing behind a long update.

use crate::config::{Credentials, OtaConfig};
use crate::error::{OtaError, Result};
use crate::event::{EventBus, EventHub, EventSink, OtaEvent};
use crate::flash::FlashDevice;
use crate::orchestrator::{
    self, CheckOutcome, Installed, Phase, REBOOT_DELAY, STORAGE_SETTLE_DELAY, Services,
    UpdateOutcome,
};
use crate::restart::{Restarter, restarter_for};
use crate::state::{ClientState, ClientStatus, Countdown};
use crate::transport::{HttpTransport, Transport};
use crate::version::Version;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{info, warn};

/// Longest wait for the client guard
pub const GUARD_TIMEOUT: Duration = Duration::from_secs(1);

struct Shared {
    state: Mutex<ClientState>,
    services: Services,
    /// Outside the guard so ticks count while an update runs
    countdown: Arc<Countdown>,
    guard_timeout: Duration,
}

#[derive(Clone)]
pub struct OtaClient {
    inner: Arc<Shared>,
}

pub struct OtaClientBuilder {
    config: OtaConfig,
    flash: Box<dyn FlashDevice>,
    transport: Option<Arc<dyn Transport>>,
    restarter: Option<Arc<dyn Restarter>>,
    sinks: Vec<Arc<dyn EventSink>>,
    guard_timeout: Duration,
    reboot_delay: Duration,
    settle_delay: Duration,
}

impl OtaClientBuilder {
    /// Replace the default `HttpTransport`
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the restarter chosen by `restart_mode`
    pub fn restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    /// Add a sink that receives every event next to the broadcast bus
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn guard_timeout(mut self, timeout: Duration) -> Self {
        self.guard_timeout = timeout;
        self
    }

    pub fn reboot_delay(mut self, delay: Duration) -> Self {
        self.reboot_delay = delay;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn build(self) -> Result<OtaClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };
        let restarter = self
            .restarter
            .unwrap_or_else(|| restarter_for(self.config.restart_mode));
        let state = ClientState::new(self.config, self.flash)?;
        let countdown = Arc::clone(&state.countdown);

        Ok(OtaClient {
            inner: Arc::new(Shared {
                state: Mutex::new(state),
                services: Services {
                    transport,
                    events: EventHub::new(EventBus::new(), self.sinks),
                    restarter,
                    reboot_delay: self.reboot_delay,
                    settle_delay: self.settle_delay,
                },
                countdown,
                guard_timeout: self.guard_timeout,
            }),
        })
    }
}

impl fmt::Debug for OtaClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaClientBuilder")
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .field("guard_timeout", &self.guard_timeout)
            .field("reboot_delay", &self.reboot_delay)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl OtaClient {
    pub fn builder(config: OtaConfig, flash: Box<dyn FlashDevice>) -> OtaClientBuilder {
        OtaClientBuilder {
            config,
            flash,
            transport: None,
            restarter: None,
            sinks: Vec::new(),
            guard_timeout: GUARD_TIMEOUT,
            reboot_delay: REBOOT_DELAY,
            settle_delay: STORAGE_SETTLE_DELAY,
        }
    }

    /// Client with the HTTP transport and the configured restarter
    pub fn new(config: OtaConfig, flash: Box<dyn FlashDevice>) -> Result<Self> {
        Self::builder(config, flash).build()
    }

    async fn lock(&self) -> Result<MutexGuard<'_, ClientState>> {
        tokio::time::timeout(self.inner.guard_timeout, self.inner.state.lock())
            .await
            .map_err(|_| {
                warn!("Client is busy, gave up after {:?}", self.inner.guard_timeout);
                OtaError::GuardTimeout
            })
    }

    /// Guard for an operation whose failure is broadcast
    async fn lock_for_run(&self) -> Result<MutexGuard<'_, ClientState>> {
        self.lock().await.inspect_err(|e| {
            self.inner.services.events.notify(OtaEvent::UpdateFailed {
                error: e.to_string(),
            });
        })
    }

    pub async fn set_auth(
        &self,
        username: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<()> {
        let credentials = Credentials::new(username, token);
        self.lock().await?.set_credentials(Some(credentials));
        Ok(())
    }

    pub async fn clear_auth(&self) -> Result<()> {
        self.lock().await?.set_credentials(None);
        Ok(())
    }

    /// Fetch the latest release and compare it with the running version
    pub async fn check(&self) -> Result<CheckOutcome> {
        let mut state = self.lock_for_run().await?;
        orchestrator::check_locked(&mut state, &self.inner.services).await
    }

    /// Install the release found by the last `check()`
    pub async fn update(&self) -> Result<UpdateOutcome> {
        let installed = {
            let mut state = self.lock_for_run().await?;
            orchestrator::install_locked(&mut state, &self.inner.services).await?
        };
        self.finish(installed).await
    }

    /// `check()` then `update()` without releasing the guard in between
    pub async fn check_and_update(&self) -> Result<UpdateOutcome> {
        let installed = {
            let mut state = self.lock_for_run().await?;
            orchestrator::check_and_update_locked(&mut state, &self.inner.services).await?
        };
        self.finish(installed).await
    }

    /// Install only the storage image of the last resolved release
    pub async fn storage_update(&self) -> Result<()> {
        let mut state = self.lock().await.inspect_err(|e| {
            self.inner
                .services
                .events
                .notify(OtaEvent::StorageUpdateFailed {
                    error: e.to_string(),
                });
        })?;
        orchestrator::storage_locked(&mut state, &self.inner.services).await
    }

    async fn finish(&self, installed: Installed) -> Result<UpdateOutcome> {
        match installed {
            Installed::UpToDate => Ok(UpdateOutcome::UpToDate),
            Installed::PendingReboot => orchestrator::restart(&self.inner.services).await,
        }
    }

    pub async fn current_version(&self) -> Result<Version> {
        Ok(self.lock().await?.current.clone())
    }

    /// Version of the last successfully resolved release
    pub async fn latest_version(&self) -> Result<Option<Version>> {
        Ok(self.lock().await?.latest.clone())
    }

    pub async fn status(&self) -> Result<ClientStatus> {
        Ok(self.lock().await?.status())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OtaEvent> {
        self.inner.services.events.bus().subscribe()
    }

    pub async fn reconfigure(&self, config: OtaConfig) -> Result<()> {
        self.lock().await?.reconfigure(config)?;
        info!("Client reconfigured");
        Ok(())
    }

    /// Wipe credentials; the client stays usable for unauthenticated calls
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.lock().await?;
        state.set_credentials(None);
        state.phase = Phase::Idle;
        info!("Client shut down");
        Ok(())
    }

    pub(crate) fn reset_countdown(&self) {
        self.inner.countdown.reset();
    }

    /// One scheduler tick; true when a check is due
    pub(crate) fn tick(&self) -> bool {
        self.inner.countdown.tick()
    }
}

impl fmt::Debug for OtaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaClient")
            .field("guard_timeout", &self.inner.guard_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlashConfig;
    use crate::flash::FileFlash;
    use tempfile::TempDir;

    const TOKEN: &str = "ghp_0123456789abcdef";

    fn builder(dir: &TempDir) -> OtaClientBuilder {
        let mut config = OtaConfig::new("SolarE-cz", "fluxion-fw", "app*.bin");
        config.username = Some("bot".to_owned());
        config.token = Some(TOKEN.to_owned());
        let flash = FileFlash::new(&FlashConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        OtaClient::builder(config, Box::new(flash))
    }

    #[tokio::test]
    async fn test_token_never_printed() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir);
        assert!(!format!("{builder:?}").contains(TOKEN));

        let client = builder.build().unwrap();
        let state = client.lock().await.unwrap();
        assert_eq!(state.credentials.as_ref().map(Credentials::token), Some(TOKEN));
        assert!(!format!("{state:?}").contains(TOKEN));
    }

    #[tokio::test]
    async fn test_ticks_count_while_guard_is_held() {
        let dir = TempDir::new().unwrap();
        let mut config = OtaConfig::new("SolarE-cz", "fluxion-fw", "app*.bin");
        config.check_interval_minutes = 3;
        let flash = FileFlash::new(&FlashConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let client = OtaClient::new(config, Box::new(flash)).unwrap();

        let busy = client.lock().await.unwrap();
        let fired: Vec<bool> = (0..3).map(|_| client.tick()).collect();
        assert_eq!(fired, [false, false, true]);
        client.tick();
        drop(busy);

        assert_eq!(client.status().await.unwrap().countdown, 2);
        client.reset_countdown();
        assert_eq!(client.status().await.unwrap().countdown, 3);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_secret() {
        let dir = TempDir::new().unwrap();
        let client = builder(&dir).build().unwrap();
        client.shutdown().await.unwrap();

        let state = client.lock().await.unwrap();
        assert!(state.credentials.is_none());
        assert!(state.config.token.is_none());
        assert_eq!(state.phase, Phase::Idle);
    }
}

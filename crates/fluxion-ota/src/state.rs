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

//! Mutable client state, only ever touched while holding the client guard

use crate::config::{Credentials, OtaConfig};
use crate::error::Result;
use crate::flash::FlashDevice;
use crate::image::AppDescriptor;
use crate::orchestrator::Phase;
use crate::resolver::{AssetResolver, ResolvedRelease};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

pub struct ClientState {
    pub(crate) config: OtaConfig,
    pub(crate) credentials: Option<Credentials>,

    /// Descriptor of the running image, read once at init
    pub(crate) running: AppDescriptor,
    pub(crate) current: Version,
    pub(crate) latest: Option<Version>,

    pub(crate) resolver: AssetResolver,

    /// Shared with the scheduler, which ticks it without taking the guard
    pub(crate) countdown: Arc<Countdown>,
    pub(crate) last_check_at: Option<DateTime<Utc>>,

    /// Phase the most recent operation ended in
    pub(crate) phase: Phase,

    pub(crate) flash: Box<dyn FlashDevice>,
}

/// Point-in-time view of the client for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub current: Version,
    pub latest: Option<Version>,
    pub release: ResolvedRelease,
    pub last_check_at: Option<DateTime<Utc>>,
    pub countdown: u32,
    pub phase: Phase,
}

impl ClientState {
    pub fn new(mut config: OtaConfig, flash: Box<dyn FlashDevice>) -> Result<Self> {
        config.validate()?;

        let running = flash.running_app()?;
        let current = Version::parse(&running.version)?;
        info!(
            "Running image {} version {current}",
            if running.project_name.is_empty() {
                "<unknown>"
            } else {
                running.project_name.as_str()
            }
        );

        Ok(Self {
            credentials: config.take_credentials(),
            resolver: resolver_for(&config),
            countdown: Arc::new(Countdown::new(config.check_interval_minutes)),
            config,
            running,
            current,
            latest: None,
            last_check_at: None,
            phase: Phase::Idle,
            flash,
        })
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            current: self.current.clone(),
            latest: self.latest.clone(),
            release: self.resolver.release().clone(),
            last_check_at: self.last_check_at,
            countdown: self.countdown.remaining(),
            phase: self.phase,
        }
    }

    pub fn release(&self) -> &ResolvedRelease {
        self.resolver.release()
    }

    /// Empty resolver for the current patterns
    pub(crate) fn fresh_resolver(&self) -> AssetResolver {
        resolver_for(&self.config)
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        // The replaced value wipes itself on drop
        self.credentials = credentials;
    }

    /// Swap in a new configuration; resolution results are discarded
    pub fn reconfigure(&mut self, mut config: OtaConfig) -> Result<()> {
        config.validate()?;
        if let Some(credentials) = config.take_credentials() {
            self.credentials = Some(credentials);
        }
        self.resolver = resolver_for(&config);
        self.latest = None;
        self.countdown.set_interval(config.check_interval_minutes);
        self.config = config;
        Ok(())
    }

}

/// Scheduler ticks left until the next automatic check
#[derive(Debug)]
pub struct Countdown {
    remaining: AtomicU32,
    interval: AtomicU32,
}

impl Countdown {
    pub fn new(interval: u32) -> Self {
        Self {
            remaining: AtomicU32::new(interval),
            interval: AtomicU32::new(interval),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.remaining
            .store(self.interval.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn set_interval(&self, interval: u32) {
        self.interval.store(interval, Ordering::Release);
        self.reset();
    }

    /// Count one tick down; true when a check is due, the countdown restarts
    pub fn tick(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(1))
            })
            .unwrap_or_else(|r| r);
        if previous <= 1 {
            self.reset();
            return true;
        }
        false
    }
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientState")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("current", &self.current)
            .field("latest", &self.latest)
            .field("countdown", &self.countdown.remaining())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

fn resolver_for(config: &OtaConfig) -> AssetResolver {
    AssetResolver::new(
        config.firmware_name_pattern.clone(),
        config.storage_name_pattern.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlashConfig;
    use crate::flash::FileFlash;
    use tempfile::TempDir;

    fn state(dir: &TempDir, interval: u32) -> ClientState {
        let mut config = OtaConfig::new("SolarE-cz", "fluxion-fw", "app*.bin");
        config.check_interval_minutes = interval;
        config.username = Some("bot".to_owned());
        config.token = Some("secret".to_owned());
        let flash = FileFlash::new(&FlashConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        ClientState::new(config, Box::new(flash)).unwrap()
    }

    #[test]
    fn test_new_reads_running_version() {
        let dir = TempDir::new().unwrap();
        let image = AppDescriptor::new("fw", "1.4.0").encode_image(b"x", false);
        std::fs::write(dir.path().join("app.bin"), image).unwrap();

        let state = state(&dir, 60);
        assert_eq!(state.current, Version::new(1, 4, 0));
        assert_eq!(state.running.project_name, "fw");
        assert!(state.credentials.is_some());
        // The token only lives in the credentials
        assert!(state.config.token.is_none());
        assert!(!format!("{state:?}").contains("secret"));
        assert_eq!(state.status().phase, Phase::Idle);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let flash = FileFlash::new(&FlashConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        assert!(ClientState::new(OtaConfig::default(), Box::new(flash)).is_err());
    }

    #[test]
    fn test_tick_fires_every_interval() {
        let countdown = Countdown::new(3);
        let fired: Vec<bool> = (0..6).map(|_| countdown.tick()).collect();
        assert_eq!(fired, [false, false, true, false, false, true]);
        assert_eq!(countdown.remaining(), 3);

        countdown.tick();
        countdown.set_interval(1);
        assert_eq!(countdown.remaining(), 1);
        assert!(countdown.tick());
        assert!(countdown.tick());
    }

    #[test]
    fn test_reconfigure_clears_resolution() {
        let dir = TempDir::new().unwrap();
        let mut state = state(&dir, 60);
        state.latest = Some(Version::new(2, 0, 0));
        state.countdown.tick();
        assert_eq!(state.status().countdown, 59);

        let config = OtaConfig::new("SolarE-cz", "other", "fw-*.bin");
        state.reconfigure(config).unwrap();
        assert!(state.latest.is_none());
        assert_eq!(state.status().countdown, 60);
        assert_eq!(state.config.repo, "other");
        // Credentials survive a config without any
        assert!(state.credentials.is_some());

        assert!(state.reconfigure(OtaConfig::default()).is_err());
        assert_eq!(state.config.repo, "other");
    }
}

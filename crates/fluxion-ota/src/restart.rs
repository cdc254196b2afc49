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

//! Restarting into a freshly installed image

use crate::config::RestartMode;
use crate::error::{OtaError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code the process uses to tell its supervisor an update is installed
pub const EXIT_CODE_UPDATED: i32 = 0;

pub trait Restarter: Send + Sync {
    /// Restart the device; implementations normally do not return on success
    fn restart(&self) -> Result<()>;
}

/// Reboots the machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRestarter;

impl Restarter for SystemRestarter {
    fn restart(&self) -> Result<()> {
        info!("Rebooting");
        nix::unistd::sync();
        match nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(e) => {
                warn!("Reboot failed: {e}");
                Err(OtaError::Flash(format!("reboot failed: {e}")))
            }
        }
    }
}

/// Exits the process and leaves the restart to a supervisor
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitRestarter;

impl Restarter for ExitRestarter {
    fn restart(&self) -> Result<()> {
        info!("Exiting for supervisor restart");
        std::process::exit(EXIT_CODE_UPDATED);
    }
}

pub fn restarter_for(mode: RestartMode) -> Arc<dyn Restarter> {
    match mode {
        RestartMode::Reboot => Arc::new(SystemRestarter),
        RestartMode::Exit => Arc::new(ExitRestarter),
    }
}

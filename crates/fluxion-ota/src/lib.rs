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

//! FluxION OTA - Over-the-air firmware updates from GitHub Releases
//!
//! Resolves the latest release document into a firmware asset (and an
//! optional storage asset) while streaming it, gates on the version, then
//! downloads, validates and flashes the image and restarts the device.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod flash;
pub mod image;
pub mod manifest;
pub mod orchestrator;
pub mod pattern;
pub mod resolver;
pub mod restart;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod version;

pub use client::{GUARD_TIMEOUT, OtaClient, OtaClientBuilder};
pub use config::{Credentials, OtaConfig};
pub use error::{OtaError, Result};
pub use event::{EventBus, EventSink, OtaEvent};
pub use flash::{FileFlash, FlashDevice, PartitionDigest, PartitionInfo};
pub use image::AppDescriptor;
pub use orchestrator::{CheckOutcome, Phase, UpdateOutcome};
pub use resolver::{AssetResolver, ReleaseAsset, ResolvedRelease};
pub use restart::Restarter;
pub use scheduler::{PeriodicHandle, Scheduler};
pub use state::ClientStatus;
pub use transport::{HttpTransport, Transport};
pub use version::{Version, compare, is_newer};

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

//! Update orchestration
//!
//! Every function taking `&mut ClientState` runs with the client guard held.
//! A run moves through:
//!
//! ```text
//! Idle -> Checking -> NoAssetFound | AssetResolved
//!      -> Gating -> UpToDate | Downloading -> Validating -> Flashing
//!      -> Finalizing [-> StorageDownloading -> StorageFlashing] -> Rebooting
//! ```
//!
//! and ends in `Failed` on any error. Failures are returned to the caller and
//! posted as events; nothing is retried here.

use crate::config::Credentials;
use crate::error::{OtaError, Result};
use crate::event::{EventHub, OtaEvent};
use crate::image::{AppDescriptor, IMAGE_HEADER_LEN, validate_image};
use crate::manifest::resolve_stream;
use crate::resolver::ReleaseAsset;
use crate::restart::Restarter;
use crate::state::ClientState;
use crate::transport::{
    ACCEPT_OCTET_STREAM, ACCEPT_RELEASE_JSON, ByteStream, FetchRequest, Fetched, Transport,
};
use crate::version::{Version, is_newer};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between announcing a reboot and performing it
pub const REBOOT_DELAY: Duration = Duration::from_secs(1);

/// Pause after `StorageUpdateStarted` so listeners can release the partition
pub const STORAGE_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Progress is reported in steps of this many percent
const PROGRESS_STEP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Checking,
    NoAssetFound,
    AssetResolved,
    Gating,
    UpToDate,
    Downloading,
    Validating,
    Flashing,
    Finalizing,
    StorageDownloading,
    StorageFlashing,
    Rebooting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate,
    UpdateAvailable(Version),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    /// The restarter returned instead of taking the process down
    Restarting,
}

/// Result of the locked part of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Installed {
    UpToDate,
    PendingReboot,
}

/// Collaborators shared by every run
pub(crate) struct Services {
    pub transport: Arc<dyn Transport>,
    pub events: EventHub,
    pub restarter: Arc<dyn Restarter>,
    pub reboot_delay: Duration,
    pub settle_delay: Duration,
}

/// Emits a percentage only when it changes and lands on a 5 % step
///
/// The last reported value starts at 0, so 0 % is never emitted and a
/// transfer produces at most 20 reports.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    total: Option<u64>,
    last: u8,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>) -> Self {
        Self { total, last: 0 }
    }

    #[expect(clippy::integer_division)]
    pub fn advance(&mut self, written: u64) -> Option<u8> {
        let total = self.total.filter(|&t| t > 0)?;
        let percent = (u128::from(written) * 100 / u128::from(total)).min(100);
        let percent = u8::try_from(percent).unwrap_or(100);
        if percent == self.last || percent % PROGRESS_STEP != 0 {
            return None;
        }
        self.last = percent;
        Some(percent)
    }
}

/// Per-operation context, dropped when the operation returns
#[derive(Debug)]
pub struct OrchestratorRun {
    phase: Phase,
    progress: ProgressTracker,
    written: u64,
    total: Option<u64>,
    slot_open: bool,
}

impl OrchestratorRun {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            progress: ProgressTracker::new(None),
            written: 0,
            total: None,
            slot_open: false,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Phase {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }

    /// `declared` is the advertised length, `basis` what progress is relative to
    fn start_transfer(&mut self, declared: Option<u64>, basis: Option<u64>) {
        self.written = 0;
        self.total = declared;
        self.progress = ProgressTracker::new(basis);
    }

    /// Account for `len` more bytes before they are written
    fn record(&mut self, len: usize) -> Result<Option<u8>> {
        let written = self.written + len as u64;
        if let Some(total) = self.total
            && written > total
        {
            return Err(OtaError::Transport(format!(
                "received more than the declared {total} bytes"
            )));
        }
        self.written = written;
        Ok(self.progress.advance(written))
    }

    fn ensure_complete(&self) -> Result<()> {
        match self.total {
            Some(expected) if self.written < expected => Err(OtaError::IncompleteTransfer {
                received: self.written,
                expected,
            }),
            Some(_) | None => Ok(()),
        }
    }
}

/// Log `e` and broadcast it as `UpdateFailed`
fn fail(events: &EventHub, e: OtaError) -> OtaError {
    error!("Update failed: {e}");
    events.notify(OtaEvent::UpdateFailed {
        error: e.to_string(),
    });
    e
}

async fn fetch_ok(
    transport: &dyn Transport,
    url: &str,
    accept: &str,
    credentials: Option<&Credentials>,
) -> Result<Fetched> {
    let fetched = transport
        .fetch(FetchRequest {
            url,
            accept,
            credentials,
        })
        .await?;
    if !fetched.is_success() {
        return Err(OtaError::NonSuccessStatus {
            status: fetched.status,
        });
    }
    Ok(fetched)
}

pub(crate) async fn check_locked(state: &mut ClientState, svc: &Services) -> Result<CheckOutcome> {
    let mut run = OrchestratorRun::new();
    let outcome = check_inner(state, svc, &mut run).await;
    let outcome = match outcome {
        // Already reported as NoUpdateAvailable
        Err(OtaError::NoValidAsset) => Err(OtaError::NoValidAsset),
        Err(e) => {
            run.enter(Phase::Failed);
            Err(fail(&svc.events, e))
        }
        Ok(checked) => Ok(checked),
    };
    state.phase = run.phase;
    outcome
}

async fn check_inner(
    state: &mut ClientState,
    svc: &Services,
    run: &mut OrchestratorRun,
) -> Result<CheckOutcome> {
    run.enter(Phase::Checking);
    state.resolver.reset();
    state.latest = None;

    svc.events.post(OtaEvent::CheckStarted)?;
    state.last_check_at = Some(Utc::now());

    let url = state.config.latest_release_url();
    info!("Checking for updates at {url}");
    let fetched = fetch_ok(
        svc.transport.as_ref(),
        &url,
        ACCEPT_RELEASE_JSON,
        state.credentials.as_ref(),
    )
    .await?;

    state.resolver = resolve_stream(fetched.body, state.fresh_resolver()).await?;

    if !state.resolver.is_valid() {
        run.enter(Phase::NoAssetFound);
        info!(
            "No release asset matches {:?}",
            state.config.firmware_name_pattern
        );
        svc.events.notify(OtaEvent::NoUpdateAvailable);
        return Err(OtaError::NoValidAsset);
    }
    run.enter(Phase::AssetResolved);

    let tag = state
        .release()
        .tag
        .as_deref()
        .ok_or_else(|| OtaError::VersionParse("release has no tag_name".to_owned()))?;
    let latest = Version::parse(tag)?;
    state.latest = Some(latest.clone());

    if is_newer(&state.current, &latest) {
        info!("Update available: {} -> {latest}", state.current);
        svc.events.notify(OtaEvent::UpdateAvailable {
            current: state.current.to_string(),
            latest: latest.to_string(),
        });
        Ok(CheckOutcome::UpdateAvailable(latest))
    } else {
        run.enter(Phase::UpToDate);
        info!("Already on latest version {}", state.current);
        svc.events.notify(OtaEvent::NoUpdateAvailable);
        Ok(CheckOutcome::UpToDate)
    }
}

pub(crate) async fn install_locked(state: &mut ClientState, svc: &Services) -> Result<Installed> {
    let mut run = OrchestratorRun::new();
    let outcome = install_inner(state, svc, &mut run).await;
    let outcome = match outcome {
        Ok(installed) => Ok(installed),
        Err(e) => {
            if run.slot_open
                && let Err(abort_err) = state.flash.abort_update()
            {
                warn!("Failed to abort update slot: {abort_err}");
            }
            run.enter(Phase::Failed);
            Err(fail(&svc.events, e))
        }
    };
    state.phase = run.phase;
    outcome
}

async fn install_inner(
    state: &mut ClientState,
    svc: &Services,
    run: &mut OrchestratorRun,
) -> Result<Installed> {
    let firmware = state
        .release()
        .firmware
        .clone()
        .ok_or(OtaError::NoValidAsset)?;

    run.enter(Phase::Gating);
    let latest = state
        .latest
        .clone()
        .ok_or_else(|| OtaError::VersionParse("no release version resolved".to_owned()))?;
    if !is_newer(&state.current, &latest) {
        run.enter(Phase::UpToDate);
        info!("Version {latest} is not newer than {}", state.current);
        svc.events.notify(OtaEvent::NoUpdateAvailable);
        return Ok(Installed::UpToDate);
    }

    svc.events.post(OtaEvent::UpdateStarted {
        version: latest.to_string(),
    })?;
    info!(
        "Updating {} -> {latest} from {}",
        state.current, firmware.name
    );
    flash_firmware(state, svc, run, &firmware).await?;

    let has_storage =
        state.release().storage.is_some() && state.config.storage_partition.is_some();
    if has_storage && let Err(e) = storage_locked(state, svc).await {
        warn!("Keeping firmware update despite storage failure: {e}");
    }

    svc.events.notify(OtaEvent::UpdateFinished);
    svc.events.notify(OtaEvent::PendingReboot);
    run.enter(Phase::Rebooting);
    Ok(Installed::PendingReboot)
}

async fn flash_firmware(
    state: &mut ClientState,
    svc: &Services,
    run: &mut OrchestratorRun,
    asset: &ReleaseAsset,
) -> Result<()> {
    run.enter(Phase::Downloading);
    let fetched = fetch_ok(
        svc.transport.as_ref(),
        &asset.url,
        ACCEPT_OCTET_STREAM,
        state.credentials.as_ref(),
    )
    .await?;
    match fetched.content_length {
        Some(len) => debug!("Firmware image is {len} bytes"),
        None => debug!("Firmware image length unknown"),
    }
    run.start_transfer(fetched.content_length, fetched.content_length);
    let mut body = fetched.body;

    run.enter(Phase::Validating);
    let header = read_header(&mut body).await?;
    let descriptor = AppDescriptor::parse(&header)?;
    let version = validate_image(&descriptor, &state.running, state.flash.min_secure_version())?;
    info!(
        "Image {} {version}, secure version {}",
        descriptor.project_name, descriptor.secure_version
    );

    run.enter(Phase::Flashing);
    state.flash.begin_update(run.total)?;
    run.slot_open = true;

    write_firmware_chunk(state, &svc.events, run, &header)?;
    while let Some(chunk) = body.next().await {
        write_firmware_chunk(state, &svc.events, run, &chunk?)?;
    }
    run.ensure_complete()?;

    run.enter(Phase::Finalizing);
    state.flash.finalize_update().map_err(|e| {
        if matches!(e, OtaError::FinalizeValidationFailed(_)) {
            e
        } else {
            OtaError::FinalizeValidationFailed(e.to_string())
        }
    })?;
    run.slot_open = false;
    info!("Firmware written and verified ({} bytes)", run.written);
    Ok(())
}

/// Buffer at least `IMAGE_HEADER_LEN` bytes from the front of the body
async fn read_header(body: &mut ByteStream) -> Result<Vec<u8>> {
    let mut header = Vec::new();
    header
        .try_reserve_exact(IMAGE_HEADER_LEN)
        .map_err(|_| OtaError::AllocationFailure(IMAGE_HEADER_LEN))?;

    while header.len() < IMAGE_HEADER_LEN {
        let Some(chunk) = body.next().await else {
            return Err(OtaError::ImageHeaderInvalid(format!(
                "stream ended after {} of {IMAGE_HEADER_LEN} header bytes",
                header.len()
            )));
        };
        let chunk = chunk?;
        header
            .try_reserve(chunk.len())
            .map_err(|_| OtaError::AllocationFailure(chunk.len()))?;
        header.extend_from_slice(&chunk);
    }
    Ok(header)
}

fn write_firmware_chunk(
    state: &mut ClientState,
    events: &EventHub,
    run: &mut OrchestratorRun,
    data: &[u8],
) -> Result<()> {
    let offset = run.written;
    let progress = run.record(data.len())?;
    state.flash.write_update(offset, data)?;
    if let Some(percent) = progress {
        events.notify(OtaEvent::FirmwareProgress(percent));
    }
    Ok(())
}

/// Install the resolved storage image into its data partition
pub(crate) async fn storage_locked(state: &mut ClientState, svc: &Services) -> Result<()> {
    let mut run = OrchestratorRun::new();
    let outcome = storage_inner(state, svc, &mut run).await;
    match outcome {
        Ok(()) => {
            run.enter(Phase::Idle);
            svc.events.notify(OtaEvent::StorageUpdateFinished);
        }
        Err(ref e) => {
            run.enter(Phase::Failed);
            error!("Storage update failed: {e}");
            svc.events.notify(OtaEvent::StorageUpdateFailed {
                error: e.to_string(),
            });
        }
    }
    state.phase = run.phase;
    outcome
}

async fn storage_inner(
    state: &mut ClientState,
    svc: &Services,
    run: &mut OrchestratorRun,
) -> Result<()> {
    let asset = state
        .release()
        .storage
        .clone()
        .ok_or(OtaError::NoValidAsset)?;
    let label = state
        .config
        .storage_partition
        .clone()
        .ok_or_else(|| OtaError::PartitionNotFound("<not configured>".to_owned()))?;
    let partition = state
        .flash
        .find_partition(&label)
        .ok_or_else(|| OtaError::PartitionNotFound(label.clone()))?;

    svc.events.post(OtaEvent::StorageUpdateStarted)?;
    tokio::time::sleep(svc.settle_delay).await;

    run.enter(Phase::StorageDownloading);
    info!("Downloading {} into partition {label}", asset.name);
    let fetched = fetch_ok(
        svc.transport.as_ref(),
        &asset.url,
        ACCEPT_OCTET_STREAM,
        state.credentials.as_ref(),
    )
    .await?;
    if let Some(len) = fetched.content_length
        && len > partition.size
    {
        return Err(OtaError::PartitionOverflow {
            label,
            size: len,
            capacity: partition.size,
        });
    }
    run.start_transfer(
        fetched.content_length,
        Some(fetched.content_length.unwrap_or(partition.size)),
    );

    state.flash.erase_partition(&label)?;
    run.enter(Phase::StorageFlashing);

    let mut body = fetched.body;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let offset = run.written;
        let progress = run.record(chunk.len())?;
        state.flash.write_partition(&label, offset, &chunk)?;
        if let Some(percent) = progress {
            svc.events.notify(OtaEvent::StorageProgress(percent));
        }
    }
    run.ensure_complete()?;

    let digest = state.flash.partition_digest(&label)?;
    info!(
        "Partition {label} written ({} bytes), sha256 {digest:x}",
        run.written
    );
    Ok(())
}

/// Check, then install when the release is newer
pub(crate) async fn check_and_update_locked(
    state: &mut ClientState,
    svc: &Services,
) -> Result<Installed> {
    match check_locked(state, svc).await? {
        CheckOutcome::UpdateAvailable(_) => install_locked(state, svc).await,
        CheckOutcome::UpToDate => Ok(Installed::UpToDate),
    }
}

/// Wait out the reboot delay and restart; called with the guard released
pub(crate) async fn restart(svc: &Services) -> Result<UpdateOutcome> {
    info!("Restarting in {:?}", svc.reboot_delay);
    tokio::time::sleep(svc.reboot_delay).await;
    match svc.restarter.restart() {
        Ok(()) => Ok(UpdateOutcome::Restarting),
        Err(e) => Err(fail(&svc.events, e)),
    }
}

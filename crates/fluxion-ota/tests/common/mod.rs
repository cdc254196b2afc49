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

//! Shared doubles for the integration tests

use async_trait::async_trait;
use bytes::Bytes;
use fluxion_ota::error::{OtaError, Result};
use fluxion_ota::transport::{FetchRequest, Fetched, Transport};
use fluxion_ota::{
    AppDescriptor, FlashDevice, OtaConfig, OtaEvent, PartitionDigest, PartitionInfo, Restarter,
};
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

pub const PROJECT: &str = "fluxion-fw";

pub fn config(base_url: &str) -> OtaConfig {
    OtaConfig {
        api_base_url: Some(base_url.to_owned()),
        ..OtaConfig::new("SolarE-cz", PROJECT, "fluxion-fw-*.bin")
    }
}

pub fn config_with_storage(base_url: &str) -> OtaConfig {
    config(base_url).with_storage("spiffs-*.bin", "spiffs")
}

pub fn manifest(tag: &str, assets: &[(&str, &str)]) -> String {
    let assets: Vec<_> = assets
        .iter()
        .map(|(name, url)| {
            json!({
                "name": name,
                "url": url,
                "size": 1024,
                "uploader": {"login": "ci", "id": 1},
                "label": null
            })
        })
        .collect();
    json!({
        "url": "https://api.github.com/repos/SolarE-cz/fluxion-fw/releases/1",
        "tag_name": tag,
        "draft": false,
        "author": {"login": "ci", "site_admin": false},
        "assets": assets,
        "body": "notes"
    })
    .to_string()
}

/// Firmware image of `payload_len` bytes announcing `version`
pub fn firmware_image(version: &str, payload_len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    AppDescriptor::new(PROJECT, version).encode_image(&payload, true)
}

/// What the in-memory flash saw
#[derive(Debug, Default)]
pub struct FlashLog {
    pub staged: Vec<u8>,
    pub slot_open: bool,
    pub begun: usize,
    pub aborted: usize,
    pub installed: Option<Vec<u8>>,
    pub partitions: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MemoryFlash {
    running: AppDescriptor,
    min_secure_version: Option<u32>,
    capacities: BTreeMap<String, u64>,
    pub log: Arc<Mutex<FlashLog>>,
}

impl MemoryFlash {
    pub fn new(running_version: &str) -> Self {
        Self {
            running: AppDescriptor::new(PROJECT, running_version),
            min_secure_version: None,
            capacities: BTreeMap::new(),
            log: Arc::default(),
        }
    }

    pub fn with_partition(mut self, label: &str, size: u64) -> Self {
        self.capacities.insert(label.to_owned(), size);
        self
    }

    pub fn with_min_secure_version(mut self, minimum: u32) -> Self {
        self.min_secure_version = Some(minimum);
        self
    }

    pub fn boxed(&self) -> Box<dyn FlashDevice> {
        Box::new(self.clone())
    }
}

impl FlashDevice for MemoryFlash {
    fn running_app(&self) -> Result<AppDescriptor> {
        Ok(self.running.clone())
    }

    fn min_secure_version(&self) -> Option<u32> {
        self.min_secure_version
    }

    fn begin_update(&mut self, _size: Option<u64>) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.staged.clear();
        log.slot_open = true;
        log.begun += 1;
        Ok(())
    }

    fn write_update(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if !log.slot_open {
            return Err(OtaError::Flash("slot not open".to_owned()));
        }
        let offset = offset as usize;
        if log.staged.len() < offset + data.len() {
            log.staged.resize(offset + data.len(), 0);
        }
        log.staged[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn finalize_update(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.slot_open = false;
        AppDescriptor::parse(&log.staged)
            .map_err(|e| OtaError::FinalizeValidationFailed(e.to_string()))?;
        log.installed = Some(log.staged.clone());
        Ok(())
    }

    fn abort_update(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.slot_open = false;
        log.staged.clear();
        log.aborted += 1;
        Ok(())
    }

    fn find_partition(&self, label: &str) -> Option<PartitionInfo> {
        self.capacities.get(label).map(|&size| PartitionInfo {
            label: label.to_owned(),
            size,
        })
    }

    fn erase_partition(&mut self, label: &str) -> Result<()> {
        let size = *self
            .capacities
            .get(label)
            .ok_or_else(|| OtaError::PartitionNotFound(label.to_owned()))?;
        let mut log = self.log.lock().unwrap();
        log.partitions.insert(label.to_owned(), vec![0; size as usize]);
        Ok(())
    }

    fn write_partition(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let partition = log
            .partitions
            .get_mut(label)
            .ok_or_else(|| OtaError::PartitionNotFound(label.to_owned()))?;
        let end = offset as usize + data.len();
        if end > partition.len() {
            return Err(OtaError::PartitionOverflow {
                label: label.to_owned(),
                size: end as u64,
                capacity: partition.len() as u64,
            });
        }
        partition[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn partition_digest(&self, label: &str) -> Result<PartitionDigest> {
        let log = self.log.lock().unwrap();
        let partition = log
            .partitions
            .get(label)
            .ok_or_else(|| OtaError::PartitionNotFound(label.to_owned()))?;
        Ok(Sha256::digest(partition))
    }
}

/// Counts restarts instead of performing them
#[derive(Debug, Default)]
pub struct RecordingRestarter {
    pub restarts: AtomicUsize,
}

impl RecordingRestarter {
    pub fn count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub content_length: Option<u64>,
    pub chunks: Vec<Bytes>,
}

impl Route {
    /// 200 with the full body split into `chunk` sized pieces
    pub fn ok(body: &[u8], chunk: usize) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            chunks: body.chunks(chunk).map(Bytes::copy_from_slice).collect(),
        }
    }

    /// Advertise `declared` bytes but deliver `body`
    pub fn declared(declared: u64, body: &[u8], chunk: usize) -> Self {
        Self {
            content_length: Some(declared),
            ..Self::ok(body, chunk)
        }
    }
}

/// In-process transport serving canned routes
#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    pub requests: Mutex<Vec<String>>,
    pub fetches: AtomicUsize,
    /// When set, every fetch waits for a permit first
    pub gate: Option<Arc<Notify>>,
}

impl FakeTransport {
    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_owned(), route);
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Fetched> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.url.to_owned());
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }

        let route = self.routes.lock().unwrap().get(request.url).cloned();
        let Some(route) = route else {
            return Ok(Fetched {
                status: 404,
                content_length: Some(0),
                body: stream::empty().boxed(),
            });
        };
        Ok(Fetched {
            status: route.status,
            content_length: route.content_length,
            body: stream::iter(route.chunks.into_iter().map(Ok)).boxed(),
        })
    }
}

/// Everything posted so far, without waiting
pub fn drain(rx: &mut broadcast::Receiver<OtaEvent>) -> Vec<OtaEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[OtaEvent]) -> Vec<&'static str> {
    events.iter().map(OtaEvent::name).collect()
}

pub fn progress(events: &[OtaEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            OtaEvent::FirmwareProgress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

pub const NO_DELAY: Duration = Duration::ZERO;

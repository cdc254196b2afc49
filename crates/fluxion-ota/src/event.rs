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

//! Lifecycle events posted while checking and installing updates

use crate::error::{OtaError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Events buffered per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OtaEvent {
    CheckStarted,
    UpdateAvailable { current: String, latest: String },
    NoUpdateAvailable,
    UpdateStarted { version: String },
    FirmwareProgress(u8),
    StorageUpdateStarted,
    StorageProgress(u8),
    StorageUpdateFinished,
    StorageUpdateFailed { error: String },
    UpdateFinished,
    UpdateFailed { error: String },
    PendingReboot,
}

impl OtaEvent {
    /// Stable name used in logs and by consumers matching on strings
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckStarted => "CheckStarted",
            Self::UpdateAvailable { .. } => "UpdateAvailable",
            Self::NoUpdateAvailable => "NoUpdateAvailable",
            Self::UpdateStarted { .. } => "UpdateStarted",
            Self::FirmwareProgress(_) => "FirmwareProgress",
            Self::StorageUpdateStarted => "StorageUpdateStarted",
            Self::StorageProgress(_) => "StorageProgress",
            Self::StorageUpdateFinished => "StorageUpdateFinished",
            Self::StorageUpdateFailed { .. } => "StorageUpdateFailed",
            Self::UpdateFinished => "UpdateFinished",
            Self::UpdateFailed { .. } => "UpdateFailed",
            Self::PendingReboot => "PendingReboot",
        }
    }
}

/// Receiver of lifecycle events
///
/// `post` must not block; a sink that cannot take the event returns
/// `OtaError::EventDelivery`.
pub trait EventSink: Send + Sync {
    fn post(&self, event: &OtaEvent) -> Result<()>;
}

/// Fan-out of events to any number of subscribers
///
/// Posting never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OtaEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OtaEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn post(&self, event: &OtaEvent) -> Result<()> {
        if self.tx.send(event.clone()).is_err() {
            debug!("No subscribers for {}", event.name());
        }
        Ok(())
    }
}

impl EventSink for mpsc::Sender<OtaEvent> {
    fn post(&self, event: &OtaEvent) -> Result<()> {
        self.try_send(event.clone())
            .map_err(|_| OtaError::EventDelivery(event.name()))
    }
}

/// The bus plus any extra sinks, posted to together
#[derive(Clone, Default)]
pub struct EventHub {
    bus: EventBus,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventHub {
    pub fn new(bus: EventBus, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { bus, sinks }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Post to every sink; the first delivery failure is returned after all
    /// sinks have been tried
    pub fn post(&self, event: OtaEvent) -> Result<()> {
        debug!("Event {}", event.name());
        self.bus.post(&event)?;

        let mut outcome = Ok(());
        for sink in &self.sinks {
            if let Err(e) = sink.post(&event)
                && outcome.is_ok()
            {
                outcome = Err(e);
            }
        }
        outcome
    }

    /// Post where a lost event must not fail the operation
    pub fn notify(&self, event: OtaEvent) {
        if let Err(e) = self.post(event) {
            warn!("{e}");
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("bus", &self.bus)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&OtaEvent::FirmwareProgress(45)).unwrap();
        assert_eq!(json, r#"{"FirmwareProgress":45}"#);

        let json = serde_json::to_string(&OtaEvent::UpdateAvailable {
            current: "1.4.0".to_owned(),
            latest: "2.0.0".to_owned(),
        })
        .unwrap();
        assert!(json.contains("UpdateAvailable"));
        assert!(json.contains("2.0.0"));

        assert_eq!(
            serde_json::to_string(&OtaEvent::PendingReboot).unwrap(),
            r#""PendingReboot""#
        );
    }

    #[test]
    fn test_event_names() {
        assert_eq!(OtaEvent::CheckStarted.name(), "CheckStarted");
        assert_eq!(OtaEvent::StorageProgress(5).name(), "StorageProgress");
        assert_eq!(
            OtaEvent::UpdateFailed {
                error: "x".to_owned()
            }
            .name(),
            "UpdateFailed"
        );
    }

    #[tokio::test]
    async fn test_bus_delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.post(&OtaEvent::CheckStarted).unwrap();
        assert_eq!(a.recv().await.unwrap(), OtaEvent::CheckStarted);
        assert_eq!(b.recv().await.unwrap(), OtaEvent::CheckStarted);
    }

    #[test]
    fn test_bus_without_subscribers_is_ok() {
        assert!(EventBus::new().post(&OtaEvent::NoUpdateAvailable).is_ok());
    }

    #[test]
    fn test_full_channel_sink_fails_delivery() {
        let (tx, mut rx) = mpsc::channel::<OtaEvent>(1);
        tx.post(&OtaEvent::CheckStarted).unwrap();
        assert!(matches!(
            tx.post(&OtaEvent::UpdateFinished),
            Err(OtaError::EventDelivery("UpdateFinished"))
        ));

        assert_eq!(rx.try_recv().unwrap(), OtaEvent::CheckStarted);
        drop(rx);
        assert!(tx.post(&OtaEvent::CheckStarted).is_err());
    }

    #[test]
    fn test_hub_tries_every_sink() {
        let (full, _full_rx) = mpsc::channel::<OtaEvent>(1);
        full.post(&OtaEvent::CheckStarted).unwrap();
        let (ok, mut ok_rx) = mpsc::channel::<OtaEvent>(4);

        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let hub = EventHub::new(bus, vec![Arc::new(full) as Arc<dyn EventSink>, Arc::new(ok)]);

        assert!(matches!(
            hub.post(OtaEvent::UpdateStarted {
                version: "2.0.0".to_owned()
            }),
            Err(OtaError::EventDelivery("UpdateStarted"))
        ));
        assert_eq!(ok_rx.try_recv().unwrap().name(), "UpdateStarted");
        assert_eq!(sub.try_recv().unwrap().name(), "UpdateStarted");

        // notify swallows the failure
        hub.notify(OtaEvent::UpdateFinished);
        assert_eq!(ok_rx.try_recv().unwrap(), OtaEvent::UpdateFinished);
    }
}

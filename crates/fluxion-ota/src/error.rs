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

//! Error types for the OTA client

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("timed out waiting for the client lock")]
    GuardTimeout,

    #[error("failed to allocate {0} bytes")]
    AllocationFailure(usize),

    #[error("version parse error: {0}")]
    VersionParse(String),

    #[error("no release asset matches the firmware pattern")]
    NoValidAsset,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded with status {status}")]
    NonSuccessStatus { status: u16 },

    #[error("invalid image header: {0}")]
    ImageHeaderInvalid(String),

    #[error("image secure version {image} is below the device minimum {minimum}")]
    SecurityVersionRejected { image: u32, minimum: u32 },

    #[error("incomplete transfer: received {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    #[error("image validation failed after write: {0}")]
    FinalizeValidationFailed(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(String),

    #[error("asset of {size} bytes does not fit partition {label} ({capacity} bytes)")]
    PartitionOverflow {
        label: String,
        size: u64,
        capacity: u64,
    },

    #[error("failed to deliver event {0}")]
    EventDelivery(&'static str),

    #[error("an update run is already in progress")]
    AlreadyRunning,

    #[error("config error: {0}")]
    Config(String),

    #[error("flash error: {0}")]
    Flash(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OtaError>;

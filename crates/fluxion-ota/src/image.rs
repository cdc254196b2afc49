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

//! Application image header parsing
//!
//! Layout: 24 byte image header, 8 byte header of the first segment, then the
//! 256 byte application descriptor.

use crate::error::{OtaError, Result};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

const IMAGE_HEADER_SIZE: usize = 24;
const SEGMENT_HEADER_SIZE: usize = 8;
const APP_DESC_SIZE: usize = 256;
const APP_DESC_OFFSET: usize = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE;
const HASH_APPENDED_OFFSET: usize = 23;

/// Bytes needed before an image can be validated
pub const IMAGE_HEADER_LEN: usize = APP_DESC_OFFSET + APP_DESC_SIZE;

/// Length of the SHA-256 trailer appended to images that carry one
pub const IMAGE_DIGEST_LEN: usize = 32;

// Field offsets inside the application descriptor
const SECURE_VERSION: usize = 4;
const VERSION: (usize, usize) = (16, 32);
const PROJECT_NAME: (usize, usize) = (48, 32);
const TIME: (usize, usize) = (80, 16);
const DATE: (usize, usize) = (96, 16);
const IDF_VERSION: (usize, usize) = (112, 32);

/// Descriptor embedded at the front of every application image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub project_name: String,
    pub version: String,
    pub secure_version: u32,
    pub time: String,
    pub date: String,
    pub idf_version: String,
}

impl AppDescriptor {
    pub fn new(project_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Parse the descriptor out of the first `IMAGE_HEADER_LEN` bytes of an image
    pub fn parse(image: &[u8]) -> Result<Self> {
        if image.len() < IMAGE_HEADER_LEN {
            return Err(OtaError::ImageHeaderInvalid(format!(
                "need {IMAGE_HEADER_LEN} header bytes, got {}",
                image.len()
            )));
        }
        if image[0] != IMAGE_MAGIC {
            return Err(OtaError::ImageHeaderInvalid(format!(
                "bad image magic 0x{:02x}",
                image[0]
            )));
        }

        let desc = &image[APP_DESC_OFFSET..IMAGE_HEADER_LEN];
        let magic = read_u32(desc, 0);
        if magic != APP_DESC_MAGIC {
            return Err(OtaError::ImageHeaderInvalid(format!(
                "bad descriptor magic 0x{magic:08x}"
            )));
        }

        Ok(Self {
            project_name: read_str(desc, PROJECT_NAME),
            version: read_str(desc, VERSION),
            secure_version: read_u32(desc, SECURE_VERSION),
            time: read_str(desc, TIME),
            date: read_str(desc, DATE),
            idf_version: read_str(desc, IDF_VERSION),
        })
    }

    /// Build a complete image around `payload`, as the firmware build does
    pub fn encode_image(&self, payload: &[u8], append_digest: bool) -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_HEADER_LEN];
        image[0] = IMAGE_MAGIC;
        image[1] = 1;
        image[HASH_APPENDED_OFFSET] = u8::from(append_digest);

        let segment_len = u32::try_from(APP_DESC_SIZE + payload.len()).unwrap_or(u32::MAX);
        image[IMAGE_HEADER_SIZE + 4..APP_DESC_OFFSET].copy_from_slice(&segment_len.to_le_bytes());

        let desc = &mut image[APP_DESC_OFFSET..];
        desc[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        desc[SECURE_VERSION..SECURE_VERSION + 4].copy_from_slice(&self.secure_version.to_le_bytes());
        write_str(desc, VERSION, &self.version);
        write_str(desc, PROJECT_NAME, &self.project_name);
        write_str(desc, TIME, &self.time);
        write_str(desc, DATE, &self.date);
        write_str(desc, IDF_VERSION, &self.idf_version);

        image.extend_from_slice(payload);
        if append_digest {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }
}

/// Whether the image header announces a SHA-256 trailer
pub fn digest_appended(image: &[u8]) -> bool {
    image.get(HASH_APPENDED_OFFSET) == Some(&1)
}

/// Check a new image against the running one before any byte is written
pub fn validate_image(
    new: &AppDescriptor,
    running: &AppDescriptor,
    min_secure_version: Option<u32>,
) -> Result<Version> {
    let version = Version::parse(&new.version).map_err(|e| {
        OtaError::ImageHeaderInvalid(format!("image version {:?}: {e}", new.version))
    })?;

    if !running.project_name.is_empty() && new.project_name != running.project_name {
        return Err(OtaError::ImageHeaderInvalid(format!(
            "image is for project {:?}, device runs {:?}",
            new.project_name, running.project_name
        )));
    }

    if let Some(minimum) = min_secure_version
        && new.secure_version < minimum
    {
        return Err(OtaError::SecurityVersionRejected {
            image: new.secure_version,
            minimum,
        });
    }

    Ok(version)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_str(buf: &[u8], (offset, len): (usize, usize)) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_str(buf: &mut [u8], (offset, len): (usize, usize), value: &str) {
    // Keep room for the terminating NUL
    let bytes = value.as_bytes();
    let n = bytes.len().min(len - 1);
    buf[offset..offset + n].copy_from_slice(&bytes[..n]);
}

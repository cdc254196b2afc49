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

//! Flash access: the inactive application slot and named data partitions

use crate::config::FlashConfig;
use crate::error::{OtaError, Result};
use crate::image::{AppDescriptor, IMAGE_DIGEST_LEN, IMAGE_HEADER_LEN, digest_appended};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const APP_IMAGE: &str = "app.bin";
const APP_STAGING: &str = "app.bin.new";
const APP_PREVIOUS: &str = "app.bin.prev";

/// SHA-256 of a data partition; formats as hex with `{:x}`
pub type PartitionDigest = sha2::digest::Output<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub label: String,
    /// Capacity in bytes
    pub size: u64,
}

/// Device-side operations the orchestrator needs
///
/// The application slot follows begin, write, then finalize or abort. A
/// failed or aborted slot never replaces the running image.
pub trait FlashDevice: Send + Sync {
    /// Descriptor of the image currently running
    fn running_app(&self) -> Result<AppDescriptor>;

    /// Anti-rollback floor, if the device enforces one
    fn min_secure_version(&self) -> Option<u32> {
        None
    }

    /// Open the inactive slot; `size` is the expected image length when known
    fn begin_update(&mut self, size: Option<u64>) -> Result<()>;

    fn write_update(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Verify the staged image and select it for the next boot
    fn finalize_update(&mut self) -> Result<()>;

    /// Drop the staged image; a no-op when nothing was begun
    fn abort_update(&mut self) -> Result<()>;

    fn find_partition(&self, label: &str) -> Option<PartitionInfo>;

    fn erase_partition(&mut self, label: &str) -> Result<()>;

    fn write_partition(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// SHA-256 over the whole partition
    fn partition_digest(&self, label: &str) -> Result<PartitionDigest>;
}

/// Flash emulated by files under one directory
///
/// The running image is `app.bin`; updates are staged in `app.bin.new` and
/// the replaced image is kept as `app.bin.prev`. Data partitions live in
/// `<label>.img`. Erased partitions read back as zeros.
#[derive(Debug)]
pub struct FileFlash {
    root: PathBuf,
    partitions: BTreeMap<String, u64>,
    min_secure_version: Option<u32>,
    staging: Option<File>,
}

impl FileFlash {
    pub fn new(config: &FlashConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root.clone(),
            partitions: config.partitions.clone(),
            min_secure_version: config.min_secure_version,
            staging: None,
        })
    }

    fn partition_path(&self, label: &str) -> Result<PathBuf> {
        if !self.partitions.contains_key(label) {
            return Err(OtaError::PartitionNotFound(label.to_owned()));
        }
        Ok(self.root.join(format!("{label}.img")))
    }

    fn verify_staged(&self) -> Result<()> {
        let staged = fs::read(self.root.join(APP_STAGING))?;
        let descriptor = AppDescriptor::parse(&staged)
            .map_err(|e| OtaError::FinalizeValidationFailed(e.to_string()))?;

        if digest_appended(&staged) {
            if staged.len() < IMAGE_HEADER_LEN + IMAGE_DIGEST_LEN {
                return Err(OtaError::FinalizeValidationFailed(
                    "image too short for its digest".to_owned(),
                ));
            }
            let (body, trailer) = staged.split_at(staged.len() - IMAGE_DIGEST_LEN);
            if Sha256::digest(body).as_slice() != trailer {
                return Err(OtaError::FinalizeValidationFailed(
                    "image digest mismatch".to_owned(),
                ));
            }
        }

        debug!(
            "Staged image {} {} verified ({} bytes)",
            descriptor.project_name,
            descriptor.version,
            staged.len()
        );
        Ok(())
    }
}

impl FlashDevice for FileFlash {
    fn running_app(&self) -> Result<AppDescriptor> {
        let path = self.root.join(APP_IMAGE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("No application image at {}, assuming 0.0.0", path.display());
                return Ok(AppDescriptor::new("", "0.0.0"));
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = vec![0u8; IMAGE_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|e| OtaError::Flash(format!("Failed to read {}: {e}", path.display())))?;
        AppDescriptor::parse(&header)
    }

    fn min_secure_version(&self) -> Option<u32> {
        self.min_secure_version
    }

    fn begin_update(&mut self, size: Option<u64>) -> Result<()> {
        let file = File::create(self.root.join(APP_STAGING))?;
        if let Some(size) = size {
            file.set_len(size)?;
        }
        self.staging = Some(file);
        Ok(())
    }

    fn write_update(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self
            .staging
            .as_mut()
            .ok_or_else(|| OtaError::Flash("no update in progress".to_owned()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn finalize_update(&mut self) -> Result<()> {
        let mut file = self
            .staging
            .take()
            .ok_or_else(|| OtaError::Flash("no update in progress".to_owned()))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = self.verify_staged() {
            if let Err(cleanup) = fs::remove_file(self.root.join(APP_STAGING)) {
                warn!("Failed to remove rejected staged image: {cleanup}");
            }
            return Err(e);
        }

        let current = self.root.join(APP_IMAGE);
        if current.exists() {
            fs::rename(&current, self.root.join(APP_PREVIOUS))?;
        }
        fs::rename(self.root.join(APP_STAGING), &current)?;
        info!("New application image selected for next boot");
        Ok(())
    }

    fn abort_update(&mut self) -> Result<()> {
        if self.staging.take().is_none() {
            return Ok(());
        }
        match fs::remove_file(self.root.join(APP_STAGING)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn find_partition(&self, label: &str) -> Option<PartitionInfo> {
        self.partitions.get(label).map(|&size| PartitionInfo {
            label: label.to_owned(),
            size,
        })
    }

    fn erase_partition(&mut self, label: &str) -> Result<()> {
        let path = self.partition_path(label)?;
        let size = self.partitions.get(label).copied().unwrap_or_default();
        let file = File::create(path)?;
        file.set_len(size)?;
        Ok(())
    }

    fn write_partition(&mut self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.partition_path(label)?;
        let capacity = self.partitions.get(label).copied().unwrap_or_default();
        let end = offset + data.len() as u64;
        if end > capacity {
            return Err(OtaError::PartitionOverflow {
                label: label.to_owned(),
                size: end,
                capacity,
            });
        }

        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn partition_digest(&self, label: &str) -> Result<PartitionDigest> {
        let mut file = File::open(self.partition_path(label)?)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flash(dir: &TempDir) -> FileFlash {
        let mut config = FlashConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.partitions.insert("spiffs".to_owned(), 64);
        FileFlash::new(&config).unwrap()
    }

    fn stage(flash: &mut FileFlash, image: &[u8]) {
        flash.begin_update(Some(image.len() as u64)).unwrap();
        for (i, chunk) in image.chunks(100).enumerate() {
            flash.write_update((i * 100) as u64, chunk).unwrap();
        }
    }

    #[test]
    fn test_running_app_defaults_without_image() {
        let dir = TempDir::new().unwrap();
        let running = flash(&dir).running_app().unwrap();
        assert_eq!(running.version, "0.0.0");
        assert!(running.project_name.is_empty());
    }

    #[test]
    fn test_finalize_rotates_images() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash(&dir);

        let v1 = AppDescriptor::new("fw", "1.0.0").encode_image(b"one", true);
        stage(&mut flash, &v1);
        flash.finalize_update().unwrap();
        assert_eq!(flash.running_app().unwrap().version, "1.0.0");

        let v2 = AppDescriptor::new("fw", "2.0.0").encode_image(&[7u8; 500], true);
        stage(&mut flash, &v2);
        flash.finalize_update().unwrap();

        assert_eq!(flash.running_app().unwrap().version, "2.0.0");
        assert_eq!(fs::read(dir.path().join(APP_PREVIOUS)).unwrap(), v1);
        assert!(!dir.path().join(APP_STAGING).exists());
    }

    #[test]
    fn test_finalize_rejects_corrupt_digest() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash(&dir);

        let mut image = AppDescriptor::new("fw", "1.0.0").encode_image(b"payload", true);
        let last = image.len() - 1;
        image[last] ^= 0x01;
        stage(&mut flash, &image);

        assert!(matches!(
            flash.finalize_update(),
            Err(OtaError::FinalizeValidationFailed(_))
        ));
        assert!(!dir.path().join(APP_IMAGE).exists());
        assert!(!dir.path().join(APP_STAGING).exists());
    }

    #[test]
    fn test_abort_discards_staging() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash(&dir);
        stage(&mut flash, b"partial");
        flash.abort_update().unwrap();
        assert!(!dir.path().join(APP_STAGING).exists());
        assert!(flash.write_update(0, b"x").is_err());
        // Nothing begun
        flash.abort_update().unwrap();
    }

    #[test]
    fn test_partition_write_and_digest() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash(&dir);

        assert_eq!(
            flash.find_partition("spiffs"),
            Some(PartitionInfo {
                label: "spiffs".to_owned(),
                size: 64
            })
        );
        assert!(flash.find_partition("nvs").is_none());

        flash.erase_partition("spiffs").unwrap();
        flash.write_partition("spiffs", 0, &[0xAB; 32]).unwrap();
        flash.write_partition("spiffs", 32, &[0xCD; 32]).unwrap();

        let mut expected = vec![0xAB; 32];
        expected.extend_from_slice(&[0xCD; 32]);
        let digest = flash.partition_digest("spiffs").unwrap();
        assert_eq!(digest, Sha256::digest(&expected));
        assert_eq!(format!("{digest:x}"), format!("{:x}", Sha256::digest(&expected)));
        assert_eq!(format!("{digest:x}").len(), 64);

        assert!(matches!(
            flash.write_partition("spiffs", 60, &[0u8; 8]),
            Err(OtaError::PartitionOverflow { capacity: 64, .. })
        ));
        assert!(matches!(
            flash.erase_partition("nvs"),
            Err(OtaError::PartitionNotFound(_))
        ));
    }
}

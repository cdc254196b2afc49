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

//! Configuration module for the OTA client

use crate::error::{OtaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_CONFIG_PATH: &str = "/data/ota_config.json";
pub const DEFAULT_HOST: &str = "api.github.com";

/// Longest storage partition label the partition table can hold
pub const MAX_PARTITION_LABEL_LEN: usize = 16;

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_60() -> u32 {
    60
}

fn default_30() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("fluxion-ota/", env!("CARGO_PKG_VERSION")).to_owned()
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OtaConfig {
    /// API host serving the releases endpoint
    #[serde(default = "default_host")]
    pub host: String,

    /// Repository owner
    pub org: String,

    /// Repository name
    pub repo: String,

    /// Glob matched against asset names to find the firmware image
    pub firmware_name_pattern: String,

    /// Glob matched against asset names to find the storage image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name_pattern: Option<String>,

    /// Label of the data partition that receives the storage image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_partition: Option<String>,

    /// Minutes between automatic checks
    #[serde(default = "default_60")]
    pub check_interval_minutes: u32,

    /// Custom API base URL (overrides `https://{host}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Personal access token used as the basic-auth password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_30")]
    pub request_timeout_secs: u64,

    /// Settings for the file-backed flash device used by the daemon
    #[serde(default)]
    pub flash: FlashConfig,

    #[serde(default)]
    pub restart_mode: RestartMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashConfig {
    /// Directory holding the application image and data partitions
    #[serde(default = "default_flash_root")]
    pub root: PathBuf,

    /// Data partitions by label, with their capacity in bytes
    #[serde(default)]
    pub partitions: BTreeMap<String, u64>,

    /// Lowest secure version the device accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_secure_version: Option<u32>,
}

fn default_flash_root() -> PathBuf {
    PathBuf::from("/data/flash")
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            root: default_flash_root(),
            partitions: BTreeMap::new(),
            min_secure_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Reboot the machine
    #[default]
    Reboot,
    /// Exit the process and let the supervisor start the new image
    Exit,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            org: String::new(),
            repo: String::new(),
            firmware_name_pattern: String::new(),
            storage_name_pattern: None,
            storage_partition: None,
            check_interval_minutes: 60,
            api_base_url: None,
            username: None,
            token: None,
            user_agent: default_user_agent(),
            request_timeout_secs: 30,
            flash: FlashConfig::default(),
            restart_mode: RestartMode::default(),
        }
    }
}

impl OtaConfig {
    pub fn new(
        org: impl Into<String>,
        repo: impl Into<String>,
        firmware_name_pattern: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            firmware_name_pattern: firmware_name_pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_storage(
        mut self,
        storage_name_pattern: impl Into<String>,
        storage_partition: impl Into<String>,
    ) -> Self {
        self.storage_name_pattern = Some(storage_name_pattern.into());
        self.storage_partition = Some(storage_partition.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.org.is_empty() || self.repo.is_empty() {
            return Err(OtaError::Config(
                "org and repo must not be empty".to_owned(),
            ));
        }
        if self.firmware_name_pattern.is_empty() {
            return Err(OtaError::Config(
                "firmware_name_pattern must not be empty".to_owned(),
            ));
        }
        if self.check_interval_minutes == 0 {
            return Err(OtaError::Config(
                "check_interval_minutes must be at least 1".to_owned(),
            ));
        }
        if let Some(ref label) = self.storage_partition
            && (label.is_empty() || label.len() > MAX_PARTITION_LABEL_LEN)
        {
            return Err(OtaError::Config(format!(
                "storage_partition must be 1..={MAX_PARTITION_LABEL_LEN} bytes, got {label:?}"
            )));
        }
        if self.storage_name_pattern.is_some() && self.storage_partition.is_none() {
            return Err(OtaError::Config(
                "storage_name_pattern requires storage_partition".to_owned(),
            ));
        }
        Ok(())
    }

    /// Base URL of the releases API, without a trailing slash
    pub fn api_base(&self) -> String {
        match self.api_base_url {
            Some(ref base) => base.trim_end_matches('/').to_owned(),
            None => format!("https://{}", self.host),
        }
    }

    /// URL of the latest release document
    pub fn latest_release_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base(),
            self.org,
            self.repo
        )
    }

    /// Move the config file credentials out, leaving no copy of the token behind
    ///
    /// Returns `None` unless both parts are present; a lone token is wiped.
    pub fn take_credentials(&mut self) -> Option<Credentials> {
        match (self.username.take(), self.token.take()) {
            (Some(user), Some(token)) => Some(Credentials::new(user, token)),
            (_, Some(mut token)) => {
                token.zeroize();
                None
            }
            (_, None) => None,
        }
    }
}

impl fmt::Debug for OtaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaConfig")
            .field("host", &self.host)
            .field("org", &self.org)
            .field("repo", &self.repo)
            .field("firmware_name_pattern", &self.firmware_name_pattern)
            .field("storage_name_pattern", &self.storage_name_pattern)
            .field("storage_partition", &self.storage_partition)
            .field("check_interval_minutes", &self.check_interval_minutes)
            .field("api_base_url", &self.api_base_url)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("flash", &self.flash)
            .field("restart_mode", &self.restart_mode)
            .finish()
    }
}

/// Basic-auth credentials; the token is wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub fn load_config(path: &Path) -> Result<OtaConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| OtaError::Config(format!("Failed to parse config: {e}")))
    } else {
        // Create with defaults
        let config = OtaConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &OtaConfig) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

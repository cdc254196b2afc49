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

//! Version parsing and the update gate

use crate::error::{OtaError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Semver-like version with optional pre-release and build metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub pre: Option<String>,
    pub build: Option<String>,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
            build: None,
        }
    }

    /// Parse "1.2.3", "v1.2.3", "1.2.3-rc.1+build.7"
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = version_from_tag(s.trim());

        let (rest, build) = match trimmed.split_once('+') {
            Some((rest, build)) => (rest, Some(non_empty(build, s)?)),
            None => (trimmed, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(non_empty(pre, s)?)),
            None => (rest, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(OtaError::VersionParse(format!(
                "Invalid version format: {s}, expected X.Y.Z"
            )));
        }

        Ok(Self {
            major: parse_component(parts[0], "major")?,
            minor: parse_component(parts[1], "minor")?,
            patch: parse_component(parts[2], "patch")?,
            pre,
            build,
        })
    }

    /// (major, minor, patch) triple, the only part that takes part in ordering
    pub fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

fn parse_component(part: &str, which: &str) -> Result<u32> {
    // u32::from_str accepts a leading '+', versions do not
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OtaError::VersionParse(format!(
            "Invalid {which} version: {part}"
        )));
    }
    part.parse::<u32>()
        .map_err(|_| OtaError::VersionParse(format!("Invalid {which} version: {part}")))
}

fn non_empty(s: &str, whole: &str) -> Result<String> {
    if s.is_empty() {
        return Err(OtaError::VersionParse(format!(
            "Empty pre-release or build metadata in {whole}"
        )));
    }
    Ok(s.to_owned())
}

impl FromStr for Version {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre {
            write!(f, "-{pre}")?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// Order two versions by (major, minor, patch); metadata is ignored
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.triple().cmp(&b.triple())
}

/// True only when `latest` is strictly newer than `current`
pub fn is_newer(current: &Version, latest: &Version) -> bool {
    compare(latest, current) == Ordering::Greater
}

/// Extract version from a release tag (strips one leading "v" or "V")
pub fn version_from_tag(tag: &str) -> &str {
    tag.strip_prefix(['v', 'V']).unwrap_or(tag)
}

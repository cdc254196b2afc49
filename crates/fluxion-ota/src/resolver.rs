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

//! Streaming release asset resolver
//!
//! Consumes structural JSON events of a release document one at a time and
//! picks out the release tag plus the first firmware and storage assets whose
//! names match the configured globs. The document is never held in memory.

use crate::pattern::glob_match;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Scalar payload of a JSON value event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar<'a> {
    Str(&'a str),
    Number(f64),
    Bool(bool),
    Null,
}

/// Structural event emitted by a streaming JSON reader
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JsonEvent<'a> {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    Key(&'a str),
    Value(Scalar<'a>),
}

/// Downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
}

/// What a single pass over a release document produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRelease {
    pub tag: Option<String>,
    pub firmware: Option<ReleaseAsset>,
    pub storage: Option<ReleaseAsset>,
}

impl ResolvedRelease {
    pub fn tag_captured(&self) -> bool {
        self.tag.is_some()
    }

    /// A release is usable once a firmware asset has been latched
    pub fn is_valid(&self) -> bool {
        self.firmware.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopKey {
    TagName,
    Assets,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetKey {
    Name,
    Url,
    Other,
}

/// Where to go once a skipped container closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    TopLevel,
    AssetsArray,
    AssetObject,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    /// Nothing seen yet
    Start,
    /// Inside the top-level object, expecting a key or its end
    TopLevel,
    /// Expecting the value of a top-level key
    TopLevelValue(TopKey),
    /// Inside the `assets` array, expecting an element or its end
    InAssetsArray,
    /// Inside one asset object, expecting a key or its end
    InAssetObject,
    /// Expecting the value of a key inside an asset object
    AssetValue(AssetKey),
    /// Inside a container that cannot contain anything of interest
    Skip { depth: usize, resume: Resume },
    /// Top-level value finished
    Done,
}

impl From<Resume> for Context {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::TopLevel => Context::TopLevel,
            Resume::AssetsArray => Context::InAssetsArray,
            Resume::AssetObject => Context::InAssetObject,
            Resume::Done => Context::Done,
        }
    }
}

/// Fields of the asset currently being read
#[derive(Debug, Default)]
struct Scratch {
    name: Option<String>,
    url: Option<String>,
}

impl Scratch {
    fn clear(&mut self) {
        self.name = None;
        self.url = None;
    }
}

/// Single-pass classifier of release manifests
#[derive(Debug)]
pub struct AssetResolver {
    firmware_pattern: String,
    storage_pattern: Option<String>,
    context: Context,
    scratch: Scratch,
    release: ResolvedRelease,
}

impl AssetResolver {
    pub fn new(firmware_pattern: impl Into<String>, storage_pattern: Option<String>) -> Self {
        Self {
            firmware_pattern: firmware_pattern.into(),
            storage_pattern,
            context: Context::Start,
            scratch: Scratch::default(),
            release: ResolvedRelease::default(),
        }
    }

    /// Forget everything learned from a previous document
    pub fn reset(&mut self) {
        self.context = Context::Start;
        self.scratch.clear();
        self.release = ResolvedRelease::default();
    }

    pub fn release(&self) -> &ResolvedRelease {
        &self.release
    }

    pub fn is_valid(&self) -> bool {
        self.release.is_valid()
    }

    pub fn feed(&mut self, event: JsonEvent<'_>) {
        self.context = match (self.context, event) {
            (Context::Start, JsonEvent::ObjectStart) => Context::TopLevel,
            (Context::Start, JsonEvent::ArrayStart) => Context::Skip {
                depth: 1,
                resume: Resume::Done,
            },
            (Context::Start, _) => Context::Done,

            (Context::TopLevel, JsonEvent::Key(key)) => Context::TopLevelValue(top_key(key)),
            (Context::TopLevel, _) => Context::Done,

            (Context::TopLevelValue(TopKey::TagName), JsonEvent::Value(Scalar::Str(tag))) => {
                if self.release.tag.is_none() {
                    debug!("Got release tag '{tag}'");
                    self.release.tag = Some(tag.to_owned());
                }
                Context::TopLevel
            }
            (Context::TopLevelValue(TopKey::Assets), JsonEvent::ArrayStart) => {
                Context::InAssetsArray
            }
            (Context::TopLevelValue(_), event) => skip_value(event, Resume::TopLevel),

            (Context::InAssetsArray, JsonEvent::ObjectStart) => {
                self.scratch.clear();
                Context::InAssetObject
            }
            (Context::InAssetsArray, JsonEvent::ArrayEnd) => Context::TopLevel,
            (Context::InAssetsArray, event) => skip_value(event, Resume::AssetsArray),

            (Context::InAssetObject, JsonEvent::Key(key)) => Context::AssetValue(asset_key(key)),
            (Context::InAssetObject, _) => {
                // Asset closed without both name and url
                self.scratch.clear();
                Context::InAssetsArray
            }

            (Context::AssetValue(key), JsonEvent::Value(Scalar::Str(value)))
                if key != AssetKey::Other =>
            {
                self.record_asset_field(key, value);
                Context::InAssetObject
            }
            (Context::AssetValue(_), event) => skip_value(event, Resume::AssetObject),

            (Context::Skip { depth, resume }, JsonEvent::ObjectStart | JsonEvent::ArrayStart) => {
                Context::Skip {
                    depth: depth + 1,
                    resume,
                }
            }
            (Context::Skip { depth, resume }, JsonEvent::ObjectEnd | JsonEvent::ArrayEnd) => {
                if depth <= 1 {
                    resume.into()
                } else {
                    Context::Skip {
                        depth: depth - 1,
                        resume,
                    }
                }
            }
            (skip @ Context::Skip { .. }, _) => skip,

            (Context::Done, _) => Context::Done,
        };
    }

    fn record_asset_field(&mut self, key: AssetKey, value: &str) {
        match key {
            AssetKey::Name => {
                debug!("Got file name for asset: {value}");
                self.scratch.name = Some(value.to_owned());
            }
            AssetKey::Url => {
                debug!("Got URL for asset: {value}");
                self.scratch.url = Some(value.to_owned());
            }
            AssetKey::Other => return,
        }

        if self.scratch.name.is_some() && self.scratch.url.is_some() {
            self.classify_scratch();
        }
    }

    fn classify_scratch(&mut self) {
        let (Some(name), Some(url)) = (self.scratch.name.take(), self.scratch.url.take()) else {
            return;
        };

        if self.release.firmware.is_none() && glob_match(&self.firmware_pattern, &name) {
            debug!("Valid firmware found: {name} - {url}");
            self.release.firmware = Some(ReleaseAsset { name, url });
        } else if self.release.storage.is_none()
            && self
                .storage_pattern
                .as_deref()
                .is_some_and(|pattern| glob_match(pattern, &name))
        {
            debug!("Valid storage asset found: {name} - {url}");
            self.release.storage = Some(ReleaseAsset { name, url });
        } else {
            debug!("Ignoring asset: {name}");
        }
    }
}

/// Decide the context after the first event of a value that is not wanted
fn skip_value(event: JsonEvent<'_>, resume: Resume) -> Context {
    match event {
        JsonEvent::ObjectStart | JsonEvent::ArrayStart => Context::Skip { depth: 1, resume },
        JsonEvent::Value(_) => resume.into(),
        // A key or close where a value belongs means the stream is malformed
        JsonEvent::Key(_) | JsonEvent::ObjectEnd | JsonEvent::ArrayEnd => Context::Done,
    }
}

fn top_key(key: &str) -> TopKey {
    if key.eq_ignore_ascii_case("tag_name") {
        TopKey::TagName
    } else if key.eq_ignore_ascii_case("assets") {
        TopKey::Assets
    } else {
        TopKey::Other
    }
}

fn asset_key(key: &str) -> AssetKey {
    if key.eq_ignore_ascii_case("name") {
        AssetKey::Name
    } else if key.eq_ignore_ascii_case("url") {
        AssetKey::Url
    } else {
        AssetKey::Other
    }
}

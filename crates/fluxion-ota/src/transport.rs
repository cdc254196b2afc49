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

//! HTTP transport used for release documents and asset downloads

use crate::config::{Credentials, OtaConfig};
use crate::error::{OtaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::ACCEPT;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

pub const ACCEPT_RELEASE_JSON: &str = "application/vnd.github+json";
pub const ACCEPT_OCTET_STREAM: &str = "application/octet-stream";

/// Below this many remaining API calls a warning is logged
const RATE_LIMIT_WARN_THRESHOLD: u32 = 10;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub accept: &'a str,
    pub credentials: Option<&'a Credentials>,
}

/// Response head plus the streamed body
pub struct Fetched {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl Fetched {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET and return once the response headers are available
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Fetched>;
}

/// `reqwest` backed transport; TLS comes from rustls
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &OtaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OtaError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Fetched> {
        let mut builder = self.client.get(request.url).header(ACCEPT, request.accept);

        if let Some(creds) = request.credentials {
            debug!("Using authenticated request to {}", request.url);
            builder = builder.basic_auth(creds.username(), Some(creds.token()));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OtaError::Transport(format!("Request failed: {e}")))?;

        if let Some(remaining) = response.headers().get("x-ratelimit-remaining")
            && let Ok(remaining_str) = remaining.to_str()
            && let Ok(remaining_int) = remaining_str.parse::<u32>()
        {
            debug!("API rate limit remaining: {remaining_int}");
            if remaining_int < RATE_LIMIT_WARN_THRESHOLD {
                warn!("API rate limit low: {remaining_int} remaining");
            }
        }

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| OtaError::Transport(format!("Body read failed: {e}"))))
            .boxed();

        Ok(Fetched {
            status,
            content_length,
            body,
        })
    }
}

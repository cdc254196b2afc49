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

//! Feeds release documents into the asset resolver
//!
//! `serde_json` does the tokenizing. Instead of building a value, a visitor
//! walks the document and forwards each structural event to the resolver, so
//! only the current key or string is ever buffered.

use crate::error::{OtaError, Result};
use crate::resolver::{AssetResolver, JsonEvent, Scalar};
use crate::transport::ByteStream;
use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::io::{self, BufReader, Read};
use tokio::sync::mpsc;
use tracing::warn;

/// Chunks buffered between the network and the parser thread
const CHUNK_QUEUE_DEPTH: usize = 8;

struct ValueSeed<'r> {
    resolver: &'r mut AssetResolver,
}

impl<'de> DeserializeSeed<'de> for ValueSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ValueSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Bool(v)));
        Ok(())
    }

    #[expect(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Number(v as f64)));
        Ok(())
    }

    #[expect(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Number(v as f64)));
        Ok(())
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Number(v)));
        Ok(())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Str(v)));
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Value(Scalar::Null));
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        let resolver = self.resolver;
        resolver.feed(JsonEvent::ObjectStart);
        while map
            .next_key_seed(KeySeed {
                resolver: &mut *resolver,
            })?
            .is_some()
        {
            map.next_value_seed(ValueSeed {
                resolver: &mut *resolver,
            })?;
        }
        resolver.feed(JsonEvent::ObjectEnd);
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        let resolver = self.resolver;
        resolver.feed(JsonEvent::ArrayStart);
        while seq
            .next_element_seed(ValueSeed {
                resolver: &mut *resolver,
            })?
            .is_some()
        {}
        resolver.feed(JsonEvent::ArrayEnd);
        Ok(())
    }
}

struct KeySeed<'r> {
    resolver: &'r mut AssetResolver,
}

impl<'de> DeserializeSeed<'de> for KeySeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_str(self)
    }
}

impl<'de> Visitor<'de> for KeySeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.resolver.feed(JsonEvent::Key(v));
        Ok(())
    }
}

/// Walk one JSON document from `reader`, feeding every event to `resolver`
///
/// Bytes after the first complete value are not read.
pub fn feed_reader<R: Read>(reader: R, resolver: &mut AssetResolver) -> serde_json::Result<()> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    ValueSeed { resolver }.deserialize(&mut deserializer)
}

pub fn feed_slice(document: &[u8], resolver: &mut AssetResolver) -> serde_json::Result<()> {
    let mut deserializer = serde_json::Deserializer::from_slice(document);
    ValueSeed { resolver }.deserialize(&mut deserializer)
}

/// Blocking reader over chunks arriving from an async task
struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Run `resolver` over a streamed release document
///
/// Malformed JSON is logged and whatever was matched before the error is
/// kept; a failing body stream is a transport error.
pub async fn resolve_stream(
    mut body: ByteStream,
    mut resolver: AssetResolver,
) -> Result<AssetResolver> {
    let (tx, rx) = mpsc::channel::<Bytes>(CHUNK_QUEUE_DEPTH);
    let parser = tokio::task::spawn_blocking(move || {
        let reader = BufReader::new(ChunkReader {
            rx,
            current: Bytes::new(),
        });
        let outcome = feed_reader(reader, &mut resolver);
        (resolver, outcome)
    });

    let mut body_error = None;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                // The parser hangs up once the document is complete
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                body_error = Some(e);
                break;
            }
        }
    }
    drop(tx);

    let (resolver, outcome) = parser
        .await
        .map_err(|e| OtaError::Transport(format!("Manifest parser task failed: {e}")))?;

    if let Some(e) = body_error {
        return Err(e);
    }
    if let Err(e) = outcome {
        warn!("Release document is not well-formed JSON: {e}");
    }
    Ok(resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    const MANIFEST: &str = r#"{
        "url": "https://api.github.com/repos/SolarE-cz/fluxion-fw/releases/1",
        "tag_name": "v2.0.0",
        "draft": false,
        "author": {"login": "ci", "id": 7, "site_admin": false},
        "assets": [
            {"name": "app.bin", "url": "https://x/app.bin", "size": 1024, "uploader": {"name": "x"}},
            {"name": "spiffs.bin", "url": "https://x/spiffs.bin", "label": null}
        ],
        "body": "Release notes"
    }"#;

    fn resolver() -> AssetResolver {
        AssetResolver::new("app*.bin", Some("spiffs*.bin".to_owned()))
    }

    fn chunked(document: &'static str, size: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes>> = document
            .as_bytes()
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    #[test]
    fn test_feed_slice() {
        let mut r = resolver();
        feed_slice(MANIFEST.as_bytes(), &mut r).unwrap();
        assert_eq!(r.release().tag.as_deref(), Some("v2.0.0"));
        assert_eq!(r.release().firmware.as_ref().unwrap().url, "https://x/app.bin");
        assert_eq!(r.release().storage.as_ref().unwrap().url, "https://x/spiffs.bin");
    }

    #[tokio::test]
    async fn test_resolve_stream_small_chunks() {
        let r = resolve_stream(chunked(MANIFEST, 3), resolver()).await.unwrap();
        assert!(r.is_valid());
        assert_eq!(r.release().storage.as_ref().unwrap().name, "spiffs.bin");
    }

    #[tokio::test]
    async fn test_resolve_stream_keeps_matches_before_syntax_error() {
        let broken = r#"{"tag_name":"v1.0.0","assets":[{"name":"app.bin","url":"https://x/a"},{"name": oops"#;
        let r = resolve_stream(chunked(broken, 16), resolver()).await.unwrap();
        assert_eq!(r.release().tag.as_deref(), Some("v1.0.0"));
        assert!(r.is_valid());
    }

    #[tokio::test]
    async fn test_resolve_stream_body_error() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(br#"{"tag_name":"#)),
            Err(OtaError::Transport("connection reset".to_owned())),
        ];
        let result = resolve_stream(stream::iter(chunks).boxed(), resolver()).await;
        assert!(matches!(result, Err(OtaError::Transport(_))));
    }

    #[tokio::test]
    async fn test_resolve_stream_empty_body() {
        let r = resolve_stream(stream::empty().boxed(), resolver()).await.unwrap();
        assert!(!r.is_valid());
        assert!(!r.release().tag_captured());
    }
}

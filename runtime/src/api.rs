//! Image-stream API client.
//!
//! Provides the two remote collaborators of the controller:
//! - the watch feed of image streams (list, then a streaming watch, with a
//!   periodic re-delivery of everything known), and
//! - image metadata lookup (ordered layer blobs of a manifest digest).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use explode_core::config::ExplodeConfig;
use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, ImageStream, Layer, TagEvent, WatchEvent, WatchEventKind};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::metadata::ImageMetadataSource;

/// Delay before retrying a failed list or watch request.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Authenticated client for the image-stream API.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    namespace: Option<String>,
    resync_interval: Duration,
}

impl ApiClient {
    pub fn new(config: &ExplodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| ExplodeError::ConfigError(format!("Could not create API client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            resync_interval: config.resync_interval,
        })
    }

    /// Image-stream collection URL for the configured scope.
    fn streams_url(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/oapi/v1/namespaces/{}/imagestreams", self.base_url, ns),
            None => format!("{}/oapi/v1/imagestreams", self.base_url),
        }
    }

    fn image_url(&self, digest: &Digest) -> String {
        format!("{}/oapi/v1/images/{}", self.base_url, digest)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ExplodeError::Api {
                status: 0,
                message: format!("{}: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExplodeError::Api {
                status: status.as_u16(),
                message: format!("{}: {}", url, body.trim()),
            });
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.get(url).await?.bytes().await.map_err(|e| ExplodeError::Api {
            status: 0,
            message: format!("{}: {}", url, e),
        })?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Verify the credential may list image streams in scope and images.
    pub async fn check_permissions(&self) -> Result<()> {
        let streams = self.get(&self.streams_url()).await.err();
        let images = self
            .get(&format!("{}/oapi/v1/images?limit=1", self.base_url))
            .await
            .err();

        if streams.is_none() && images.is_none() {
            return Ok(());
        }
        let describe = |e: &Option<ExplodeError>| {
            e.as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "ok".to_string())
        };
        Err(ExplodeError::PermissionError(format!(
            "Client does not have appropriate privileges (imagestreams: {}; images: {})",
            describe(&streams),
            describe(&images)
        )))
    }

    /// All image streams in scope and the list's resource version.
    pub async fn list_image_streams(&self) -> Result<(Vec<ImageStream>, Option<String>)> {
        let list: ImageStreamList = self.get_json(&self.streams_url()).await?;
        let streams = list.items.into_iter().map(ImageStream::from).collect();
        Ok((streams, list.metadata.resource_version))
    }

    /// Feed image-stream changes into `tx` until shutdown or until the
    /// receiver is dropped.
    ///
    /// Starts with a full list delivered as ADDED, then follows the watch
    /// stream. Every resync interval the known streams are re-delivered as
    /// UPDATED. Errors are retried after a delay.
    pub async fn watch(
        &self,
        tx: mpsc::Sender<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut feed = Feed::new(tx);
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.tick().await;

        let mut resource_version: Option<String> = None;
        tracing::info!(url = %self.streams_url(), "Watching ImageStreams");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let version = match resource_version.take() {
                Some(version) => version,
                None => match self.list_image_streams().await {
                    Ok((streams, version)) => {
                        if !feed.replace(streams, &mut shutdown).await {
                            return Ok(());
                        }
                        version.unwrap_or_default()
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not list ImageStreams");
                        if !pause(&mut shutdown).await {
                            return Ok(());
                        }
                        continue;
                    }
                },
            };

            let url = format!(
                "{}?watch=true&resourceVersion={}",
                self.streams_url(),
                version
            );
            let response = match self.get(&url).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not watch ImageStreams");
                    if !pause(&mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut current_version = Some(version);

            loop {
                tokio::select! {
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                                let line: Vec<u8> = buffer.drain(..=pos).collect();
                                match decode_line(&line) {
                                    Ok(Some(WatchLine::Change(kind, stream, version))) => {
                                        if version.is_some() {
                                            current_version = version;
                                        }
                                        if !feed.apply(kind, stream, &mut shutdown).await {
                                            return Ok(());
                                        }
                                    }
                                    Ok(Some(WatchLine::Error(message))) => {
                                        tracing::warn!(message = %message, "Watch error, relisting");
                                        current_version = None;
                                        break;
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Could not decode watch event");
                                    }
                                }
                            }
                            if current_version.is_none() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Watch stream failed");
                            break;
                        }
                        None => {
                            tracing::debug!("Watch stream closed by server");
                            break;
                        }
                    },
                    _ = resync.tick() => {
                        tracing::debug!(streams = feed.len(), "Resync");
                        if !feed.resync(&mut shutdown).await {
                            return Ok(());
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }

            resource_version = current_version;
        }
    }
}

#[async_trait]
impl ImageMetadataSource for ApiClient {
    async fn image_layers(&self, digest: &Digest) -> Result<Vec<Layer>> {
        let fetch_error = |message: String| ExplodeError::MetadataFetch {
            digest: digest.to_string(),
            message,
        };

        let image: Image = self
            .get_json(&self.image_url(digest))
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        image
            .docker_image_layers
            .unwrap_or_default()
            .into_iter()
            .map(|layer| {
                let blob = Digest::parse(&layer.name).map_err(|e| fetch_error(e.to_string()))?;
                Ok(Layer {
                    blob_digest: blob,
                    size: layer.size,
                })
            })
            .collect()
    }
}

/// Known streams plus the outbound channel.
struct Feed {
    tx: mpsc::Sender<WatchEvent>,
    known: HashMap<(String, String), ImageStream>,
}

impl Feed {
    fn new(tx: mpsc::Sender<WatchEvent>) -> Self {
        Self {
            tx,
            known: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.known.len()
    }

    /// Reconcile the known set against a fresh list.
    async fn replace(
        &mut self,
        streams: Vec<ImageStream>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut fresh: HashMap<(String, String), ImageStream> = streams
            .into_iter()
            .map(|s| ((s.namespace.clone(), s.name.clone()), s))
            .collect();

        let gone: Vec<ImageStream> = self
            .known
            .iter()
            .filter(|(key, _)| !fresh.contains_key(*key))
            .map(|(_, stream)| stream.clone())
            .collect();
        for stream in gone {
            if !self.apply(WatchEventKind::Deleted, stream, shutdown).await {
                return false;
            }
        }

        let mut keys: Vec<(String, String)> = fresh.keys().cloned().collect();
        keys.sort();
        for key in keys {
            if let Some(stream) = fresh.remove(&key) {
                if !self.apply(WatchEventKind::Added, stream, shutdown).await {
                    return false;
                }
            }
        }
        true
    }

    async fn apply(
        &mut self,
        kind: WatchEventKind,
        stream: ImageStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let key = (stream.namespace.clone(), stream.name.clone());
        let kind = match kind {
            WatchEventKind::Deleted => {
                self.known.remove(&key);
                WatchEventKind::Deleted
            }
            _ => {
                let seen = self.known.insert(key, stream.clone()).is_some();
                if seen {
                    WatchEventKind::Updated
                } else {
                    WatchEventKind::Added
                }
            }
        };
        self.send(WatchEvent::new(kind, stream), shutdown).await
    }

    async fn resync(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let streams: Vec<ImageStream> = self.known.values().cloned().collect();
        for stream in streams {
            if !self
                .send(WatchEvent::new(WatchEventKind::Updated, stream), shutdown)
                .await
            {
                return false;
            }
        }
        true
    }

    /// Deliver one event; false when delivery should stop.
    async fn send(&self, event: WatchEvent, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    tracing::debug!("Event receiver dropped");
                }
                sent.is_ok()
            }
            _ = shutdown.changed() => false,
        }
    }
}

/// Sleep for [`RETRY_DELAY`]; false if shutdown arrived first.
async fn pause(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RETRY_DELAY) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

enum WatchLine {
    Change(WatchEventKind, ImageStream, Option<String>),
    Error(String),
}

fn decode_line(line: &[u8]) -> Result<Option<WatchLine>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let event: RawWatchEvent = serde_json::from_slice(line)?;
    let kind = match event.kind.as_str() {
        "ADDED" => WatchEventKind::Added,
        "MODIFIED" => WatchEventKind::Updated,
        "DELETED" => WatchEventKind::Deleted,
        "ERROR" => {
            let status: Status = serde_json::from_value(event.object).unwrap_or_default();
            return Ok(Some(WatchLine::Error(format!(
                "{} {}",
                status.code.unwrap_or_default(),
                status.message
            ))));
        }
        other => {
            tracing::debug!(kind = %other, "Ignoring watch event");
            return Ok(None);
        }
    };
    let raw: RawImageStream = serde_json::from_value(event.object)?;
    let version = raw.metadata.resource_version.clone();
    Ok(Some(WatchLine::Change(kind, raw.into(), version)))
}

// Wire types

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageStreamList {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    items: Vec<RawImageStream>,
}

#[derive(Debug, Deserialize)]
struct RawImageStream {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: StreamStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamStatus {
    #[serde(default)]
    docker_image_repository: String,
    #[serde(default)]
    tags: Option<Vec<NamedTagEventList>>,
}

#[derive(Debug, Deserialize)]
struct NamedTagEventList {
    tag: String,
    #[serde(default)]
    items: Option<Vec<RawTagEvent>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTagEvent {
    #[serde(default)]
    docker_image_reference: String,
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Image {
    #[serde(default)]
    docker_image_layers: Option<Vec<ImageLayer>>,
}

#[derive(Debug, Deserialize)]
struct ImageLayer {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

impl From<RawImageStream> for ImageStream {
    fn from(raw: RawImageStream) -> Self {
        let mut stream = ImageStream::new(raw.metadata.namespace, raw.metadata.name);
        stream.docker_image_repository = raw.status.docker_image_repository;
        for list in raw.status.tags.unwrap_or_default() {
            let history = list
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|e| TagEvent::new(e.image, e.docker_image_reference))
                .collect();
            stream.tags.insert(list.tag, history);
        }
        stream
    }
}

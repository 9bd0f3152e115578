//! JetStream context: a request/reply facade over the `$JS.API` subject tree.
//!
//! # Purpose
//! Builds JSON requests, sends them through the client's request/reply, and
//! maps replies to typed values. Covers stream lifecycle, purge, publish
//! acknowledgements, rollup publishes, and direct gets.
//!
//! # Design notes
//! Replies parse to a generic JSON value first; a non-null `error` member is
//! raised before the rest is mapped field-by-field to the typed DTO. Filtered
//! stream info paginates with the request `offset` until a page adds no new
//! subjects, so large subject maps are never silently truncated.
use bytes::Bytes;
use natsock_client::{Client, Message};
use natsock_wire::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub use types::{
    ApiError, Compression, DirectGetRequest, DiscardPolicy, PubAck, PurgeRequest, RetentionPolicy,
    StorageType, StreamConfig, StreamInfo, StreamInfoRequest, StreamState,
};

mod types;

/// Header that makes a publish replace earlier messages on its subject.
pub const NATS_ROLLUP: &str = "Nats-Rollup";
/// Rollup scope: replace prior messages on the same subject.
pub const ROLLUP_SUBJECT: &str = "sub";
/// Response header carrying the stream sequence of a direct-get reply.
pub const NATS_SEQUENCE: &str = "Nats-Sequence";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("jetstream api error: {0}")]
    Api(ApiError),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("request: {0}")]
    Request(#[from] natsock_client::Error),
    #[error("bad api response: {0}")]
    Response(#[from] serde_json::Error),
}

const API_NOT_FOUND: u64 = 404;

/// Facade over one client connection. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    client: Client,
    prefix: String,
}

impl Context {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prefix: "$JS.API".to_string(),
        }
    }

    /// Target a JetStream domain: requests go to `$JS.<domain>.API.*`.
    pub fn with_domain(client: Client, domain: &str) -> Self {
        Self {
            client,
            prefix: format!("$JS.{domain}.API"),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api_subject(&self, operation: &str) -> String {
        format!("{}.{operation}", self.prefix)
    }

    /// Create (or update, server permitting) a stream.
    pub async fn stream_create(&self, config: StreamConfig) -> Result<StreamInfo> {
        let subject = self.api_subject(&format!("STREAM.CREATE.{}", config.name));
        let payload = serde_json::to_vec(&config)?;
        debug!(stream = %config.name, "creating stream");
        self.api_request(&subject, payload.into()).await
    }

    pub async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let subject = self.api_subject(&format!("STREAM.INFO.{name}"));
        self.api_request(&subject, Bytes::new())
            .await
            .map_err(|err| mark_stream_not_found(err, name))
    }

    /// Stream info restricted to subjects matching `filter`, with per-subject
    /// message counts. Pages through the server's subject map via `offset`.
    pub async fn stream_info_with_subjects(&self, name: &str, filter: &str) -> Result<StreamInfo> {
        let subject = self.api_subject(&format!("STREAM.INFO.{name}"));
        let mut collected = std::collections::HashMap::new();
        let mut offset = 0u64;
        loop {
            let request = StreamInfoRequest {
                subjects_filter: Some(filter.to_string()),
                offset: Some(offset),
            };
            let payload = serde_json::to_vec(&request)?;
            let mut info: StreamInfo = self
                .api_request(&subject, payload.into())
                .await
                .map_err(|err| mark_stream_not_found(err, name))?;
            let page = std::mem::take(&mut info.state.subjects);
            let fresh = page
                .keys()
                .filter(|subject| !collected.contains_key(*subject))
                .count();
            if page.is_empty() || fresh == 0 {
                info.state.subjects = collected;
                return Ok(info);
            }
            offset += page.len() as u64;
            collected.extend(page);
        }
    }

    pub async fn stream_delete(&self, name: &str) -> Result<()> {
        let subject = self.api_subject(&format!("STREAM.DELETE.{name}"));
        let _: Value = self
            .api_request(&subject, Bytes::new())
            .await
            .map_err(|err| mark_stream_not_found(err, name))?;
        Ok(())
    }

    /// Purge messages, optionally bounded by subject filter, sequence, or a
    /// count of messages to keep.
    pub async fn stream_purge(&self, name: &str, request: PurgeRequest) -> Result<()> {
        let subject = self.api_subject(&format!("STREAM.PURGE.{name}"));
        let payload = serde_json::to_vec(&request)?;
        let _: Value = self
            .api_request(&subject, payload.into())
            .await
            .map_err(|err| mark_stream_not_found(err, name))?;
        Ok(())
    }

    /// Publish expecting a stream acknowledgement.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck> {
        let reply = self.client.request(subject, payload).await?;
        parse_pub_ack(&reply.payload)
    }

    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<PubAck> {
        let reply = self
            .client
            .request_with_headers(subject, headers, payload)
            .await?;
        parse_pub_ack(&reply.payload)
    }

    /// Publish with `Nats-Rollup: sub` so this message replaces every earlier
    /// one on the same subject.
    pub async fn publish_with_rollup(&self, subject: &str, payload: Bytes) -> Result<PubAck> {
        let mut headers = HeaderMap::new();
        headers.append(NATS_ROLLUP, ROLLUP_SUBJECT);
        self.publish_with_headers(subject, headers, payload).await
    }

    /// Low-latency read of one message. A 404 status resolves to `Ok(None)`
    /// rather than an error; the reply's headers carry `Nats-Sequence`.
    pub async fn direct_get(
        &self,
        stream: &str,
        request: DirectGetRequest,
    ) -> Result<Option<Message>> {
        let subject = self.api_subject(&format!("DIRECT.GET.{stream}"));
        let payload = serde_json::to_vec(&request)?;
        let reply = self.client.request(&subject, payload.into()).await?;
        match reply.status() {
            Some(code) if code == API_NOT_FOUND as u16 => Ok(None),
            Some(code) if code >= 400 => Err(Error::Api(ApiError {
                code: code as u64,
                err_code: 0,
                description: reply
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.description())
                    .unwrap_or("direct get failed")
                    .to_string(),
            })),
            _ => Ok(Some(reply)),
        }
    }

    async fn api_request<T: DeserializeOwned>(&self, subject: &str, payload: Bytes) -> Result<T> {
        let reply = self.client.request(subject, payload).await?;
        let value: Value = serde_json::from_slice(&reply.payload)?;
        if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
            let api: ApiError = serde_json::from_value(error.clone())?;
            return Err(Error::Api(api));
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn mark_stream_not_found(err: Error, name: &str) -> Error {
    match err {
        Error::Api(api) if api.code == API_NOT_FOUND => Error::StreamNotFound(name.to_string()),
        other => other,
    }
}

fn parse_pub_ack(payload: &[u8]) -> Result<PubAck> {
    let value: Value = serde_json::from_slice(payload)?;
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        return Err(match error {
            Value::String(text) => Error::Publish(text.clone()),
            other => match serde_json::from_value::<ApiError>(other.clone()) {
                Ok(api) => Error::Api(api),
                Err(err) => Error::Response(err),
            },
        });
    }
    Ok(serde_json::from_value(value)?)
}

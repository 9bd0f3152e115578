//! Object metadata records, subject layout, and name validation.
//!
//! Metadata lives on `$O.<bucket>.M.<base64url(name)>` and is rollup-replaced
//! so only the latest revision survives; chunks live on `$O.<bucket>.C.<nuid>`.
use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default chunk size for uploads: 128 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Caller-supplied description of an object being put.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub name: String,
    pub description: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub headers: Option<HashMap<String, Vec<String>>>,
    pub max_chunk_size: Option<usize>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = Some(size.max(1));
        self
    }
}

/// The persisted metadata record; the sole source of truth for an object's
/// existence. A record with `deleted` set masks any surviving chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    pub bucket: String,
    pub nuid: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub chunks: u64,
    /// `SHA-256=<standard base64 of the 32-byte hash>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ObjectOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunk_size: Option<u64>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

pub(crate) fn stream_name(bucket: &str) -> String {
    format!("OBJ_{bucket}")
}

pub(crate) fn chunk_subject(bucket: &str, nuid: &str) -> String {
    format!("$O.{bucket}.C.{nuid}")
}

pub(crate) fn chunk_wildcard(bucket: &str) -> String {
    format!("$O.{bucket}.C.>")
}

pub(crate) fn meta_subject(bucket: &str, name: &str) -> String {
    format!("$O.{bucket}.M.{}", URL_SAFE.encode(name))
}

pub(crate) fn meta_wildcard(bucket: &str) -> String {
    format!("$O.{bucket}.M.>")
}

pub(crate) fn digest_string(hash: &[u8]) -> String {
    format!("SHA-256={}", STANDARD.encode(hash))
}

/// Bucket names are restricted to `[A-Za-z0-9_-]`, non-empty, and must not
/// begin or end with a dot.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.ends_with('.') {
        return Err(Error::InvalidBucketName(name.to_string()));
    }
    let valid = name
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-');
    if !valid {
        return Err(Error::InvalidBucketName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidObjectName);
    }
    Ok(())
}

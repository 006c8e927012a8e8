//! LFS Batch API types.
//!
//! The Batch API is used to request upload/download URLs for LFS objects.
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{Oid, Pointer};

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Download => "download",
            Operation::Upload => "upload",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch request to the LFS server.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// The operation to perform.
    pub operation: Operation,
    /// The transfer adapters the client supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    /// Reference information (branch, etc).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<RefInfo>,
    /// The objects to operate on.
    pub objects: Vec<ObjectSpec>,
}

/// Reference information for batch and lock requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    /// The reference name (e.g., "refs/heads/main").
    pub name: String,
}

/// An object in a batch request: what we want to move, and how big it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectSpec {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: u64,
}

/// A batch response from the LFS server.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    /// The transfer adapter to use (usually "basic").
    #[serde(default = "default_transfer")]
    pub transfer: String,
    /// The objects with their actions.
    pub objects: Vec<BatchObject>,
}

fn default_transfer() -> String {
    "basic".to_string()
}

/// An object in a batch response.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: u64,
    /// Whether the object was authenticated.
    #[serde(default)]
    pub authenticated: Option<bool>,
    /// Actions available for this object.
    #[serde(default)]
    pub actions: Option<HashMap<String, Action>>,
    /// Error information if the object failed.
    #[serde(default)]
    pub error: Option<BatchError>,
}

/// An action (upload/download URL) for an object.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    /// The URL for the action.
    pub href: String,
    /// HTTP headers to include in the request.
    #[serde(default)]
    pub header: HashMap<String, String>,
    /// Seconds until the action expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiration time (ISO 8601).
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchError {
    /// HTTP status code.
    pub code: u16,
    /// Error message.
    pub message: String,
}

impl BatchRequest {
    /// Create a new batch request for the given operation.
    pub fn new(operation: Operation, objects: Vec<ObjectSpec>) -> Self {
        BatchRequest {
            operation,
            transfers: Some(vec!["basic".to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Create a new batch request for downloading objects.
    pub fn download(objects: Vec<ObjectSpec>) -> Self {
        BatchRequest::new(Operation::Download, objects)
    }

    /// Create a new batch request for uploading objects.
    pub fn upload(objects: Vec<ObjectSpec>) -> Self {
        BatchRequest::new(Operation::Upload, objects)
    }

    /// Set the reference for this request.
    pub fn with_ref(mut self, name: &str) -> Self {
        self.r#ref = Some(RefInfo {
            name: name.to_string(),
        });
        self
    }
}

impl ObjectSpec {
    /// Create a new batch request object.
    pub fn new(oid: &str, size: u64) -> Self {
        ObjectSpec {
            oid: oid.to_string(),
            size,
        }
    }
}

impl From<&Pointer> for ObjectSpec {
    fn from(pointer: &Pointer) -> Self {
        ObjectSpec::new(&pointer.oid().to_hex(), pointer.size())
    }
}

impl BatchObject {
    /// Get the download action if available.
    pub fn download_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("download")
    }

    /// Get the upload action if available.
    pub fn upload_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("upload")
    }

    /// Get the verify action if available (for uploads).
    pub fn verify_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("verify")
    }

    /// The action matching `operation`.
    pub fn action_for(&self, operation: Operation) -> Option<&Action> {
        match operation {
            Operation::Download => self.download_action(),
            Operation::Upload => self.upload_action(),
        }
    }

    /// Check if this object has an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Action {
    /// Absolute expiry of this action, relative to `issued_at`.
    ///
    /// `expires_in` wins over `expires_at` when both are present.
    pub fn expiry(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(secs) = self.expires_in {
            return Some(issued_at + ChronoDuration::seconds(secs));
        }
        self.expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A negotiated transfer of one object. Valid until `expires_at`.
#[derive(Debug, Clone)]
pub struct TransferAction {
    pub oid: Oid,
    pub size: u64,
    pub operation: Operation,
    pub href: String,
    pub headers: HashMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Follow-up verify call after an upload, if the server wants one.
    pub verify: Option<VerifyAction>,
}

/// Verify callback for a completed upload.
#[derive(Debug, Clone)]
pub struct VerifyAction {
    pub href: String,
    pub headers: HashMap<String, String>,
}

impl TransferAction {
    /// Whether the action can no longer be used at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

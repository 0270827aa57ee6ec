//! Registry DTOs
//!
//! Payloads returned by the remote registry's token and image listing
//! endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::image::{LATEST_TAG, MASTER_TAG_PREFIX};

/// Anonymous bearer token issued by the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryToken {
    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub scope: String,

    #[serde(default)]
    pub expires_in: i64,
}

impl RegistryToken {
    /// The credential to send, preferring `token` over `access_token`
    pub fn bearer(&self) -> &str {
        if self.token.is_empty() {
            &self.access_token
        } else {
            &self.token
        }
    }
}

/// One tag of the runner image family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTag {
    #[serde(default)]
    pub repo: String,

    pub tag: String,

    #[serde(default)]
    pub digest: String,

    /// RFC 3339 timestamp, kept raw so one bad entry does not fail the listing
    #[serde(default)]
    pub timestamp: String,
}

impl RemoteTag {
    pub fn created(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(&self.timestamp).map(|t| t.with_timezone(&Utc))
    }

    pub fn is_latest(&self) -> bool {
        self.tag == LATEST_TAG
    }

    pub fn is_master(&self) -> bool {
        self.tag.starts_with(MASTER_TAG_PREFIX)
    }
}

/// Response of the image listing endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagListing {
    #[serde(default)]
    pub tags: Vec<RemoteTag>,
}

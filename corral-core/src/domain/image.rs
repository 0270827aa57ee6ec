//! Runner image domain model
//!
//! A runner image is identified by a full reference such as
//! `iad.ocir.io/odx-pipelines/wercker/wercker-runner:master-42`. Locally the
//! tag is what identifies it; remotely the digest correlates a moving tag
//! (`latest`) with a stable commit-scoped tag (`master-<n>`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository path of the runner image family in the remote registry
pub const DEFAULT_IMAGE_REPOSITORY: &str = "iad.ocir.io/odx-pipelines/wercker/wercker-runner";

/// Substring that identifies runner image tags among unrelated local images
pub const DEFAULT_IMAGE_FAMILY_MARKER: &str = "wercker/wercker-runner:";

/// Tag that always points at the current release
pub const LATEST_TAG: &str = "latest";

/// Prefix of tags built from the main branch
pub const MASTER_TAG_PREFIX: &str = "master";

/// A resolved runner image
///
/// Recomputed on every resolution and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Full image reference including the tag
    pub name: String,

    /// When the image was built
    pub created: DateTime<Utc>,

    /// Content digest, when the source reports one
    pub digest: Option<String>,
}

impl ImageRecord {
    pub fn new(name: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Returns the tag portion of the reference (`latest` when untagged)
    pub fn tag(&self) -> &str {
        split_reference(&self.name).1
    }
}

/// Splits an image reference into repository and tag
///
/// Only a colon after the last slash separates the tag, so registry ports
/// (`host:5000/repo`) are kept in the repository part.
pub fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, LATEST_TAG),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference() {
        assert_eq!(
            split_reference("iad.ocir.io/odx/wercker-runner:master-1"),
            ("iad.ocir.io/odx/wercker-runner", "master-1")
        );
        assert_eq!(split_reference("busybox"), ("busybox", "latest"));
        assert_eq!(
            split_reference("localhost:5000/runner"),
            ("localhost:5000/runner", "latest")
        );
    }

    #[test]
    fn test_record_tag() {
        let record = ImageRecord::new("a/wercker-runner:latest", Utc::now()).with_digest("sha256:x");
        assert_eq!(record.tag(), "latest");
        assert_eq!(record.digest.as_deref(), Some("sha256:x"));
    }
}

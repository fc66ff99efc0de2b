use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Scheme used for working copies that have never been persisted.
pub const UNTITLED_SCHEME: &str = "untitled";

/// The `(type, resource)` pair that uniquely names a working copy.
///
/// Two working copies are the same entity iff their identities are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkingCopyIdentity {
    pub type_id: String,
    pub resource: Url,
}

impl WorkingCopyIdentity {
    pub fn new(type_id: impl Into<String>, resource: Url) -> Self {
        Self {
            type_id: type_id.into(),
            resource,
        }
    }

    /// Whether this identity addresses an untitled (never persisted) document.
    pub fn is_untitled(&self) -> bool {
        self.resource.scheme() == UNTITLED_SCHEME
    }

    /// Human readable name, the last path segment of the resource.
    pub fn name(&self) -> String {
        basename(&self.resource)
    }

    /// Same type, different resource.
    pub fn with_resource(&self, resource: Url) -> Self {
        Self {
            type_id: self.type_id.clone(),
            resource,
        }
    }
}

impl fmt::Display for WorkingCopyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.resource)
    }
}

/// Last non-empty path segment of `resource`, falling back to the full path.
pub(crate) fn basename(resource: &Url) -> String {
    resource
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .unwrap_or_else(|| resource.path().to_string())
}

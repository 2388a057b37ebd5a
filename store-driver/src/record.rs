//! The versioned server record and its registry-owned metadata.

use std::{convert::Infallible, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote endpoint through which a server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Transport type, e.g. `streamable-http` or `sse`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub transport: String,

    /// Endpoint URL; `url` filters match it exactly.
    pub url: String,

    /// Fields the registry does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Remote {
    /// A remote with the given transport type and URL.
    pub fn new(transport: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            url: url.into(),
            extra: Default::default(),
        }
    }
}

/// The public server document.
///
/// Only the fields the registry needs to index are typed; everything else
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerJson {
    /// Namespaced server name, e.g. `io.github.user/server`.
    pub name: String,

    /// Version string, unique per name. Not parsed or ordered.
    pub version: String,

    /// Human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Endpoints where the server is hosted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<Remote>,

    /// Fields the registry does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerJson {
    /// A bare document with only a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            remotes: Vec::new(),
            extra: Default::default(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a remote endpoint.
    pub fn with_remote(mut self, remote: Remote) -> Self {
        self.remotes.push(remote);
        self
    }

    /// Whether any remote endpoint has exactly this URL.
    pub fn has_remote_url(&self, url: &str) -> bool {
        self.remotes.iter().any(|remote| remote.url == url)
    }
}

/// Lifecycle status of a server version.
///
/// Unknown values are preserved so newer registries can add states.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    /// Published and in use. The default.
    #[default]
    Active,
    /// Still served, but clients should move on.
    Deprecated,
    /// Withdrawn. The record is kept for history.
    Deleted,
    /// A status this version of the registry does not know.
    Other(String),
}

impl Status {
    /// The wire form, e.g. `active`.
    pub fn as_str(&self) -> &str {
        match self {
            Status::Active => "active",
            Status::Deprecated => "deprecated",
            Status::Deleted => "deleted",
            Status::Other(other) => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Status::Active,
            "deprecated" => Status::Deprecated,
            "deleted" => Status::Deleted,
            other => Status::Other(other.to_owned()),
        })
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.as_str() {
            "active" => Status::Active,
            "deprecated" => Status::Deprecated,
            "deleted" => Status::Deleted,
            _ => Status::Other(value),
        }
    }
}

impl From<Status> for String {
    fn from(value: Status) -> Self {
        match value {
            Status::Other(other) => other,
            status => status.as_str().to_owned(),
        }
    }
}

/// Registry-owned metadata, not part of the public payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryExtensions {
    /// Lifecycle status.
    pub status: Status,
    /// When the version was first published. Never changes.
    pub published_at: DateTime<Utc>,
    /// Last modification. Never earlier than `published_at`.
    pub updated_at: DateTime<Utc>,
    /// Whether this is the current version of its name.
    pub is_latest: bool,
}

impl RegistryExtensions {
    /// Metadata for a freshly published version: active, latest, timestamps at `now`.
    pub fn published(now: DateTime<Utc>) -> Self {
        Self {
            status: Status::Active,
            published_at: now,
            updated_at: now,
            is_latest: true,
        }
    }

    /// Clamp `updated_at` so it never precedes `published_at`.
    pub fn normalized(mut self) -> Self {
        if self.updated_at < self.published_at {
            self.updated_at = self.published_at;
        }
        self
    }
}

/// Advance an `updated_at` timestamp without ever moving it backwards.
pub fn touch(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.max(now)
}

/// A server version as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// The public document.
    pub server: ServerJson,
    /// Registry-owned metadata.
    pub meta: RegistryExtensions,
}

impl ServerRecord {
    /// Server name.
    pub fn name(&self) -> &str {
        &self.server.name
    }

    /// Server version.
    pub fn version(&self) -> &str {
        &self.server.version
    }

    /// Whether this is the current version of its name.
    pub fn is_latest(&self) -> bool {
        self.meta.is_latest
    }
}

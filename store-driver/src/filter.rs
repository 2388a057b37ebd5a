//! Listing filters and pagination cursors shared by every backend.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

use crate::record::{RegistryExtensions, ServerJson};

/// Predicate for `list_servers`. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    /// Exact server name.
    pub name: Option<String>,

    /// Exact version.
    pub version: Option<String>,

    /// Only latest (or only non-latest) versions.
    pub is_latest: Option<bool>,

    /// Case-insensitive substring of the server name.
    pub substring_name: Option<String>,

    /// Only records updated strictly after this instant.
    pub updated_since: Option<DateTime<Utc>>,

    /// Only records exposing a remote endpoint with exactly this URL.
    pub remote_url: Option<String>,
}

impl ServerFilter {
    /// Match this exact server name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Match this exact version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Match on the latest flag.
    pub fn latest(mut self, is_latest: bool) -> Self {
        self.is_latest = Some(is_latest);
        self
    }

    /// Match names containing `needle`, ignoring case.
    pub fn substring_name(mut self, needle: impl Into<String>) -> Self {
        self.substring_name = Some(needle.into());
        self
    }

    /// Match records updated strictly after `since`.
    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    /// Match records with a remote at exactly `url`.
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Evaluate the predicate against a decoded record.
    pub fn matches(&self, server: &ServerJson, meta: &RegistryExtensions) -> bool {
        if let Some(name) = &self.name {
            if &server.name != name {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if &server.version != version {
                return false;
            }
        }
        if let Some(is_latest) = self.is_latest {
            if meta.is_latest != is_latest {
                return false;
            }
        }
        if let Some(needle) = &self.substring_name {
            if !server
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(since) = self.updated_since {
            if meta.updated_at <= since {
                return false;
            }
        }
        if let Some(url) = &self.remote_url {
            if !server.has_remote_url(url) {
                return false;
            }
        }
        true
    }
}

/// Scan-resume position: the `(name, version)` of the last record returned.
///
/// Serialized as `name:version`. Server names never contain `:`, so the
/// token is split at the first colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// Name of the last record returned.
    pub name: String,
    /// Version of the last record returned.
    pub version: String,
}

impl Cursor {
    /// A cursor positioned after `name@version`.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse a client-supplied token. Malformed tokens yield `None`, which
    /// backends treat as "start from the beginning".
    pub fn parse(token: &str) -> Option<Self> {
        token.parse().ok()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// A cursor token without a `name:version` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCursor(pub String);

impl fmt::Display for InvalidCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cursor: {:?}", self.0)
    }
}

impl std::error::Error for InvalidCursor {}

impl FromStr for Cursor {
    type Err = InvalidCursor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Cursor::new(name, version))
            }
            _ => Err(InvalidCursor(s.to_owned())),
        }
    }
}

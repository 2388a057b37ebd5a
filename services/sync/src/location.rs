//! Object references carried by queue notifications.

use std::{fmt, str::FromStr};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::SyncError;

const AWS_DOMAIN: &str = ".amazonaws.com";

/// A bucket and key in an S3-compatible object store.
///
/// Parsed from either the short `s3://bucket/key` form or one of the HTTPS
/// URL shapes S3 hands out:
///
/// * `https://bucket.s3.<region>.amazonaws.com/key`
/// * `https://bucket.s3.amazonaws.com/key`
/// * `https://s3.<region>.amazonaws.com/bucket/key`
/// * `https://s3.amazonaws.com/bucket/key`
///
/// ```
/// use registry_sync::ObjectLocation;
///
/// let location: ObjectLocation = "https://snapshots.s3.us-east-1.amazonaws.com/registry/servers.json"
///     .parse()
///     .unwrap();
/// assert_eq!(location.bucket, "snapshots");
/// assert_eq!(location.key, "registry/servers.json");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,

    /// Object key, without a leading slash.
    pub key: String,
}

impl ObjectLocation {
    /// Build a location from its parts.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectLocation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SyncError::invalid(s, "empty reference"));
        }

        if let Some(rest) = s.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| SyncError::invalid(s, "missing object key"))?;
            return located(s, bucket, key.to_owned());
        }

        let url = Url::parse(s).map_err(|_| SyncError::invalid(s, "not a URL"))?;
        if url.scheme() != "https" {
            return Err(SyncError::invalid(s, "unsupported scheme"));
        }

        let host = url
            .host_str()
            .ok_or_else(|| SyncError::invalid(s, "missing host"))?;
        let service = host
            .strip_suffix(AWS_DOMAIN)
            .ok_or_else(|| SyncError::invalid(s, "not an S3 host"))?;
        let path = url.path().trim_start_matches('/');

        // Virtual-hosted: <bucket>.s3[.<region>]
        if let Some((bucket, region)) = service.rsplit_once(".s3") {
            if region.is_empty() || is_region(region) {
                return located(s, bucket, decode(s, path)?);
            }
        }

        // Path-style: s3[.<region>]/<bucket>/<key>
        if service == "s3" || service.strip_prefix("s3").is_some_and(is_region) {
            let (bucket, key) = path
                .split_once('/')
                .ok_or_else(|| SyncError::invalid(s, "missing object key"))?;
            return located(s, bucket, decode(s, key)?);
        }

        Err(SyncError::invalid(s, "not an S3 host"))
    }
}

/// `.<region>` with a non-empty region label.
fn is_region(suffix: &str) -> bool {
    suffix
        .strip_prefix('.')
        .is_some_and(|region| !region.is_empty() && !region.contains('.'))
}

fn decode(reference: &str, raw: &str) -> Result<String, SyncError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| SyncError::invalid(reference, "object key is not UTF-8"))
}

fn located(reference: &str, bucket: &str, key: String) -> Result<ObjectLocation, SyncError> {
    if bucket.is_empty() {
        return Err(SyncError::invalid(reference, "missing bucket"));
    }
    if key.is_empty() {
        return Err(SyncError::invalid(reference, "missing object key"));
    }
    Ok(ObjectLocation::new(bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(reference: &str) -> (String, String) {
        let location: ObjectLocation = reference.parse().unwrap();
        (location.bucket, location.key)
    }

    fn pair(bucket: &str, key: &str) -> (String, String) {
        (bucket.to_owned(), key.to_owned())
    }

    #[test]
    fn short_form() {
        assert_eq!(
            parse("s3://bucket/path/to/servers.json"),
            pair("bucket", "path/to/servers.json")
        );
    }

    #[test]
    fn virtual_hosted() {
        assert_eq!(
            parse("https://bucket.s3.us-east-1.amazonaws.com/key"),
            pair("bucket", "key")
        );
        assert_eq!(
            parse("https://bucket.s3.amazonaws.com/nested/key.json"),
            pair("bucket", "nested/key.json")
        );
        assert_eq!(
            parse("https://my.dotted.bucket.s3.eu-west-1.amazonaws.com/key"),
            pair("my.dotted.bucket", "key")
        );
    }

    #[test]
    fn path_style() {
        assert_eq!(
            parse("https://s3.us-west-2.amazonaws.com/bucket/key"),
            pair("bucket", "key")
        );
        assert_eq!(
            parse("https://s3.amazonaws.com/bucket/dir/key"),
            pair("bucket", "dir/key")
        );
    }

    #[test]
    fn keys_are_percent_decoded() {
        assert_eq!(
            parse("https://bucket.s3.amazonaws.com/snapshots/servers%202024.json"),
            pair("bucket", "snapshots/servers 2024.json")
        );
    }

    #[test]
    fn rejects_other_shapes() {
        for reference in [
            "",
            "https://example.com/file.json",
            "s3://bucket",
            "s3://bucket/",
            "http://bucket.s3.amazonaws.com/key",
            "https://bucket.s3.amazonaws.com/",
            "https://s3.amazonaws.com/bucket",
            "ftp://bucket/key",
        ] {
            let err = reference.parse::<ObjectLocation>().unwrap_err();
            assert!(
                matches!(err, SyncError::InvalidReference { .. }),
                "{reference:?} gave {err}"
            );
            assert!(err.is_permanent());
        }
    }

    #[test]
    fn display_is_short_form() {
        let location = ObjectLocation::new("bucket", "a/b.json");
        assert_eq!(location.to_string(), "s3://bucket/a/b.json");
        assert_eq!(location.to_string().parse::<ObjectLocation>().unwrap(), location);
    }
}

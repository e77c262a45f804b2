//! Gateway request paths.
//!
//! Permission checks, rule matching, limit keys and the upstream URL are all
//! derived from one [`RequestPath`], so a request is forwarded to exactly the
//! path it was authorized for.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{ConfigError, GatewayError};

/// A percent-decoded path split into segments, plus the raw query.
///
/// Empty segments collapse. `.` and `..` are refused rather than resolved,
/// including their encoded and double-encoded forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    segments: Vec<String>,
    query: Option<String>,
}

impl RequestPath {
    /// Parse `path[?query]` as received below the gateway prefix.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };
        let invalid = |reason| GatewayError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        let decoded = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| invalid("not valid UTF-8"))?;
        if decoded.chars().any(|c| c == '\\' || c.is_control()) {
            return Err(invalid("forbidden character"));
        }

        let mut segments = Vec::new();
        for segment in decoded.split('/').filter(|s| !s.is_empty()) {
            if is_dot_segment(segment) {
                return Err(invalid("dot segment"));
            }
            segments.push(segment.to_string());
        }

        Ok(Self {
            segments,
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Normalized path, always starting with `/`.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// `/` plus the first segment: the coarsest scope a path belongs to.
    pub fn top_level(&self) -> String {
        match self.segments.first() {
            Some(first) => format!("/{}", first),
            None => "/".to_string(),
        }
    }

    /// `base` with this path appended below its own path. Each segment is
    /// re-encoded on its own, so decoded separators cannot reappear as `..`.
    pub fn upstream_url(&self, base: &str) -> Result<Url, GatewayError> {
        let invalid_base = || {
            GatewayError::Config(ConfigError::InvalidValue {
                field: "node.url",
                value: base.to_string(),
            })
        };

        let mut url = Url::parse(base).map_err(|_| invalid_base())?;
        url.path_segments_mut()
            .map_err(|_| invalid_base())?
            .pop_if_empty()
            .extend(&self.segments);
        url.set_query(self.query.as_deref());
        Ok(url)
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

fn is_dot_segment(segment: &str) -> bool {
    if matches!(segment, "." | "..") {
        return true;
    }
    let twice = percent_decode_str(segment).decode_utf8_lossy();
    matches!(twice.as_ref(), "." | "..")
}

/// `prefix` owns `path` when they are equal or `path` continues past it
/// with a `/`. `/api/events` owns `/api/events/7` but not `/api/eventsX`.
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

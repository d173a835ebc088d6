//! Source descriptors
//!
//! A descriptor names one live-content identity: a user handle, a numeric
//! room id, or a URL. Descriptors are immutable once a job is created.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The three ways a source can be identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Handle,
    Room,
    Url,
}

impl SourceKind {
    /// Argument passed to external helpers for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Handle => "user",
            SourceKind::Room => "room",
            SourceKind::Url => "url",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies what to monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Handle(String),
    Room(String),
    Url(String),
}

impl SourceDescriptor {
    /// Build a handle descriptor, dropping a leading `@`
    pub fn handle(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim();
        SourceDescriptor::Handle(name.strip_prefix('@').unwrap_or(name).to_string())
    }

    pub fn room(id: impl AsRef<str>) -> Self {
        SourceDescriptor::Room(id.as_ref().trim().to_string())
    }

    pub fn url(url: impl AsRef<str>) -> Self {
        SourceDescriptor::Url(url.as_ref().trim().to_string())
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Handle(_) => SourceKind::Handle,
            SourceDescriptor::Room(_) => SourceKind::Room,
            SourceDescriptor::Url(_) => SourceKind::Url,
        }
    }

    /// The raw identifier as given by the user
    pub fn value(&self) -> &str {
        match self {
            SourceDescriptor::Handle(v) | SourceDescriptor::Room(v) | SourceDescriptor::Url(v) => v,
        }
    }

    /// Handle embedded in a `.../@name/live` style URL, percent-decoded
    pub fn url_handle(&self) -> Option<String> {
        let SourceDescriptor::Url(url) = self else {
            return None;
        };
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let segment = path
            .split('/')
            .find_map(|segment| segment.strip_prefix('@'))
            .filter(|segment| !segment.is_empty())?;
        let decoded = urlencoding::decode(segment).ok()?;
        Some(decoded.into_owned())
    }

    /// Stable key used for the progress registry, logs and file names.
    ///
    /// Distinct sources get distinct keys. ASCII alphanumerics, `-`, `_` and
    /// `.` are kept; every other byte is written as `~XX`. A URL without an
    /// `@handle` is keyed by its last path segment plus a digest of the
    /// whole URL.
    pub fn key(&self) -> String {
        match self {
            SourceDescriptor::Handle(name) => handle_key(name),
            SourceDescriptor::Room(id) => format!("{}{}", ROOM_PREFIX, escape(id)),
            SourceDescriptor::Url(url) => match self.url_handle() {
                Some(handle) => handle_key(&handle),
                None => url_key(url),
            },
        }
    }

    /// What duplicate detection compares: a URL naming `@alice` is the same
    /// source as the handle `alice`; anything else is compared verbatim.
    pub fn identity(&self) -> (SourceKind, String) {
        match self {
            SourceDescriptor::Url(url) => match self.url_handle() {
                Some(handle) => (SourceKind::Handle, handle),
                None => (SourceKind::Url, url.clone()),
            },
            other => (other.kind(), other.value().to_string()),
        }
    }
}

const ROOM_PREFIX: &str = "room-";
const URL_PREFIX: &str = "url-";
const URL_TAIL_CHARS: usize = 48;

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Handle(name) => write!(f, "@{}", name),
            SourceDescriptor::Room(id) => write!(f, "room {}", id),
            SourceDescriptor::Url(url) => f.write_str(url),
        }
    }
}

fn handle_key(name: &str) -> String {
    let key = escape(name);
    // Keep handles out of the room and URL key namespaces
    for prefix in [ROOM_PREFIX, URL_PREFIX] {
        if let Some(rest) = key.strip_prefix(prefix) {
            return format!("{}~2D{}", &prefix[..prefix.len() - 1], rest);
        }
    }
    key
}

fn url_key(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .trim_end_matches('/');
    let tail = path.rsplit('/').next().unwrap_or(path);
    let tail: String = tail.chars().take(URL_TAIL_CHARS).collect();

    let digest = Sha256::digest(url.as_bytes());
    let short: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}-{}", URL_PREFIX, escape(&tail), short)
}

/// Reversible, filesystem-safe encoding of an identifier.
///
/// `~` never passes through unescaped, so different inputs cannot meet.
/// Empty and dot-only results are escaped too, so a key is never `.` or `..`.
fn escape(raw: &str) -> String {
    if raw.is_empty() {
        return "~".to_string();
    }
    let all_dots = raw.bytes().all(|b| b == b'.');
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        let keep = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.');
        if keep && !all_dots {
            out.push(byte as char);
        } else {
            out.push_str(&format!("~{:02X}", byte));
        }
    }
    out
}

/// Parse a handle list (one per line). Blank lines and `#` comments are
/// skipped, a leading `@` is dropped.
pub fn parse_handle_list(text: &str) -> Vec<SourceDescriptor> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(SourceDescriptor::handle)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_strips_at_sign() {
        assert_eq!(
            SourceDescriptor::handle("@alice"),
            SourceDescriptor::Handle("alice".to_string())
        );
        assert_eq!(SourceDescriptor::handle("bob").key(), "bob");
    }

    #[test]
    fn test_room_key() {
        let room = SourceDescriptor::room("7312345");
        assert_eq!(room.kind(), SourceKind::Room);
        assert_eq!(room.key(), "room-7312345");
        assert_eq!(room.to_string(), "room 7312345");
    }

    #[test]
    fn test_url_handle_extraction() {
        let url = SourceDescriptor::url("https://www.example.com/@caf%C3%A9.live/live?lang=en");
        assert_eq!(url.url_handle().as_deref(), Some("café.live"));
        // Non-ASCII is escaped in the key so it stays filesystem-safe
        assert_eq!(url.key(), "caf~C3~A9.live");
        assert_eq!(url.key(), SourceDescriptor::handle("café.live").key());
    }

    #[test]
    fn test_url_without_handle() {
        let url = SourceDescriptor::url("https://cdn.example.com/stream/abc123.flv");
        assert_eq!(url.url_handle(), None);
        let key = url.key();
        assert!(key.starts_with("url-abc123.flv-"), "{}", key);
        assert_eq!(key.len(), "url-abc123.flv-".len() + 16);
        assert_eq!(key, SourceDescriptor::url("https://cdn.example.com/stream/abc123.flv").key());
    }

    #[test]
    fn test_urls_with_same_tail_get_distinct_keys() {
        let a = SourceDescriptor::url("https://cdn-a.example/streamA/index.m3u8");
        let b = SourceDescriptor::url("https://cdn-b.example/streamB/index.m3u8");
        assert_ne!(a.key(), b.key());
        assert!(a.key().starts_with("url-index.m3u8-"));
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_escaping_keeps_handles_apart() {
        assert_eq!(SourceDescriptor::handle("a b").key(), "a~20b");
        assert_eq!(SourceDescriptor::handle("a_b").key(), "a_b");
        assert_ne!(
            SourceDescriptor::handle("a~20b").key(),
            SourceDescriptor::handle("a b").key()
        );
        assert_ne!(
            SourceDescriptor::handle("room-42").key(),
            SourceDescriptor::room("42").key()
        );
        assert_eq!(SourceDescriptor::handle("room-42").key(), "room~2D42");
    }

    #[test]
    fn test_dot_keys_stay_inside_output_directory() {
        assert_eq!(SourceDescriptor::handle("..").key(), "~2E~2E");
        assert_eq!(SourceDescriptor::handle(".").key(), "~2E");
        assert_eq!(SourceDescriptor::handle("../etc").key(), "..~2Fetc");
        assert_eq!(SourceDescriptor::handle("").key(), "~");
        for name in ["..", ".", "../etc", "a/b", ""] {
            let key = SourceDescriptor::handle(name).key();
            let path = std::path::Path::new("/out").join(&key);
            assert_eq!(path.parent(), Some(std::path::Path::new("/out")), "{}", key);
        }
    }

    #[test]
    fn test_identity_matches_url_handle_to_handle() {
        let url = SourceDescriptor::url("https://www.example.com/@alice/live");
        assert_eq!(url.identity(), SourceDescriptor::handle("@alice").identity());
        assert_eq!(url.key(), "alice");
    }

    #[test]
    fn test_parse_handle_list() {
        let text = "# favourites\n@alice\n\n  bob  \n#carol\n";
        let parsed = parse_handle_list(text);
        assert_eq!(
            parsed,
            vec![SourceDescriptor::handle("alice"), SourceDescriptor::handle("bob")]
        );
    }

    #[test]
    fn test_descriptor_serde_shape() {
        let json = serde_json::to_string(&SourceDescriptor::room("42")).unwrap();
        assert_eq!(json, r#"{"kind":"room","value":"42"}"#);
    }
}

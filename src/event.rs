//! Event record data structure.
//!
//! An [`Event`] is the immutable, content-addressed unit the relay stores.
//! Its [`EventId`] is the SHA-256 of the canonical form
//! `[0, pubkey, created_at, kind, tags, content]` serialized as compact JSON,
//! so two events with the same ID are the same event.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Anything with an estimable in-memory/serialized footprint.
pub trait SizedItem {
    fn size_bytes(&self) -> usize;
}

/// 32-byte content hash identifying an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 32]);

impl EventId {
    pub const LEN: usize = 32;

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex ID.
    pub fn from_hex(s: &str) -> Result<Self, StorageError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| StorageError::InvalidEvent(format!("bad event id '{}': {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl FromStr for EventId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed, content-addressed event record.
///
/// # Example
///
/// ```
/// use relay_store::{Event, SizedItem};
///
/// let event = Event::new(
///     "a".repeat(64),
///     1_700_000_000,
///     1,
///     vec![vec!["t".into(), "rust".into()]],
///     "hello".into(),
///     "b".repeat(128),
/// );
///
/// assert!(event.verify_id());
/// assert_eq!(event.id().to_hex().len(), 64);
/// assert!(event.size_bytes() > 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    /// Author public key (hex)
    pubkey: String,
    /// Creation time (unix seconds)
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    /// Signature (hex); not verified by the store
    sig: String,

    /// Cached serialized size (lazily computed, not serialized)
    #[serde(skip)]
    cached_size: OnceLock<usize>,
}

impl Event {
    /// Build an event, deriving its ID from the canonical form.
    pub fn new(
        pubkey: String,
        created_at: i64,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
        sig: String,
    ) -> Self {
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
            cached_size: OnceLock::new(),
        }
    }

    /// Parse a JSON event and check that its ID matches its content.
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let event: Event = serde_json::from_str(json)?;
        if !event.verify_id() {
            return Err(StorageError::InvalidEvent(format!(
                "id {} does not match canonical hash",
                event.id
            )));
        }
        Ok(event)
    }

    /// Compact JSON form (one line, used for import/export and SQL storage).
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// SHA-256 over `[0, pubkey, created_at, kind, tags, content]`.
    #[must_use]
    pub fn compute_id(
        pubkey: &str,
        created_at: i64,
        kind: u16,
        tags: &[Vec<String>],
        content: &str,
    ) -> EventId {
        let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        EventId(digest.into())
    }

    #[must_use]
    pub fn verify_id(&self) -> bool {
        let id = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        id == self.id
    }

    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[must_use]
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    #[must_use]
    pub fn kind(&self) -> u16 {
        self.kind
    }

    #[must_use]
    pub fn tags(&self) -> &[Vec<String>] {
        &self.tags
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn sig(&self) -> &str {
        &self.sig
    }

    /// Values of single-letter tags named `name` (the second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }
}

impl SizedItem for Event {
    fn size_bytes(&self) -> usize {
        *self.cached_size.get_or_init(|| {
            // Length of the compact JSON form; fields are plain strings/numbers
            // so serialization cannot fail.
            serde_json::to_vec(self).map(|v| v.len()).unwrap_or_else(|_| {
                self.pubkey.len() + self.content.len() + self.sig.len() + 64
            })
        })
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

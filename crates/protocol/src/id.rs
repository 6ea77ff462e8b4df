//! Message and conversation identifiers.
//!
//! Generated message ids look like
//! `msg_1718000000123456_9f2c4e1ab37d5c08_3be1a9d2_000042`:
//!
//! | field | content |
//! |---|---|
//! | 1 | wall-clock microseconds since the Unix epoch, 16 digits |
//! | 2 | 64 random bits from a CSPRNG, hex |
//! | 3 | per-process environment fingerprint, hex |
//! | 4 | per-process sequence counter, wraps at 1,000,000 |
//!
//! Peers are free to use their own ids on the wire as long as they are
//! [well formed](MessageId::is_well_formed).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const ID_PREFIX: &str = "msg";
const SEQUENCE_MODULUS: u32 = 1_000_000;
const MAX_WIRE_ID_LEN: usize = 128;

/// Identifier correlating one chat request with its event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire-level structural check: non-empty, bounded, printable, no
    /// whitespace. Stricter format checks live in [`IdentityGenerator::validate`].
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_WIRE_ID_LEN
            && self
                .0
                .chars()
                .all(|c| !c.is_whitespace() && !c.is_control())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Server-assigned conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Mint a fresh conversation id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Produces collision-resistant [`MessageId`]s.
///
/// Never blocks and never fails. The only side effect of [`generate`] is
/// advancing the sequence counter.
///
/// [`generate`]: IdentityGenerator::generate
#[derive(Debug)]
pub struct IdentityGenerator {
    fingerprint: String,
    sequence: AtomicU32,
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self::with_fingerprint(environment_fingerprint())
    }

    /// Build a generator with a fixed fingerprint. The fingerprint is
    /// normalized to 8 lowercase hex characters.
    pub fn with_fingerprint(fingerprint: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(fingerprint.as_ref());
        Self {
            fingerprint: hex::encode(&digest[..4]),
            sequence: AtomicU32::new(0),
        }
    }

    /// Process-wide generator; every client in the process shares its sequence.
    pub fn global() -> &'static IdentityGenerator {
        static GLOBAL: OnceLock<IdentityGenerator> = OnceLock::new();
        GLOBAL.get_or_init(IdentityGenerator::new)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn generate(&self) -> MessageId {
        let micros = Utc::now().timestamp_micros().max(0);
        let random = OsRng.next_u64();
        let sequence = self.next_sequence();

        MessageId(format!(
            "{ID_PREFIX}_{micros:016}_{random:016x}_{}_{sequence:06}",
            self.fingerprint
        ))
    }

    fn next_sequence(&self) -> u32 {
        self.sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some((s + 1) % SEQUENCE_MODULUS)
            })
            .unwrap_or_else(|current| current)
    }

    /// Structural check of a generated id. Does not re-derive or trust any
    /// of the embedded entropy.
    pub fn validate(id: &str) -> bool {
        id_pattern().is_some_and(|pattern| pattern.is_match(id))
    }

    /// Recover the embedded generation time, or `None` if `id` was not
    /// produced by an [`IdentityGenerator`].
    pub fn extract_timestamp(id: &str) -> Option<DateTime<Utc>> {
        let captures = id_pattern()?.captures(id)?;
        let micros: i64 = captures.get(1)?.as_str().parse().ok()?;
        DateTime::from_timestamp_micros(micros)
    }
}

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^msg_(\d{16})_([0-9a-f]{16})_([0-9a-f]{8})_(\d{6})$").ok())
        .as_ref()
}

/// Stable, non-secret digest input built from the host environment.
fn environment_fingerprint() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    format!(
        "{host}|{user}|{}|{}|{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::process::id()
    )
}

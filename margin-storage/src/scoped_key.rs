//! Namespace-scoped keys for the local key-value store.
//!
//! A [`ScopedKey`] can only be built with a [`Namespace`], so drafts, cached
//! responses and app flags can never collide or be read through the wrong
//! namespace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator byte between the namespace tag and the key text.
///
/// 0xFF never appears in UTF-8, so it cannot be forged by a key.
const SEPARATOR: u8 = 0xFF;

/// Top-level partition of local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Local-only drafts. Durable.
    Drafts,
    /// Last-known-good server responses. Best effort.
    Cache,
    /// Small durable app state (active record, installed flags).
    AppFlags,
}

impl Namespace {
    pub fn name(&self) -> &'static str {
        match self {
            Namespace::Drafts => "drafts",
            Namespace::Cache => "cache",
            Namespace::AppFlags => "app_flags",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Namespace::Drafts => 0,
            Namespace::Cache => 1,
            Namespace::AppFlags => 2,
        }
    }

    fn from_tag(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Namespace::Drafts),
            1 => Some(Namespace::Cache),
            2 => Some(Namespace::AppFlags),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A storage key bound to a namespace.
///
/// # Binary Format
///
/// `[namespace tag: 1 byte][0xFF][key: utf-8]`. All keys of a namespace share
/// a two-byte prefix, so listing a namespace is a prefix scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedKey {
    inner: ScopedKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ScopedKeyInner {
    namespace: Namespace,
    key: String,
}

impl ScopedKey {
    pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
        Self {
            inner: ScopedKeyInner {
                namespace,
                key: key.into(),
            },
        }
    }

    pub fn drafts(key: impl Into<String>) -> Self {
        Self::new(Namespace::Drafts, key)
    }

    pub fn cache(key: impl Into<String>) -> Self {
        Self::new(Namespace::Cache, key)
    }

    pub fn app_flags(key: impl Into<String>) -> Self {
        Self::new(Namespace::AppFlags, key)
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.namespace
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.inner.key.len());
        bytes.extend_from_slice(&Self::namespace_prefix(self.inner.namespace));
        bytes.extend_from_slice(self.inner.key.as_bytes());
        bytes
    }

    /// Returns `None` for a missing separator, an unknown tag or non UTF-8 text.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 || bytes[1] != SEPARATOR {
            return None;
        }
        let namespace = Namespace::from_tag(bytes[0])?;
        let key = std::str::from_utf8(&bytes[2..]).ok()?;
        Some(Self::new(namespace, key))
    }

    /// Prefix shared by every key of `namespace`.
    pub fn namespace_prefix(namespace: Namespace) -> [u8; 2] {
        [namespace.tag(), SEPARATOR]
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.namespace, self.inner.key)
    }
}

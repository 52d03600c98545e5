//! Request fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Deterministic identity of a logical request, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing digest (or any caller-chosen key) as a fingerprint.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn prefixed(&self, prefix: &str) -> Self {
        Self(format!("{}:{}", prefix, self.0))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

pub(crate) fn with_prefix(fp: &Fingerprint, prefix: Option<&str>) -> Fingerprint {
    match prefix {
        Some(p) => fp.prefixed(p),
        None => fp.clone(),
    }
}

/// Canonical form hashed into a fingerprint. Sets keep secondary identifiers
/// and mode flags order-insensitive.
#[derive(Serialize)]
struct Canonical<'a> {
    subject: &'a str,
    secondary: &'a BTreeSet<String>,
    query: &'a str,
    modes: &'a BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<&'a str>,
}

/// Builds a [`Fingerprint`] from the parts of a request that determine its answer.
#[derive(Debug, Clone, Default)]
pub struct FingerprintBuilder {
    subject: String,
    secondary: BTreeSet<String>,
    query: String,
    modes: BTreeSet<String>,
    salt: Option<String>,
}

impl FingerprintBuilder {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn secondary(mut self, id: impl Into<String>) -> Self {
        self.secondary.insert(id.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn mode(mut self, flag: impl Into<String>) -> Self {
        self.modes.insert(flag.into());
        self
    }

    /// Salt separates otherwise identical requests, e.g. across model versions.
    pub fn salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn build(&self) -> Fingerprint {
        let canonical = Canonical {
            subject: &self.subject,
            secondary: &self.secondary,
            query: &self.query,
            modes: &self.modes,
            salt: self.salt.as_deref(),
        };
        // Serializing strings and string sets into JSON cannot fail.
        let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

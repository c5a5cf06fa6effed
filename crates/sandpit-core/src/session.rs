//! Session identifiers and the container names derived from them

use crate::{Result, SandpitError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const MAX_KEY_LEN: usize = 256;
const MAX_NAME_COMPONENT: usize = 48;

/// Caller-supplied session identity, validated
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SandpitError::InvalidRequest("session id is empty".into()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(SandpitError::InvalidRequest(format!(
                "session id longer than {MAX_KEY_LEN} bytes"
            )));
        }
        if raw.chars().any(char::is_control) {
            return Err(SandpitError::InvalidRequest(
                "session id contains control characters".into(),
            ));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic container name for this session
    ///
    /// Characters Docker rejects become `-`. When that rewrites or truncates
    /// the key, a digest of the raw key is appended so distinct sessions
    /// never share a name.
    #[must_use]
    pub fn container_name(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '-'
                }
            })
            .take(MAX_NAME_COMPONENT)
            .collect();

        if sanitized == self.0 {
            format!("sandbox_{sanitized}")
        } else {
            let digest = Sha256::digest(self.0.as_bytes());
            let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
            format!("sandbox_{sanitized}-{suffix}")
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SandpitError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

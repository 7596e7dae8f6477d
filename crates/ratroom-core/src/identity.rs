//! Client identity.
//!
//! A rat id is the identity a client presents when it connects:
//! a non-empty string of ASCII letters, digits, `_` and `-`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated rat identity.
///
/// Parsing is the only way to build one, so holding a `RatId` means the
/// value already passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RatId(String);

impl RatId {
    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_allowed(ch: char) -> bool {
        ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
    }
}

impl fmt::Display for RatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RatId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RatId {
    type Err = RatIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RatIdError::Empty);
        }

        if let Some(ch) = s.chars().find(|c| !Self::is_allowed(*c)) {
            return Err(RatIdError::InvalidChar {
                id: s.to_string(),
                ch,
            });
        }

        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for RatId {
    type Error = RatIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RatId> for String {
    fn from(id: RatId) -> Self {
        id.0
    }
}

/// Error validating a rat id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatIdError {
    #[error("rat id cannot be empty")]
    Empty,
    #[error("rat id {id:?} contains invalid character {ch:?}")]
    InvalidChar { id: String, ch: char },
}

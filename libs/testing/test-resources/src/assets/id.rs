use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a model or artifact, optionally version-tagged (`name:tag`)
///
/// The tag is the part after the last `:` that follows the last `/`, so
/// `org/model-a` has no tag and `registry:5000/model` is not mistaken for one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId {
    raw: String,
    name_len: usize,
}

impl AssetId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into().trim().to_string();
        if raw.is_empty() {
            return Err("asset identifier is empty".to_string());
        }

        let name_start = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        let name_len = match raw[name_start..].rfind(':') {
            Some(i) => name_start + i,
            None => raw.len(),
        };

        if name_len == 0 || (name_len < raw.len() && name_len + 1 == raw.len()) {
            return Err(format!("malformed asset identifier '{}'", raw));
        }

        Ok(Self { raw, name_len })
    }

    /// Fully qualified identifier, exactly as requested
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Base name without tag
    pub fn name(&self) -> &str {
        &self.raw[..self.name_len]
    }

    pub fn tag(&self) -> Option<&str> {
        if self.name_len < self.raw.len() {
            Some(&self.raw[self.name_len + 1..])
        } else {
            None
        }
    }

    /// Whether a listed entry denotes this asset
    ///
    /// `name:tag` and bare `name` are equivalent. A request without a tag
    /// matches `name` under any tag.
    pub fn matches(&self, listed: &str) -> bool {
        let listed = listed.trim();
        if listed == self.raw || listed == self.name() {
            return true;
        }

        match (self.tag(), AssetId::parse(listed)) {
            (None, Ok(entry)) => entry.name() == self.name(),
            _ => false,
        }
    }

    /// Whether any entry of a listing denotes this asset
    pub fn is_listed<S: AsRef<str>>(&self, listing: &[S]) -> bool {
        listing.iter().any(|entry| self.matches(entry.as_ref()))
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for AssetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetId::parse(s)
    }
}

impl TryFrom<String> for AssetId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AssetId::parse(value)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.raw
    }
}

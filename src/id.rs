//! Canonical brace-wrapped lowercase UUID identifiers (C1, spec §3/§6).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DxlError;

/// A brace-wrapped lowercase UUIDv4 string, e.g.
/// `{de305d54-75b4-431b-adb2-eb6b9e546014}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(Uuid);

impl UniqueId {
    pub fn new() -> Self {
        UniqueId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::new()
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.hyphenated())
    }
}

impl FromStr for UniqueId {
    type Err = DxlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(s);

        Uuid::parse_str(trimmed)
            .map(UniqueId)
            .map_err(|err| DxlError::Malformed(format!("invalid unique id {s:?}: {err}")))
    }
}

impl Serialize for UniqueId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UniqueId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = UniqueId::new();
        let s = id.to_string();

        assert!(s.starts_with('{'));
        assert!(s.ends_with('}'));
        assert_eq!(s, s.to_lowercase());

        let parsed: UniqueId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn accepts_bare_uuid_without_braces() {
        let id = UniqueId::new();
        let bare = id.as_uuid().hyphenated().to_string();
        let parsed: UniqueId = bare.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-uuid".parse::<UniqueId>().is_err());
    }

    #[test]
    fn serializes_as_braced_string() {
        let id = UniqueId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let back: UniqueId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

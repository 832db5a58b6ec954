//! Network and endpoint identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ShroudError, ShroudResult};

/// Number of ID characters used when deriving interface names.
pub const SHORT_ID_LEN: usize = 5;

/// First [`SHORT_ID_LEN`] characters of `id`, or the whole ID when shorter.
#[must_use]
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn validate(id: &str) -> ShroudResult<()> {
    if id.is_empty() {
        return Err(ShroudError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

/// A runtime-assigned network ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    /// Create a network ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty.
    pub fn new(id: impl Into<String>) -> ShroudResult<Self> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    /// Get the network ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The truncated form used in bridge names.
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

/// A runtime-assigned endpoint ID, unique within its network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create an endpoint ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty.
    pub fn new(id: impl Into<String>) -> ShroudResult<Self> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    /// Get the endpoint ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The truncated form used in veth names.
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = ShroudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl FromStr for EndpointId {
    type Err = ShroudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for NetworkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_ids_rejected() {
        assert!(NetworkId::new("").is_err());
        assert!(EndpointId::new("").is_err());
    }

    #[test]
    fn short_ids() {
        let net = NetworkId::new("2f8c1a9be0d4").unwrap();
        assert_eq!(net.short(), "2f8c1");

        let ep = EndpointId::new("ep1").unwrap();
        assert_eq!(ep.short(), "ep1");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_id("ééééééé"), "ééééé");
    }

    proptest! {
        #[test]
        fn truncated_is_prefix(id in "[a-f0-9]{1,64}") {
            let short = truncate_id(&id);
            prop_assert!(id.starts_with(short));
            prop_assert_eq!(short.len(), id.len().min(SHORT_ID_LEN));
        }
    }
}

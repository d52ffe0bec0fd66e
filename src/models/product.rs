use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

use super::validate_identifier;

/// Identifier of a product; names exactly one temperature series.
///
/// Operators type numeric ids on the kiosk keypad, so JSON numbers are
/// accepted alongside strings. The id is always serialized as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawProductId", into = "String")]
pub struct ProductId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProductId {
    Number(u64),
    Text(String),
}

impl ProductId {
    pub fn new(value: impl Into<String>) -> Result<Self, TrackerError> {
        let value = value.into();
        let trimmed = value.trim();
        validate_identifier("product id", trimmed)?;
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<RawProductId> for ProductId {
    type Error = TrackerError;

    fn try_from(raw: RawProductId) -> Result<Self, Self::Error> {
        match raw {
            RawProductId::Number(number) => Self::new(number.to_string()),
            RawProductId::Text(text) => Self::new(text),
        }
    }
}

impl From<ProductId> for String {
    fn from(id: ProductId) -> Self {
        id.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Core identifiers shared by every layer

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("address must have 40 hex digits, got {len}: {address}")]
    BadLength { address: String, len: usize },
    #[error("address contains non-hex characters: {0}")]
    NotHex(String),
}

/// Account address in lowercase canonical form (`0x` + 40 hex digits).
///
/// Callers arrive with addresses in any casing; equality, hashing and
/// storage keys always use the normalized form.
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, ToSchema,
)]
#[serde(into = "String")]
#[schema(value_type = String, example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let Some(digits) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        else {
            return Err(AddressError::MissingPrefix(raw.to_owned()));
        };
        if digits.len() != 40 {
            return Err(AddressError::BadLength {
                address: raw.to_owned(),
                len: digits.len(),
            });
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex(raw.to_owned()));
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid competition id `{0}`: expected 16 hex digits")]
pub struct CompetitionIdError(String);

/// Unique identifier for a competition (8 bytes, hex encoded for humans)
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, ToSchema)]
#[schema(value_type = String, example = "3f9a0c1d22e4b701")]
pub struct CompetitionId(pub [u8; 8]);

impl CompetitionId {
    pub fn new(data: [u8; 8]) -> Self {
        Self(data)
    }

    /// Derive an id from the creator, title and creation time. The nonce
    /// keeps ids distinct when the same creator submits the same title twice
    /// within one second.
    pub fn derive(
        creator: &Address,
        title: &str,
        created_at: u64,
        nonce: &[u8],
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(creator.as_str().as_bytes());
        hasher.update(title.as_bytes());
        hasher.update(&created_at.to_be_bytes());
        hasher.update(nonce);
        let hash = hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for CompetitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for CompetitionId {
    type Err = CompetitionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim()).map_err(|_| CompetitionIdError(s.to_owned()))?;
        let id: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CompetitionIdError(s.to_owned()))?;
        Ok(Self(id))
    }
}

impl Serialize for CompetitionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for CompetitionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let raw = String::deserialize(deserializer)?;
            raw.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 8]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Seconds since the unix epoch
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

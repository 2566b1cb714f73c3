//! Object identifiers as they appear on the wire.
//!
//! Git names every object by the hash of its content. The relay never hashes objects itself, it
//! only parses the hex ids remotes advertise and echoes them back in `want`/`have` lines and ref
//! update commands, so [`ObjectId`] is a plain comparable value with hex conversions.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// The hash algorithm a remote uses for its object names (`object-format` capability).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err(format!("Invalid hash kind: {s}")),
        }
    }
}

/// A Git object id. Ordered so that want/have sets serialize deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::Sha1([0u8; 20])
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        match self {
            ObjectId::Sha1(bytes) => bytes.as_slice(),
            ObjectId::Sha256(bytes) => bytes.as_slice(),
        }
    }
}

/// Parses a 40 (SHA-1) or 64 (SHA-256) character hex string.
impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => {
                let mut h = [0u8; 20];
                hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
                Ok(ObjectId::Sha1(h))
            }
            64 => {
                let mut h = [0u8; 32];
                hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
                Ok(ObjectId::Sha256(h))
            }
            n => Err(format!("Invalid object id length {n}: {s:?}")),
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// The all-zero id, used for "ref does not exist" in push commands.
    pub const fn zero(kind: HashKind) -> ObjectId {
        match kind {
            HashKind::Sha1 => ObjectId::Sha1([0u8; 20]),
            HashKind::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }

    pub fn kind(&self) -> HashKind {
        match self {
            ObjectId::Sha1(_) => HashKind::Sha1,
            ObjectId::Sha256(_) => HashKind::Sha256,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_ref().iter().all(|b| *b == 0)
    }

    /// Parses the leading hex id of a wire line, returning the id and the remainder
    /// after the separating space (if any).
    pub fn parse_prefix(line: &str) -> Result<(ObjectId, &str), String> {
        let (id, rest) = line.split_once(' ').unwrap_or((line, ""));
        Ok((id.parse()?, rest))
    }
}

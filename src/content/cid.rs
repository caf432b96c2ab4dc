//! CIDv1 content identifiers: `<version><codec><multihash>` with sha2-256.
//!
//! Text form is multibase base16 (`f` + lowercase hex), e.g.
//! `f01551220<64 hex chars>` for a raw block.

use super::ContentError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const CID_VERSION: u64 = 1;
const SHA2_256: u64 = 0x12;
const DIGEST_LEN: usize = 32;
const MULTIBASE_BASE16: char = 'f';
const MULTIBASE_BASE16_UPPER: char = 'F';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    Raw,
    DagJson,
}

impl Codec {
    pub fn code(self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagJson => 0x0129,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(Codec::Raw),
            0x0129 => Some(Codec::DagJson),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    codec: Codec,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// Hash `data` and build its identifier. Pure function of bytes and codec.
    pub fn compute(codec: Codec, data: &[u8]) -> Self {
        Self {
            codec,
            digest: Sha256::digest(data).into(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// True if `data` hashes to this identifier.
    pub fn matches(&self, data: &[u8]) -> bool {
        let digest: [u8; DIGEST_LEN] = Sha256::digest(data).into();
        digest == self.digest
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + DIGEST_LEN);
        write_varint(&mut out, CID_VERSION);
        write_varint(&mut out, self.codec.code());
        write_varint(&mut out, SHA2_256);
        write_varint(&mut out, DIGEST_LEN as u64);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContentError> {
        let mut rest = bytes;
        let version = read_varint(&mut rest)?;
        if version != CID_VERSION {
            return Err(ContentError::InvalidCid(format!(
                "unsupported CID version {}",
                version
            )));
        }
        let code = read_varint(&mut rest)?;
        let codec = Codec::from_code(code)
            .ok_or_else(|| ContentError::InvalidCid(format!("unsupported codec 0x{:x}", code)))?;
        let hash = read_varint(&mut rest)?;
        if hash != SHA2_256 {
            return Err(ContentError::InvalidCid(format!(
                "unsupported multihash 0x{:x}",
                hash
            )));
        }
        let len = read_varint(&mut rest)?;
        if len != DIGEST_LEN as u64 || rest.len() != DIGEST_LEN {
            return Err(ContentError::InvalidCid(format!(
                "bad digest length {} ({} bytes present)",
                len,
                rest.len()
            )));
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(rest);
        Ok(Self { codec, digest })
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(input: &mut &[u8]) -> Result<u64, ContentError> {
    let mut value = 0u64;
    for (i, byte) in input.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *input = &input[i + 1..];
            return Ok(value);
        }
    }
    Err(ContentError::InvalidCid("truncated varint".to_string()))
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MULTIBASE_BASE16, hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self)
    }
}

impl FromStr for Cid {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        match chars.next() {
            Some(MULTIBASE_BASE16) | Some(MULTIBASE_BASE16_UPPER) => {}
            Some(other) => {
                return Err(ContentError::InvalidCid(format!(
                    "unsupported multibase prefix {:?}",
                    other
                )))
            }
            None => return Err(ContentError::InvalidCid("empty CID".to_string())),
        }
        let bytes = hex::decode(chars.as_str())
            .map_err(|e| ContentError::InvalidCid(format!("bad base16: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

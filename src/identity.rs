//! Node identity: an ed25519 keypair and the PeerId derived from it.
//!
//! Key material uses the libp2p protobuf encoding so existing keys
//! (`CAESQ...` base64) keep working:
//!
//! - private key: `08 01 12 40 <32 secret><32 public>` (or `08 01 12 20 <seed>`)
//! - public key:  `08 01 12 20 <32 public>`
//!
//! The textual PeerId is base58btc of the identity multihash over the encoded
//! public key (`00 24 08 01 12 20 <pk>`), i.e. the familiar `12D3KooW...`.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_TYPE_ED25519: u8 = 0x01;
const FIELD_KEY_TYPE: u8 = 0x08;
const FIELD_DATA: u8 = 0x12;
const MULTIHASH_IDENTITY: u8 = 0x00;
const ENCODED_PUBLIC_KEY_LEN: usize = 36;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Stable peer identifier (the ed25519 public key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Identity multihash of the protobuf-encoded public key.
    pub fn to_multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + ENCODED_PUBLIC_KEY_LEN);
        out.push(MULTIHASH_IDENTITY);
        out.push(ENCODED_PUBLIC_KEY_LEN as u8);
        out.extend_from_slice(&encode_public_key(&self.0));
        out
    }

    /// Parse the identity multihash form produced by `to_multihash`.
    pub fn from_multihash(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 2 + ENCODED_PUBLIC_KEY_LEN
            || bytes[0] != MULTIHASH_IDENTITY
            || bytes[1] as usize != ENCODED_PUBLIC_KEY_LEN
        {
            return Err(IdentityError::InvalidPeerId(
                "not an ed25519 identity multihash".to_string(),
            ));
        }
        if bytes[2..4] != [FIELD_KEY_TYPE, KEY_TYPE_ED25519] {
            return Err(IdentityError::InvalidPeerId(format!(
                "unsupported key type {:02x}{:02x}",
                bytes[2], bytes[3]
            )));
        }
        let key = decode_field(&bytes[4..], 32)
            .map_err(|e| IdentityError::InvalidPeerId(e.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(key);
        Ok(Self(out))
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| IdentityError::InvalidPeerId(format!("not an ed25519 point: {}", e)))
    }

    /// Verify a signature made by the key behind this PeerId.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.to_multihash()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| IdentityError::InvalidPeerId(e.to_string()))?;
        Self::from_multihash(&bytes)
    }
}

/// The local node's keypair. Immutable once created.
pub struct Identity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let seed = Zeroizing::new(rand::random::<[u8; 32]>());
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Decode supplied key material, or generate a new identity when none is given.
    pub fn load_or_create(key_material: Option<&str>) -> Result<Self, IdentityError> {
        match key_material.map(str::trim).filter(|s| !s.is_empty()) {
            Some(encoded) => Self::from_protobuf_base64(encoded),
            None => Ok(Self::generate()),
        }
    }

    pub fn from_protobuf_base64(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| IdentityError::InvalidKeyMaterial(format!("bad base64: {}", e)))?,
        );
        Self::from_protobuf(&bytes)
    }

    pub fn from_protobuf(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() < 4 || bytes[0] != FIELD_KEY_TYPE {
            return Err(IdentityError::InvalidKeyMaterial(
                "missing key type field".to_string(),
            ));
        }
        if bytes[1] != KEY_TYPE_ED25519 {
            return Err(IdentityError::InvalidKeyMaterial(format!(
                "unsupported key type {}",
                bytes[1]
            )));
        }

        let data = &bytes[2..];
        let key = match data.get(1).copied() {
            Some(64) => decode_field(data, 64)?,
            Some(32) => decode_field(data, 32)?,
            other => {
                return Err(IdentityError::InvalidKeyMaterial(format!(
                    "unexpected key length {:?}",
                    other
                )))
            }
        };

        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&key[..32]);
        let identity = Self::from_signing_key(SigningKey::from_bytes(&seed));

        if key.len() == 64 && key[32..] != identity.peer_id.0[..] {
            return Err(IdentityError::InvalidKeyMaterial(
                "embedded public key does not match secret key".to_string(),
            ));
        }
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Export in the libp2p protobuf encoding (secret || public), base64.
    pub fn to_protobuf_base64(&self) -> Zeroizing<String> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(68));
        bytes.extend_from_slice(&[FIELD_KEY_TYPE, KEY_TYPE_ED25519, FIELD_DATA, 64]);
        bytes.extend_from_slice(&self.signing_key.to_bytes());
        bytes.extend_from_slice(&self.peer_id.0);
        Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(bytes.as_slice()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

fn encode_public_key(key: &[u8; 32]) -> [u8; ENCODED_PUBLIC_KEY_LEN] {
    let mut out = [0u8; ENCODED_PUBLIC_KEY_LEN];
    out[..4].copy_from_slice(&[FIELD_KEY_TYPE, KEY_TYPE_ED25519, FIELD_DATA, 32]);
    out[4..].copy_from_slice(key);
    out
}

/// Read the `12 <len> <bytes>` data field of an encoded key.
fn decode_field(data: &[u8], expected_len: usize) -> Result<&[u8], IdentityError> {
    if data.len() != 2 + expected_len || data[0] != FIELD_DATA || data[1] as usize != expected_len
    {
        return Err(IdentityError::InvalidKeyMaterial(format!(
            "malformed key data field (expected {} bytes)",
            expected_len
        )));
    }
    Ok(&data[2..])
}

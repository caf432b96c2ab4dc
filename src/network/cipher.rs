//! AES-256-GCM frame sealing with per-direction keys and counter nonces.
//!
//! Each direction of a connection owns one `FrameCipher`. The nonce is the
//! frame counter, so frames must be opened in the order they were sealed;
//! a reordered, replayed or dropped frame fails authentication.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroizing;

pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Frame authentication failed")]
    Authentication,
    #[error("Nonce space exhausted")]
    NonceExhausted,
}

pub struct FrameCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: &Zeroizing<[u8; 32]>) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice())),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], CipherError> {
        if self.counter == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Authentication)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)
    }
}

/// Derive a 32-byte key from a context string and input key material.
pub fn derive_key(context: &str, parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new(Vec::new());
    for part in parts {
        material.extend_from_slice(part);
    }
    Zeroizing::new(blake3::derive_key(context, &material))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_in_order() {
        let key = derive_key("test", &[b"k"]);
        let mut tx = FrameCipher::new(&key);
        let mut rx = FrameCipher::new(&key);

        let a = tx.seal(b"first").unwrap();
        let b = tx.seal(b"second").unwrap();
        assert_eq!(a.len(), 5 + TAG_LEN);
        assert_eq!(rx.open(&a).unwrap(), b"first");
        assert_eq!(rx.open(&b).unwrap(), b"second");
    }

    #[test]
    fn test_reordered_frame_fails() {
        let key = derive_key("test", &[b"k"]);
        let mut tx = FrameCipher::new(&key);
        let mut rx = FrameCipher::new(&key);

        let _a = tx.seal(b"first").unwrap();
        let b = tx.seal(b"second").unwrap();
        assert!(rx.open(&b).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut tx = FrameCipher::new(&derive_key("test", &[b"a"]));
        let mut rx = FrameCipher::new(&derive_key("test", &[b"b"]));
        let sealed = tx.seal(b"secret").unwrap();
        assert!(matches!(rx.open(&sealed), Err(CipherError::Authentication)));
    }

    #[test]
    fn test_context_separates_keys() {
        assert_ne!(*derive_key("a", &[b"x"]), *derive_key("b", &[b"x"]));
        assert_eq!(*derive_key("a", &[b"x", b"y"]), *derive_key("a", &[b"xy"]));
    }
}

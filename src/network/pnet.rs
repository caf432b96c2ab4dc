//! Private network guard.
//!
//! Every raw connection is wrapped here before anything else runs on it.
//! Both sides prove knowledge of the swarm's pre-shared key with a
//! challenge-response over fresh nonces, then all further bytes travel in
//! AEAD frames keyed from the PSK and both nonces. A peer without the key
//! never gets past the handshake.

use crate::network::cipher::{derive_key, CipherError, FrameCipher};
use crate::network::wire;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const PSK_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const TAG_LEN: usize = 8;
const PROTOCOL_TAG: &[u8; TAG_LEN] = b"/pnet/1\n";
const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
const AUTH_CONTEXT: &str = "swarmd pnet v1 auth";
const STREAM_CONTEXT: &str = "swarmd pnet v1 stream";
const PROOF_LABEL: &[u8] = b"pnet-proof";

#[derive(Error, Debug)]
pub enum PnetError {
    #[error("Private network handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Invalid swarm key: {0}")]
    InvalidKey(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] CipherError),
}

/// The swarm-wide pre-shared secret.
#[derive(Clone)]
pub struct PreSharedKey(Zeroizing<[u8; PSK_LEN]>);

impl PreSharedKey {
    pub fn from_bytes(bytes: [u8; PSK_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn generate() -> Self {
        Self::from_bytes(rand::random())
    }

    /// Parse a swarm key file:
    ///
    /// ```text
    /// /key/swarm/psk/1.0.0/
    /// /base16/
    /// <64 hex chars>
    /// ```
    ///
    /// The whole file may also be given base64-encoded, which is how it is
    /// usually embedded in configuration.
    pub fn parse(input: &str) -> Result<Self, PnetError> {
        let trimmed = input.trim();
        if trimmed.starts_with(SWARM_KEY_HEADER) {
            return Self::parse_swarm_key_file(trimmed);
        }

        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(trimmed)
                .map_err(|e| PnetError::InvalidKey(format!("not a swarm key file: {}", e)))?,
        );
        let text = std::str::from_utf8(&decoded)
            .map_err(|_| PnetError::InvalidKey("decoded key is not UTF-8".to_string()))?;
        Self::parse_swarm_key_file(text.trim())
    }

    fn parse_swarm_key_file(text: &str) -> Result<Self, PnetError> {
        let mut lines = text.lines().map(str::trim);
        if lines.next() != Some(SWARM_KEY_HEADER) {
            return Err(PnetError::InvalidKey("missing swarm key header".to_string()));
        }
        let encoding = lines
            .next()
            .ok_or_else(|| PnetError::InvalidKey("missing encoding line".to_string()))?;
        let body: String = lines.collect();

        let bytes = Zeroizing::new(match encoding {
            "/base16/" => hex::decode(&body).map_err(|e| PnetError::InvalidKey(e.to_string()))?,
            "/base64/" => base64::engine::general_purpose::STANDARD
                .decode(&body)
                .map_err(|e| PnetError::InvalidKey(e.to_string()))?,
            other => {
                return Err(PnetError::InvalidKey(format!(
                    "unsupported encoding {}",
                    other
                )))
            }
        });

        if bytes.len() != PSK_LEN {
            return Err(PnetError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                PSK_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; PSK_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self::from_bytes(key))
    }

    /// Render as a base16 swarm key file.
    pub fn to_swarm_key_file(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{}\n/base16/\n{}\n",
            SWARM_KEY_HEADER,
            hex::encode(self.0.as_slice())
        ))
    }

    /// Short fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(self.0.as_slice());
        hex::encode(&digest.as_bytes()[..4])
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreSharedKey({})", self.fingerprint())
    }
}

/// Read side of a guarded connection.
pub struct GuardedReader<R> {
    reader: R,
    cipher: FrameCipher,
}

impl<R: AsyncRead + Unpin> GuardedReader<R> {
    /// Returns Ok(None) on clean EOF.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, PnetError> {
        match wire::read_frame(&mut self.reader).await? {
            Some(sealed) => Ok(Some(self.cipher.open(&sealed)?)),
            None => Ok(None),
        }
    }
}

/// Write side of a guarded connection.
pub struct GuardedWriter<W> {
    writer: W,
    cipher: FrameCipher,
}

impl<W: AsyncWrite + Unpin> GuardedWriter<W> {
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), PnetError> {
        let sealed = self.cipher.seal(plaintext)?;
        wire::write_frame(&mut self.writer, &sealed).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PnetError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A connection whose peer has proven swarm membership.
pub struct GuardedConnection<S> {
    reader: GuardedReader<ReadHalf<S>>,
    writer: GuardedWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> GuardedConnection<S> {
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), PnetError> {
        self.writer.send_frame(plaintext).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, PnetError> {
        self.reader.recv_frame().await
    }

    pub fn into_split(self) -> (GuardedReader<ReadHalf<S>>, GuardedWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

fn proof(auth_key: &[u8], first: &[u8], second: &[u8]) -> Result<HmacSha256, PnetError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key)
        .map_err(|e| PnetError::HandshakeFailed(format!("HMAC init: {}", e)))?;
    mac.update(PROOF_LABEL);
    mac.update(first);
    mac.update(second);
    Ok(mac)
}

/// Run the PSK handshake over a raw stream.
///
/// On any mismatch the stream is dropped (closed) and `HandshakeFailed`
/// is returned. Callers must bound this with a timeout.
pub async fn protect<S>(mut stream: S, psk: &PreSharedKey) -> Result<GuardedConnection<S>, PnetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_nonce: [u8; NONCE_LEN] = rand::random();

    let mut hello = Vec::with_capacity(TAG_LEN + NONCE_LEN);
    hello.extend_from_slice(PROTOCOL_TAG);
    hello.extend_from_slice(&local_nonce);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut remote_hello = [0u8; TAG_LEN + NONCE_LEN];
    stream
        .read_exact(&mut remote_hello)
        .await
        .map_err(|e| PnetError::HandshakeFailed(format!("reading peer nonce: {}", e)))?;
    if &remote_hello[..TAG_LEN] != PROTOCOL_TAG {
        return Err(PnetError::HandshakeFailed(
            "peer does not speak the private network protocol".to_string(),
        ));
    }
    let remote_nonce = &remote_hello[TAG_LEN..];
    if bool::from(remote_nonce.ct_eq(&local_nonce[..])) {
        return Err(PnetError::HandshakeFailed("reflected nonce".to_string()));
    }

    let auth_key = derive_key(AUTH_CONTEXT, &[psk.as_bytes()]);
    let local_proof = proof(auth_key.as_slice(), &local_nonce, remote_nonce)?
        .finalize()
        .into_bytes();
    stream.write_all(&local_proof).await?;
    stream.flush().await?;

    let mut remote_proof = [0u8; 32];
    stream
        .read_exact(&mut remote_proof)
        .await
        .map_err(|e| PnetError::HandshakeFailed(format!("reading peer proof: {}", e)))?;
    proof(auth_key.as_slice(), remote_nonce, &local_nonce)?
        .verify_slice(&remote_proof)
        .map_err(|_| PnetError::HandshakeFailed("swarm key mismatch".to_string()))?;

    let send_key = derive_key(STREAM_CONTEXT, &[psk.as_bytes(), &local_nonce, remote_nonce]);
    let recv_key = derive_key(STREAM_CONTEXT, &[psk.as_bytes(), remote_nonce, &local_nonce]);

    let (reader, writer) = tokio::io::split(stream);
    Ok(GuardedConnection {
        reader: GuardedReader {
            reader,
            cipher: FrameCipher::new(&recv_key),
        },
        writer: GuardedWriter {
            writer,
            cipher: FrameCipher::new(&send_key),
        },
    })
}

//! Authenticated, forward-secret channel on top of a guarded connection.
//!
//! Handshake:
//! 1. both sides send `Hello { identity_key, ephemeral_key }`
//! 2. transcript = blake3(context, hellos ordered by ephemeral key)
//! 3. both sides send `Auth { ed25519(identity, "swarmd-auth" || transcript || own ephemeral) }`
//! 4. session keys come from the x25519 shared secret and the transcript
//!
//! The pnet guard says "this peer is in our network"; this layer says
//! "this peer is who it claims to be".

use crate::identity::{Identity, PeerId};
use crate::network::cipher::{derive_key, CipherError, FrameCipher};
use crate::network::message::WireMessage;
use crate::network::pnet::{GuardedConnection, GuardedReader, GuardedWriter, PnetError};
use crate::network::wire;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

const TRANSCRIPT_CONTEXT: &[u8] = b"swarmd secure channel v1";
const SESSION_CONTEXT: &str = "swarmd secure channel v1 session";
const AUTH_LABEL: &[u8] = b"swarmd-auth";

#[derive(Error, Debug)]
pub enum SecureChannelError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Transport error: {0}")]
    Transport(#[from] PnetError),
    #[error("Frame error: {0}")]
    Frame(#[from] CipherError),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Hello {
    identity_key: [u8; 32],
    ephemeral_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Auth {
    signature: Vec<u8>,
}

fn transcript_hash(a: &Hello, b: &Hello) -> [u8; 32] {
    let (first, second) = if a.ephemeral_key <= b.ephemeral_key {
        (a, b)
    } else {
        (b, a)
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_CONTEXT);
    for hello in [first, second] {
        hasher.update(&hello.identity_key);
        hasher.update(&hello.ephemeral_key);
    }
    *hasher.finalize().as_bytes()
}

fn auth_payload(transcript: &[u8; 32], ephemeral_key: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(AUTH_LABEL.len() + 64);
    payload.extend_from_slice(AUTH_LABEL);
    payload.extend_from_slice(transcript);
    payload.extend_from_slice(ephemeral_key);
    payload
}

async fn send_plain<W, T>(writer: &mut GuardedWriter<W>, message: &T) -> Result<(), SecureChannelError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = wire::encode(message).map_err(SecureChannelError::Protocol)?;
    writer.send_frame(&payload).await?;
    Ok(())
}

async fn recv_plain<R, T>(reader: &mut GuardedReader<R>) -> Result<T, SecureChannelError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = reader.recv_frame().await?.ok_or_else(|| {
        SecureChannelError::Protocol("connection closed during handshake".to_string())
    })?;
    wire::decode(&payload).map_err(SecureChannelError::Protocol)
}

/// Run the identity handshake. `expected` pins the remote PeerId when the
/// dialled address named one.
pub async fn handshake<S>(
    guarded: GuardedConnection<S>,
    identity: &Identity,
    expected: Option<PeerId>,
) -> Result<SecureConnection<S>, SecureChannelError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = guarded.into_split();

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let local_hello = Hello {
        identity_key: *identity.peer_id().as_bytes(),
        ephemeral_key: X25519PublicKey::from(&ephemeral).to_bytes(),
    };
    send_plain(&mut writer, &local_hello).await?;
    let remote_hello: Hello = recv_plain(&mut reader).await?;

    if remote_hello.ephemeral_key == local_hello.ephemeral_key {
        return Err(SecureChannelError::AuthenticationFailed(
            "reflected ephemeral key".to_string(),
        ));
    }

    let remote_peer = PeerId::from_bytes(remote_hello.identity_key);
    remote_peer
        .verifying_key()
        .map_err(|e| SecureChannelError::AuthenticationFailed(e.to_string()))?;
    if remote_peer == identity.peer_id() {
        return Err(SecureChannelError::AuthenticationFailed(
            "remote claims our own identity".to_string(),
        ));
    }
    if let Some(expected) = expected {
        if expected != remote_peer {
            return Err(SecureChannelError::AuthenticationFailed(format!(
                "expected peer {} but remote is {}",
                expected.short(),
                remote_peer.short()
            )));
        }
    }

    let transcript = transcript_hash(&local_hello, &remote_hello);
    let signature = identity.sign(&auth_payload(&transcript, &local_hello.ephemeral_key));
    send_plain(&mut writer, &Auth { signature }).await?;

    let remote_auth: Auth = recv_plain(&mut reader).await?;
    if !remote_peer.verify(
        &auth_payload(&transcript, &remote_hello.ephemeral_key),
        &remote_auth.signature,
    ) {
        return Err(SecureChannelError::AuthenticationFailed(format!(
            "bad handshake signature from {}",
            remote_peer.short()
        )));
    }

    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(remote_hello.ephemeral_key));
    if !shared.was_contributory() {
        return Err(SecureChannelError::AuthenticationFailed(
            "non-contributory key exchange".to_string(),
        ));
    }
    let send_key = derive_key(
        SESSION_CONTEXT,
        &[shared.as_bytes(), &transcript, &local_hello.ephemeral_key],
    );
    let recv_key = derive_key(
        SESSION_CONTEXT,
        &[shared.as_bytes(), &transcript, &remote_hello.ephemeral_key],
    );

    Ok(SecureConnection {
        reader: SecureReader {
            inner: reader,
            cipher: FrameCipher::new(&recv_key),
        },
        writer: SecureWriter {
            inner: writer,
            cipher: FrameCipher::new(&send_key),
        },
        remote_peer,
    })
}

pub struct SecureReader<R> {
    inner: GuardedReader<R>,
    cipher: FrameCipher,
}

impl<R: AsyncRead + Unpin> SecureReader<R> {
    /// Returns Ok(None) when the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>, SecureChannelError> {
        let Some(sealed) = self.inner.recv_frame().await? else {
            return Ok(None);
        };
        let plaintext = self.cipher.open(&sealed)?;
        let message = wire::decode(&plaintext).map_err(SecureChannelError::Protocol)?;
        Ok(Some(message))
    }
}

pub struct SecureWriter<W> {
    inner: GuardedWriter<W>,
    cipher: FrameCipher,
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    pub async fn send(&mut self, message: &WireMessage) -> Result<(), SecureChannelError> {
        let plaintext = wire::encode(message).map_err(SecureChannelError::Protocol)?;
        let sealed = self.cipher.seal(&plaintext)?;
        self.inner.send_frame(&sealed).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), SecureChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// An authenticated connection to a verified remote peer.
pub struct SecureConnection<S> {
    reader: SecureReader<ReadHalf<S>>,
    writer: SecureWriter<WriteHalf<S>>,
    remote_peer: PeerId,
}

impl<S: AsyncRead + AsyncWrite> SecureConnection<S> {
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<(), SecureChannelError> {
        self.writer.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<WireMessage>, SecureChannelError> {
        self.reader.recv().await
    }

    pub fn into_split(self) -> (SecureReader<ReadHalf<S>>, SecureWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::pnet::{protect, PreSharedKey};
    use tokio::io::DuplexStream;

    async fn guarded_pair() -> (GuardedConnection<DuplexStream>, GuardedConnection<DuplexStream>) {
        let psk = PreSharedKey::generate();
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (a, b) = tokio::join!(protect(left, &psk), protect(right, &psk));
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn test_mutual_authentication() {
        let (ga, gb) = guarded_pair().await;
        let alice = Identity::generate();
        let bob = Identity::generate();

        let (a, b) = tokio::join!(
            handshake(ga, &alice, Some(bob.peer_id())),
            handshake(gb, &bob, None)
        );
        let mut a = a.unwrap();
        let mut b = b.unwrap();
        assert_eq!(a.remote_peer(), bob.peer_id());
        assert_eq!(b.remote_peer(), alice.peer_id());

        let msg = WireMessage::Subscribe {
            topics: vec!["t".to_string()],
        };
        a.send(&msg).await.unwrap();
        match b.recv().await.unwrap() {
            Some(WireMessage::Subscribe { topics }) => assert_eq!(topics, vec!["t".to_string()]),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expected_peer_mismatch() {
        let (ga, gb) = guarded_pair().await;
        let alice = Identity::generate();
        let bob = Identity::generate();
        let someone_else = Identity::generate().peer_id();

        let (a, _b) = tokio::join!(
            handshake(ga, &alice, Some(someone_else)),
            handshake(gb, &bob, None)
        );
        assert!(matches!(a, Err(SecureChannelError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_impersonation_rejected() {
        let (ga, gb) = guarded_pair().await;
        let alice = Identity::generate();
        let victim = Identity::generate();
        let mallory = Identity::generate();

        // Mallory claims the victim's identity but can only sign with her own key.
        let impostor = async move {
            let (mut reader, mut writer) = gb.into_split();
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let hello = Hello {
                identity_key: *victim.peer_id().as_bytes(),
                ephemeral_key: X25519PublicKey::from(&ephemeral).to_bytes(),
            };
            send_plain(&mut writer, &hello).await.unwrap();
            let remote: Hello = recv_plain(&mut reader).await.unwrap();
            let transcript = transcript_hash(&hello, &remote);
            let signature = mallory.sign(&auth_payload(&transcript, &hello.ephemeral_key));
            send_plain(&mut writer, &Auth { signature }).await.unwrap();
            (reader, writer)
        };

        let (result, _halves) = tokio::join!(handshake(ga, &alice, None), impostor);
        assert!(matches!(
            result,
            Err(SecureChannelError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (ga, gb) = guarded_pair().await;
        let alice = Identity::generate();
        let (a, b) = tokio::join!(handshake(ga, &alice, None), handshake(gb, &alice, None));
        assert!(a.is_err());
        assert!(b.is_err());
    }

    #[test]
    fn test_transcript_is_order_independent() {
        let a = Hello {
            identity_key: [1; 32],
            ephemeral_key: [2; 32],
        };
        let b = Hello {
            identity_key: [3; 32],
            ephemeral_key: [4; 32],
        };
        assert_eq!(transcript_hash(&a, &b), transcript_hash(&b, &a));
    }
}

//! Connection handshake.
//!
//! Each side sends a [`Hello`] with its protocol version, its role and, when a secret key
//! is configured, a random challenge. Each side then answers the peer's hello. The answer
//! to a challenge is the own role followed by the challenge, sealed by ChaCha20-Poly1305.
//! The sealer and opener created during the handshake protect all following frames.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bincode::{DefaultOptions, Options};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use orion::aead::streaming::{Nonce, StreamOpener, StreamSealer, StreamTag};
use orion::kdf::SecretKey;
use orion::util::secure_rand_bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::internal::common::error::DsError;

const CHALLENGE_LENGTH: usize = 16;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub const SERVER_ROLE: &str = "server";
pub const WORKER_ROLE: &str = "worker";
pub const CLIENT_ROLE: &str = "client";

type FramedSink<T> = SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>;
type FramedStream<T> = SplitStream<Framed<T, LengthDelimitedCodec>>;

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct Hello {
    protocol: u32,
    role: Cow<'static, str>,
    #[serde(with = "serde_bytes")]
    challenge: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum HelloReply {
    Plain,
    Sealed {
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
        #[serde(with = "serde_bytes")]
        proof: Vec<u8>,
    },
    Rejected(String),
}

fn proof_payload(role: &str, challenge: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(role.len() + challenge.len());
    payload.extend_from_slice(role.as_bytes());
    payload.extend_from_slice(challenge);
    payload
}

pub(crate) struct Handshake {
    protocol: u32,
    role: &'static str,
    peer_role: &'static str,
    key: Option<Arc<SecretKey>>,
    challenge: Vec<u8>,
    sealer: Option<StreamSealer>,
    rejection: Option<String>,
}

impl Handshake {
    pub fn new(
        protocol: u32,
        role: &'static str,
        peer_role: &'static str,
        key: Option<Arc<SecretKey>>,
    ) -> Self {
        Handshake {
            protocol,
            role,
            peer_role,
            key,
            challenge: Vec::new(),
            sealer: None,
            rejection: None,
        }
    }

    pub fn hello(&mut self) -> crate::Result<Hello> {
        let challenge = if self.key.is_some() {
            let mut challenge = vec![0; CHALLENGE_LENGTH];
            secure_rand_bytes(&mut challenge).map_err(|_| "Cannot generate challenge")?;
            self.challenge.clone_from(&challenge);
            Some(challenge)
        } else {
            None
        };
        Ok(Hello {
            protocol: self.protocol,
            role: Cow::Borrowed(self.role),
            challenge,
        })
    }

    fn reject(&mut self, reason: String) -> HelloReply {
        self.rejection = Some(reason.clone());
        HelloReply::Rejected(reason)
    }

    pub fn reply(&mut self, hello: Hello) -> crate::Result<HelloReply> {
        if hello.protocol != self.protocol {
            return Ok(self.reject(format!(
                "Incompatible protocol version, expected {}, got {}",
                self.protocol, hello.protocol
            )));
        }
        if hello.role != self.peer_role {
            return Ok(self.reject(format!(
                "Expected peer role {}, got {}",
                self.peer_role, hello.role
            )));
        }
        let (challenge, key) = match (hello.challenge, self.key.clone()) {
            (None, None) => return Ok(HelloReply::Plain),
            (Some(_), None) => {
                return Ok(self.reject("Peer requests authentication".to_string()));
            }
            (None, Some(_)) => {
                return Ok(self.reject("Peer does not support authentication".to_string()));
            }
            (Some(challenge), Some(key)) => (challenge, key),
        };
        if challenge.len() != CHALLENGE_LENGTH {
            return Ok(self.reject(format!(
                "Invalid length of challenge ({})",
                challenge.len()
            )));
        }
        let (mut sealer, nonce) = StreamSealer::new(&key).map_err(|_| "Cannot create sealer")?;
        let proof = sealer
            .seal_chunk(&proof_payload(self.role, &challenge), &StreamTag::Message)
            .map_err(|_| "Cannot seal challenge")?;
        self.sealer = Some(sealer);
        Ok(HelloReply::Sealed {
            nonce: nonce.as_ref().to_vec(),
            proof,
        })
    }

    pub fn finish(
        mut self,
        reply: HelloReply,
    ) -> crate::Result<(Option<StreamSealer>, Option<StreamOpener>)> {
        if let Some(reason) = self.rejection.take() {
            return Err(format!("Authentication failed: {reason}").into());
        }
        let opener = match (reply, &self.key) {
            (HelloReply::Rejected(reason), _) => {
                return Err(format!("Peer rejected authentication: {reason}").into());
            }
            (HelloReply::Plain, None) => None,
            (HelloReply::Sealed { nonce, proof }, Some(key)) => {
                let nonce = Nonce::from_slice(&nonce).map_err(|_| "Invalid nonce")?;
                let mut opener =
                    StreamOpener::new(key, &nonce).map_err(|_| "Cannot create opener")?;
                let (opened, tag) = opener
                    .open_chunk(&proof)
                    .map_err(|_| DsError::from("Cannot verify challenge"))?;
                if tag != StreamTag::Message
                    || opened != proof_payload(self.peer_role, &self.challenge)
                {
                    return Err("Received challenge does not match".into());
                }
                Some(opener)
            }
            _ => return Err("Peer answered with a different authentication mode".into()),
        };
        log::debug!("Handshake with {} finished", self.peer_role);
        Ok((self.sealer, opener))
    }
}

async fn send_frame<T: AsyncRead + AsyncWrite>(
    writer: &mut FramedSink<T>,
    data: Vec<u8>,
) -> crate::Result<()> {
    match timeout(HANDSHAKE_TIMEOUT, writer.send(data.into())).await {
        Ok(result) => result.map_err(|_| DsError::from("Cannot send handshake message")),
        Err(_) => Err("Sending handshake message timed out".into()),
    }
}

async fn receive_frame<T: AsyncRead + AsyncWrite, M: DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> crate::Result<M> {
    match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Ok(Some(data)) => deserialize(&data?),
        Ok(None) => Err("Connection closed during handshake".into()),
        Err(_) => Err("Handshake message did not arrive in time".into()),
    }
}

/// Runs the handshake over a freshly opened connection.
pub async fn do_authentication<T: AsyncRead + AsyncWrite>(
    protocol: u32,
    role: &'static str,
    peer_role: &'static str,
    key: Option<Arc<SecretKey>>,
    writer: &mut FramedSink<T>,
    reader: &mut FramedStream<T>,
) -> crate::Result<(Option<StreamSealer>, Option<StreamOpener>)> {
    let mut handshake = Handshake::new(protocol, role, peer_role, key);

    send_frame(writer, serialize(&handshake.hello()?)?).await?;
    let peer_hello: Hello = receive_frame(reader).await?;

    let reply = handshake.reply(peer_hello)?;
    send_frame(writer, serialize(&reply)?).await?;
    let peer_reply: HelloReply = receive_frame(reader).await?;

    handshake.finish(peer_reply)
}

pub fn open_message<T: DeserializeOwned>(
    opener: &mut Option<StreamOpener>,
    data: &[u8],
) -> crate::Result<T> {
    let Some(opener) = opener else {
        return deserialize(data);
    };
    match opener.open_chunk(data) {
        Ok((opened, StreamTag::Message)) => deserialize(&opened),
        Ok(_) => Err("Unexpected stream tag".into()),
        Err(_) => Err("Cannot decrypt message".into()),
    }
}

pub fn seal_message(sealer: &mut Option<StreamSealer>, data: Bytes) -> crate::Result<Bytes> {
    let Some(sealer) = sealer else {
        return Ok(data);
    };
    let sealed = sealer
        .seal_chunk(&data, &StreamTag::Message)
        .map_err(|_| DsError::from("Cannot seal message"))?;
    Ok(sealed.into())
}

fn bincode_options() -> impl Options {
    DefaultOptions::new()
        .with_limit(crate::MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize + ?Sized>(value: &T) -> crate::Result<Vec<u8>> {
    bincode_options()
        .serialize(value)
        .map_err(|e| DsError::SerializationError(format!("Serialization failed: {e:?}")))
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> crate::Result<T> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| DsError::SerializationError(format!("Deserialization failed: {e:?}")))
}

/// Seals and sends everything that arrives into `queue`, until the queue is closed.
pub async fn forward_queue_to_sealed_sink<S>(
    mut queue: UnboundedReceiver<Bytes>,
    mut sink: S,
    mut sealer: Option<StreamSealer>,
) -> crate::Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    while let Some(data) = queue.recv().await {
        let frame = seal_message(&mut sealer, data)?;
        sink.send(frame).await.inspect_err(|_| {
            log::debug!("Forwarding of a queued message failed");
        })?;
    }
    Ok(())
}

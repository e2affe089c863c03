// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client helper for talking to the steplog hub over Unix sockets
//! (CBOR-framed), plus a [`Replica`] that keeps a local copy of the log.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use steplog_proto::{
    wire::{decode_message, encode_message, frame_len, WireError, HEADER_BYTES},
    ErrorPayload, HandshakeAckPayload, HandshakePayload, Message, PollCursor, PushAckPayload,
    PushStepPayload, Step,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

mod replica;

pub use replica::{Reconcile, Replica};

/// Protocol version this client speaks.
pub const CLIENT_VERSION: u32 = 1;

/// Error type for hub conversations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A packet could not be framed or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The hub closed the connection while a reply was outstanding.
    #[error("hub closed the connection")]
    Closed,
    /// The hub refused the request.
    #[error("hub refused the request: {} ({})", .0.name, .0.message)]
    Refused(ErrorPayload),
}

/// Minimal async client over Unix sockets.
///
/// Messages that arrive while a request waits for its reply (commits of
/// other clients, mostly) are kept and handed out by [`Self::poll_message`]
/// in arrival order.
pub struct SessionClient {
    stream: UnixStream,
    max_frame_bytes: usize,
    backlog: VecDeque<Message>,
}

impl SessionClient {
    /// Connect to the hub at the given Unix socket path.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            max_frame_bytes: steplog_proto::wire::DEFAULT_MAX_PAYLOAD,
            backlog: VecDeque::new(),
        }
    }

    /// Refuse frames whose payload exceeds `max` bytes.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Send one message. The hub stamps its own timestamps; ours is 0.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        let pkt = encode_message(msg, 0)?;
        self.stream.write_all(&pkt).await?;
        Ok(())
    }

    /// Introduce ourselves and wait for the ack.
    pub async fn handshake(
        &mut self,
        agent_id: Option<String>,
    ) -> Result<HandshakeAckPayload, ClientError> {
        self.send(&Message::Handshake(HandshakePayload {
            agent_id,
            client_version: CLIENT_VERSION,
        }))
        .await?;
        self.await_reply("handshake", |msg| match msg {
            Message::HandshakeAck(ack) => Ok(ack),
            other => Err(other),
        })
        .await
    }

    /// Submit a step. Fire-and-forget: the commit comes back as a
    /// `step_committed` broadcast, a refusal as an `error`.
    pub async fn submit_step(&mut self, step: Step) -> Result<(), ClientError> {
        self.send(&Message::SubmitStep(step)).await
    }

    /// Offer our local history. The hub either seeds from it or answers with a
    /// `synchronize`.
    pub async fn bootstrap(&mut self, history: Vec<Step>) -> Result<(), ClientError> {
        self.send(&Message::Bootstrap { history }).await
    }

    /// Ask for the authoritative snapshot; it arrives as a `synchronize`.
    pub async fn request_resync(&mut self) -> Result<(), ClientError> {
        self.send(&Message::RequestResync).await
    }

    /// Long-poll for committed steps after `cursor`. Blocks until there is at
    /// least one.
    pub async fn poll_since(&mut self, cursor: PollCursor) -> Result<Vec<Step>, ClientError> {
        self.send(&Message::PollSince { cursor }).await?;
        self.await_reply("poll_since", |msg| match msg {
            Message::PollResult { steps } => Ok(steps),
            other => Err(other),
        })
        .await
    }

    /// Push a step and wait for its ack.
    pub async fn push_step(&mut self, push: PushStepPayload) -> Result<PushAckPayload, ClientError> {
        self.send(&Message::PushStep(push)).await?;
        self.await_reply("push_step", |msg| match msg {
            Message::PushAck(ack) => Ok(ack),
            other => Err(other),
        })
        .await
    }

    // Refusals tagged with another op answer earlier fire-and-forget
    // requests and are backlogged like broadcasts. Untagged ones come from
    // frames the hub could not read at all and end the wait.
    async fn await_reply<T>(
        &mut self,
        op: &str,
        mut pick: impl FnMut(Message) -> Result<T, Message>,
    ) -> Result<T, ClientError> {
        loop {
            let Some(msg) = self.read_message().await? else {
                return Err(ClientError::Closed);
            };
            match msg {
                Message::Error(err) if err.op.as_deref().is_none_or(|answered| answered == op) => {
                    return Err(ClientError::Refused(err));
                }
                msg => match pick(msg) {
                    Ok(reply) => return Ok(reply),
                    Err(other) => {
                        debug!(op = other.op_name(), "message queued while awaiting reply");
                        self.backlog.push_back(other);
                    }
                },
            }
        }
    }

    /// Next message from the hub. Returns Ok(None) when the stream is closed
    /// before any bytes are read.
    pub async fn poll_message(&mut self) -> Result<Option<Message>, ClientError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(Some(msg));
        }
        self.read_message().await
    }

    // Reads until a full frame header is buffered so short reads cannot
    // desynchronize framing.
    async fn read_message(&mut self) -> Result<Option<Message>, ClientError> {
        let mut header = [0u8; HEADER_BYTES];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.stream.read(&mut header[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "truncated frame header: read {} of {} bytes",
                        read,
                        header.len()
                    ),
                )
                .into());
            }
            read += n;
        }
        let Some(total) = frame_len(&header, self.max_frame_bytes)? else {
            return Err(WireError::Incomplete.into());
        };
        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(&header);
        packet.resize(total, 0);
        self.stream.read_exact(&mut packet[HEADER_BYTES..]).await?;
        let (msg, _ts, _) = decode_message(&packet)?;
        Ok(Some(msg))
    }
}

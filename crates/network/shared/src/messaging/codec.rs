//! Stream Codec
//!
//! Responsibilities:
//! - Length-prefix framing: [u32_be length][payload bytes] (tokio-util
//!   `LengthDelimitedCodec`).
//! - (De)serialization of [`Envelope`] via `bincode`; the packet variant tag is
//!   encoded with every envelope.
//! - Envelope ID assignment. IDs come from one atomic [`IdGenerator`] per
//!   connection, so concurrent writers never receive the same ID.
//!
//! Error Handling:
//! - A frame that arrived intact but does not decode yields
//!   [`CodecError::Decode`]; the stream is still aligned and the caller may
//!   keep reading.
//! - Everything else (I/O failure, oversized length prefix) is
//!   [`CodecError::Io`] and leaves the stream unusable.
//!
//! (C) Forge of Stories

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::envelope::Envelope;
use crate::ids::IdGenerator;
use crate::protocol::Packet;
use crate::serialization::{BincodeSerializer, MessageSerializer, SerializationError};

/// Default maximum accepted frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope encode failed: {0}")]
    Encode(#[source] SerializationError),
    #[error("undecodable frame of {len} bytes: {source}")]
    Decode {
        len: usize,
        #[source]
        source: SerializationError,
    },
    #[error("outgoing frame of {len} bytes exceeds max_frame_size {max}")]
    FrameTooLarge { len: usize, max: usize },
}

impl CodecError {
    /// Whether the underlying stream can still be read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Decode { .. })
    }
}

fn frame_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_size)
        .new_codec()
}

/// Write half of an envelope stream.
pub struct EnvelopeWriter<W> {
    frames: FramedWrite<W, LengthDelimitedCodec>,
    ids: IdGenerator,
    serializer: BincodeSerializer,
    max_frame_size: usize,
}

impl<W> EnvelopeWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, max_frame_size: usize) -> Self {
        Self {
            frames: FramedWrite::new(writer, frame_codec(max_frame_size)),
            ids: IdGenerator::for_packets(),
            serializer: BincodeSerializer,
            max_frame_size,
        }
    }

    /// Reserve the next envelope ID without writing anything.
    ///
    /// Lets the caller register interest in a response before the request can
    /// possibly be answered.
    #[inline]
    pub fn assign_id(&self) -> u64 {
        self.ids.next()
    }

    /// Assign an ID, wrap `packet` and write it. Returns the assigned ID.
    pub async fn write(&mut self, responding_to: u64, packet: Packet) -> Result<u64, CodecError> {
        let envelope = Envelope::new(self.assign_id(), responding_to, packet);
        self.write_envelope(&envelope).await?;
        Ok(envelope.id)
    }

    /// Write an envelope whose ID was obtained from [`EnvelopeWriter::assign_id`].
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), CodecError> {
        let bytes = self
            .serializer
            .serialize(envelope)
            .map_err(CodecError::Encode)?;
        if bytes.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                len: bytes.len(),
                max: self.max_frame_size,
            });
        }
        self.frames.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Flush and shut the write side down.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        SinkExt::<Bytes>::close(&mut self.frames).await?;
        Ok(())
    }
}

/// Read half of an envelope stream.
pub struct EnvelopeReader<R> {
    frames: FramedRead<R, LengthDelimitedCodec>,
    serializer: BincodeSerializer,
}

impl<R> EnvelopeReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            frames: FramedRead::new(reader, frame_codec(max_frame_size)),
            serializer: BincodeSerializer,
        }
    }

    /// Wait for the next complete envelope. `Ok(None)` means the peer closed
    /// the stream cleanly.
    pub async fn read(&mut self) -> Result<Option<Envelope>, CodecError> {
        let Some(frame) = self.frames.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        self.serializer
            .deserialize::<Envelope>(&frame)
            .map(Some)
            .map_err(|source| CodecError::Decode {
                len: frame.len(),
                source,
            })
    }
}

/// Split-free convenience for tests and single-task users.
pub fn envelope_pair<R, W>(
    reader: R,
    writer: W,
    max_frame_size: usize,
) -> (EnvelopeReader<R>, EnvelopeWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (
        EnvelopeReader::new(reader, max_frame_size),
        EnvelopeWriter::new(writer, max_frame_size),
    )
}

//! Framing and envelope transport helpers.

pub mod codec;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, EnvelopeReader, EnvelopeWriter, envelope_pair};

//! Shared networking types.
//!
//! This crate hosts the protocol primitives both ends of a connection agree on:
//! - protocol: the closed packet catalog
//! - envelope: ID / responding-to wrapper around every packet
//! - payload: dynamically typed unit arguments and results
//! - messaging: length-prefixed envelope codec
//! - ids / serialization: ID generation and the bincode serializer
//!
//! Keep this crate lean: no TLS, no peer logic.

pub mod envelope;
pub mod ids;
pub mod messaging;
pub mod payload;
pub mod protocol;
pub mod serialization;

pub use envelope::Envelope;
pub use payload::{Payload, PayloadError};
pub use protocol::{ActionMode, Packet, UnitKind};

/// Convenience prelude for downstream crates.
pub mod prelude {
    pub use crate::envelope::Envelope;
    pub use crate::messaging::{CodecError, EnvelopeReader, EnvelopeWriter};
    pub use crate::payload::Payload;
    pub use crate::protocol::{
        ActionMode, ActionResponse, Authenticate, AuthenticateInvalid, AuthenticateResponse,
        Failure, ListUnits, ListUnitsResponse, Notify, Packet, PerformAction, Subscribe, UnitKind,
    };
}

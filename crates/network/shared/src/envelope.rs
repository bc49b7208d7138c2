//! Nachrichteneinhüllung und Korrelation.

use serde::{Deserialize, Serialize};

use crate::protocol::Packet;

/// Wire-level wrapper around one packet.
///
/// `id` is assigned by the sender and only unique within one connection.
/// `responding_to` names the request this envelope answers, `0` if none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub responding_to: u64,
    pub payload: Packet,
}

impl Envelope {
    pub const NOT_A_RESPONSE: u64 = 0;

    pub fn new(id: u64, responding_to: u64, payload: Packet) -> Self {
        Self {
            id,
            responding_to,
            payload,
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.responding_to != Self::NOT_A_RESPONSE
    }
}

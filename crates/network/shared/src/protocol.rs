//! Packet catalog.
//!
//! The closed set of packets two peers exchange. Every packet travels inside an
//! [`Envelope`](crate::envelope::Envelope); the variant tag is part of each
//! encoded value so the receiver can dispatch without any out-of-band schema.
//!
//! Behaviour (what a peer does on receipt) lives with the peer runtime; this
//! module only defines the data.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Sent with `Authenticate`; peers refuse a handshake from another version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Which unit table a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitKind {
    Action,
    Receiver,
}

impl UnitKind {
    pub const fn label(self) -> &'static str {
        match self {
            UnitKind::Action => "action",
            UnitKind::Receiver => "receiver",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the receiving peer should do with a `PerformAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionMode {
    /// Run the action and answer with its result.
    Perform,
    /// Fan an already produced result out to the action's subscribers.
    Publish,
    /// Run the action, then publish its result.
    PerformAndPublish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    pub version: u16,
    pub token: String,
}

impl Authenticate {
    /// Handshake for the current [`PROTOCOL_VERSION`].
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub granted: bool,
    /// Permission bitmask granted to the connection.
    pub permitted: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateInvalid {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformAction {
    pub action: String,
    pub arg: Payload,
    pub mode: ActionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action: String,
    pub data: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUnits {
    pub kind: UnitKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListUnitsResponse {
    pub kind: UnitKind,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    /// Address under which the subscriber can be reached.
    pub address: String,
    pub action: String,
    pub receiver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub receiver: String,
    pub data: Payload,
}

/// Error reply to any request whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Authenticate(Authenticate),
    AuthenticateResponse(AuthenticateResponse),
    AuthenticateInvalid(AuthenticateInvalid),
    PerformAction(PerformAction),
    ActionResponse(ActionResponse),
    ListUnits(ListUnits),
    ListUnitsResponse(ListUnitsResponse),
    Subscribe(Subscribe),
    Notify(Notify),
    Failure(Failure),
    Empty,
}

impl Packet {
    /// Stable label for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Authenticate(_) => "Authenticate",
            Packet::AuthenticateResponse(_) => "AuthenticateResponse",
            Packet::AuthenticateInvalid(_) => "AuthenticateInvalid",
            Packet::PerformAction(_) => "PerformAction",
            Packet::ActionResponse(_) => "ActionResponse",
            Packet::ListUnits(_) => "ListUnits",
            Packet::ListUnitsResponse(_) => "ListUnitsResponse",
            Packet::Subscribe(_) => "Subscribe",
            Packet::Notify(_) => "Notify",
            Packet::Failure(_) => "Failure",
            Packet::Empty => "Empty",
        }
    }

    pub fn is_authenticate(&self) -> bool {
        matches!(self, Packet::Authenticate(_))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Packet::Failure(Failure {
            message: message.into(),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never print bearer tokens.
            Packet::Authenticate(_) => f.write_str("Authenticate{token: <redacted>}"),
            Packet::AuthenticateResponse(r) => write!(
                f,
                "AuthenticateResponse{{granted: {}, permitted: {:#x}}}",
                r.granted, r.permitted
            ),
            Packet::AuthenticateInvalid(r) => write!(f, "AuthenticateInvalid{{{}}}", r.error),
            Packet::PerformAction(p) => write!(
                f,
                "PerformAction{{action: {}, mode: {:?}, arg: {}}}",
                p.action, p.mode, p.arg
            ),
            Packet::ActionResponse(r) => {
                write!(f, "ActionResponse{{action: {}, data: {}}}", r.action, r.data)
            }
            Packet::ListUnits(l) => write!(f, "ListUnits{{{}}}", l.kind),
            Packet::ListUnitsResponse(l) => {
                write!(f, "ListUnitsResponse{{{}: {:?}}}", l.kind, l.values)
            }
            Packet::Subscribe(s) => write!(
                f,
                "Subscribe{{address: {}, action: {}, receiver: {}}}",
                s.address, s.action, s.receiver
            ),
            Packet::Notify(n) => write!(f, "Notify{{receiver: {}, data: {}}}", n.receiver, n.data),
            Packet::Failure(e) => write!(f, "Failure{{{}}}", e.message),
            Packet::Empty => f.write_str("Empty"),
        }
    }
}

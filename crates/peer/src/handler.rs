//! What a peer does with each inbound packet.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use auth::{AuthError, Grant, Permissions, UnitOperation};
use network_shared::protocol::{
    ActionResponse, Authenticate, AuthenticateResponse, ListUnits, ListUnitsResponse, Notify,
    PROTOCOL_VERSION, PerformAction, Subscribe,
};
use network_shared::{ActionMode, Packet, UnitKind};
use tracing::{debug, info, warn};

use crate::connection::{AuthGate, Role};
use crate::error::PeerError;
use crate::peer::{LocalPeer, Peer};
use crate::subscription::Subscription;

/// Everything a packet handler may touch, passed explicitly per packet.
pub struct HandlerContext {
    local: Arc<LocalPeer>,
    remote_addr: SocketAddr,
    role: Role,
    /// `None` for connections we dialed ourselves: their traffic is trusted.
    grant: Option<Arc<Grant>>,
    /// Accepting side only; resolved by `Authenticate`.
    gate: Option<AuthGate>,
}

impl HandlerContext {
    pub fn new(
        local: Arc<LocalPeer>,
        remote_addr: SocketAddr,
        role: Role,
        grant: Option<Arc<Grant>>,
        gate: Option<AuthGate>,
    ) -> Self {
        Self {
            local,
            remote_addr,
            role,
            grant,
            gate,
        }
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn require(&self, needed: Permissions) -> Result<(), PeerError> {
        match &self.grant {
            Some(grant) if !grant.permitted.has(needed) => Err(PeerError::PermissionDenied),
            _ => Ok(()),
        }
    }

    fn require_unit(&self, kind: UnitKind, name: &str, op: UnitOperation) -> Result<(), PeerError> {
        match &self.grant {
            Some(grant) if !grant.claims.is_authorized(kind, name, op) => {
                Err(PeerError::PermissionDenied)
            }
            _ => Ok(()),
        }
    }
}

/// Receiving-side behaviour of a packet. `Ok(Some(_))` is sent back as the
/// correlated response; errors are answered with `Failure`.
#[async_trait]
pub trait PacketHandler: Sized {
    async fn handle(self, ctx: &HandlerContext) -> Result<Option<Packet>, PeerError>;
}

#[async_trait]
impl PacketHandler for Packet {
    async fn handle(self, ctx: &HandlerContext) -> Result<Option<Packet>, PeerError> {
        match self {
            Packet::Authenticate(p) => Ok(Some(authenticate(p, ctx))),
            Packet::PerformAction(p) => perform_action(p, ctx).await,
            Packet::ListUnits(p) => list_units(p, ctx).map(Some),
            Packet::Subscribe(p) => subscribe(p, ctx).await.map(Some),
            Packet::Notify(p) => notify(p, ctx).await.map(|()| None),
            Packet::Failure(f) => {
                warn!(
                    target: "peer::net::connection",
                    "{} reported failure: {}", ctx.remote_addr, f.message
                );
                Ok(None)
            }
            // Responses that reached no waiter.
            other @ (Packet::AuthenticateResponse(_)
            | Packet::AuthenticateInvalid(_)
            | Packet::ActionResponse(_)
            | Packet::ListUnitsResponse(_)
            | Packet::Empty) => {
                debug!(
                    target: "peer::net::connection",
                    "dropping unsolicited {} from {}", other.kind(), ctx.remote_addr
                );
                Ok(None)
            }
        }
    }
}

fn authenticate(p: Authenticate, ctx: &HandlerContext) -> Packet {
    if let Some(gate) = &ctx.gate {
        if !gate.is_pending() {
            warn!(
                target: "peer::net::handshake",
                "{} sent Authenticate after the handshake resolved, ignored", ctx.remote_addr
            );
            return refused(AuthError::OPAQUE);
        }
    }

    if p.version != PROTOCOL_VERSION {
        warn!(
            target: "peer::net::handshake",
            "{} speaks protocol {}, expected {PROTOCOL_VERSION}", ctx.remote_addr, p.version
        );
        if let Some(gate) = &ctx.gate {
            gate.deny();
        }
        return refused(AuthError::OPAQUE);
    }

    let source = ctx.remote_addr.ip();
    match ctx.local.auth().authenticate(&p.token, source) {
        Ok(grant) => {
            let permitted = grant.permitted;
            // A concurrent Authenticate may have resolved the gate first.
            if !ctx.gate.as_ref().is_none_or(|gate| gate.grant(grant)) {
                return refused(AuthError::OPAQUE);
            }
            info!(
                target: "peer::net::handshake",
                "{} authenticated, permitted {permitted}", ctx.remote_addr
            );
            Packet::AuthenticateResponse(AuthenticateResponse {
                granted: true,
                permitted: permitted.bits(),
                error: None,
            })
        }
        Err(e) => {
            if let Some(gate) = &ctx.gate {
                gate.deny();
            }
            refused(e.wire_message())
        }
    }
}

fn refused(message: &str) -> Packet {
    Packet::AuthenticateResponse(AuthenticateResponse {
        granted: false,
        permitted: 0,
        error: Some(message.to_string()),
    })
}

async fn perform_action(
    p: PerformAction,
    ctx: &HandlerContext,
) -> Result<Option<Packet>, PeerError> {
    let PerformAction { action, arg, mode } = p;
    match mode {
        ActionMode::Perform => {
            ctx.require(Permissions::PERFORM_ACTIONS)?;
            ctx.require_unit(UnitKind::Action, &action, UnitOperation::Run)?;
            let data = ctx.local.run(&action, arg).await?;
            Ok(Some(Packet::ActionResponse(ActionResponse { action, data })))
        }
        ActionMode::Publish => {
            ctx.require(Permissions::PUBLISH_ACTIONS)?;
            ctx.require_unit(UnitKind::Action, &action, UnitOperation::Publish)?;
            ctx.local.publish(&action, arg).await?;
            Ok(Some(Packet::Empty))
        }
        ActionMode::PerformAndPublish => {
            ctx.require(Permissions::PERFORM_ACTIONS | Permissions::PUBLISH_ACTIONS)?;
            ctx.require_unit(UnitKind::Action, &action, UnitOperation::Run)?;
            ctx.require_unit(UnitKind::Action, &action, UnitOperation::Publish)?;
            ctx.local.run_and_publish(&action, arg).await?;
            Ok(Some(Packet::Empty))
        }
    }
}

fn list_units(p: ListUnits, ctx: &HandlerContext) -> Result<Packet, PeerError> {
    let needed = match p.kind {
        UnitKind::Action => Permissions::READ_ACTIONS,
        UnitKind::Receiver => Permissions::READ_RECEIVERS,
    };
    ctx.require(needed)?;
    Ok(Packet::ListUnitsResponse(ListUnitsResponse {
        kind: p.kind,
        values: ctx.local.unit_names(p.kind),
    }))
}

async fn subscribe(p: Subscribe, ctx: &HandlerContext) -> Result<Packet, PeerError> {
    ctx.require(Permissions::SUBSCRIBE)?;
    ctx.require_unit(UnitKind::Action, &p.action, UnitOperation::Subscribe)?;
    ctx.local
        .subscribe(Subscription::new(p.address, p.action, p.receiver))
        .await?;
    Ok(Packet::Empty)
}

async fn notify(p: Notify, ctx: &HandlerContext) -> Result<(), PeerError> {
    ctx.require(Permissions::NOTIFY_RECEIVERS)?;
    ctx.require_unit(UnitKind::Receiver, &p.receiver, UnitOperation::Notify)?;
    ctx.local.notify(&p.receiver, p.data).await
}

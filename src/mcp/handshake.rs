//! Handshake state machine.
//!
//! `Uninitialized -> Negotiating -> Ready -> Closed`, with
//! `Negotiating -> Failed -> Closed` when negotiation goes wrong. Shared by the
//! client and by each server session.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tracing::{debug, warn};

use super::{
    errors::{MCPError, MCPResult},
    protocol::{methods, Implementation, ProtocolVersion},
};

/// Handshake states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Nothing exchanged yet
    Uninitialized,
    /// `initialize` sent (client) or received (server)
    Negotiating,
    /// `notifications/initialized` sent (client) or received (server)
    Ready,
    /// Negotiation failed
    Failed(String),
    /// Session closed
    Closed,
}

impl Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Uninitialized => write!(f, "uninitialized"),
            HandshakeState::Negotiating => write!(f, "negotiating"),
            HandshakeState::Ready => write!(f, "ready"),
            HandshakeState::Failed(reason) => write!(f, "failed ({})", reason),
            HandshakeState::Closed => write!(f, "closed"),
        }
    }
}

/// What the handshake established about the peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo<C> {
    pub implementation: Implementation,
    pub capabilities: C,
    pub protocol_version: ProtocolVersion,
}

struct Inner<C> {
    state: HandshakeState,
    peer: Option<PeerInfo<C>>,
}

/// Thread-safe handshake tracker, generic over the peer's capability type
pub struct Handshake<C> {
    inner: RwLock<Inner<C>>,
}

impl<C: Clone> Handshake<C> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: HandshakeState::Uninitialized,
                peer: None,
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.read().state.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.read().state == HandshakeState::Ready
    }

    /// Snapshot of the negotiated peer, once known
    pub fn peer(&self) -> Option<PeerInfo<C>> {
        self.inner.read().peer.clone()
    }

    /// `Uninitialized -> Negotiating`
    pub fn begin(&self) -> MCPResult<()> {
        self.transition(|state| match state {
            HandshakeState::Uninitialized => Ok(HandshakeState::Negotiating),
            other => Err(other),
        })
    }

    /// Record the peer while still negotiating. The peer's identity is
    /// immutable once stored.
    pub fn record_peer(&self, peer: PeerInfo<C>) -> MCPResult<()> {
        let mut inner = self.inner.write();
        if inner.state != HandshakeState::Negotiating {
            return Err(MCPError::invalid_request(format!(
                "Cannot record peer while {}",
                inner.state
            )));
        }
        if inner.peer.is_some() {
            return Err(MCPError::invalid_request("Peer already recorded"));
        }
        inner.peer = Some(peer);
        Ok(())
    }

    /// `Negotiating -> Ready`
    pub fn complete(&self) -> MCPResult<()> {
        self.transition(|state| match state {
            HandshakeState::Negotiating => Ok(HandshakeState::Ready),
            other => Err(other),
        })
    }

    /// `Negotiating -> Failed`
    pub fn fail(&self, reason: impl Into<String>) -> MCPResult<()> {
        let reason = reason.into();
        warn!("Handshake failed: {}", reason);
        self.transition(move |state| match state {
            HandshakeState::Negotiating => Ok(HandshakeState::Failed(reason)),
            other => Err(other),
        })
    }

    /// Any state -> `Closed`
    pub fn close(&self) {
        let mut inner = self.inner.write();
        debug!("Handshake {} -> closed", inner.state);
        inner.state = HandshakeState::Closed;
    }

    /// Gate a method on the handshake: only `initialize` and `ping` are
    /// allowed before `Ready`, nothing is allowed after `Closed`.
    pub fn ensure_ready_for(&self, method: &str) -> MCPResult<()> {
        match &self.inner.read().state {
            HandshakeState::Ready => Ok(()),
            HandshakeState::Closed => Err(MCPError::connection_closed("Session closed")),
            _ if methods::is_handshake_exempt(method) => Ok(()),
            _ => Err(MCPError::not_initialized(method)),
        }
    }

    fn transition<F>(&self, step: F) -> MCPResult<()>
    where
        F: FnOnce(&HandshakeState) -> Result<HandshakeState, &HandshakeState>,
    {
        let mut inner = self.inner.write();
        let next = match step(&inner.state) {
            Ok(next) => next,
            Err(current) => {
                return Err(MCPError::invalid_request(format!(
                    "Illegal handshake transition from {}",
                    current
                )))
            }
        };
        debug!("Handshake {} -> {}", inner.state, next);
        inner.state = next;
        Ok(())
    }
}

impl<C: Clone> Default for Handshake<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{errors::ErrorCode, protocol::ServerCapabilities};

    fn peer() -> PeerInfo<ServerCapabilities> {
        PeerInfo {
            implementation: Implementation::new("server", "1.0.0"),
            capabilities: ServerCapabilities::default(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    #[test]
    fn test_happy_path() {
        let handshake = Handshake::<ServerCapabilities>::new();
        assert_eq!(handshake.state(), HandshakeState::Uninitialized);

        handshake.begin().unwrap();
        handshake.record_peer(peer()).unwrap();
        handshake.complete().unwrap();
        assert!(handshake.is_ready());
        assert_eq!(handshake.peer().unwrap().implementation.name, "server");

        handshake.close();
        assert_eq!(handshake.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_failure_path() {
        let handshake = Handshake::<ServerCapabilities>::new();
        handshake.begin().unwrap();
        handshake.fail("version mismatch").unwrap();
        assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
        assert!(handshake.complete().is_err());

        handshake.close();
        assert_eq!(handshake.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_illegal_transitions() {
        let handshake = Handshake::<ServerCapabilities>::new();
        assert!(handshake.complete().is_err());
        assert!(handshake.record_peer(peer()).is_err());

        handshake.begin().unwrap();
        assert!(handshake.begin().is_err());
        handshake.record_peer(peer()).unwrap();
        assert!(handshake.record_peer(peer()).is_err());
    }

    #[test]
    fn test_gating() {
        let handshake = Handshake::<ServerCapabilities>::new();
        assert!(handshake.ensure_ready_for("initialize").is_ok());
        assert!(handshake.ensure_ready_for("ping").is_ok());

        let err = handshake.ensure_ready_for("tools/call").unwrap_err();
        assert!(err.is(ErrorCode::NotInitialized));

        handshake.begin().unwrap();
        handshake.complete().unwrap();
        assert!(handshake.ensure_ready_for("tools/call").is_ok());

        handshake.close();
        assert!(handshake.ensure_ready_for("ping").is_err());
    }
}

//! Stateless signaling relay
//!
//! Forwards call signaling between clients by identity. The relay keeps no
//! call state: every message already names its target, so forwarding is a
//! registry lookup plus a fan-out. A target with no live connections is not
//! an error; invites are never queued for offline users.
//!
//! The sender-supplied `from` field is forwarded as-is. Stamping it from the
//! authenticated connection is a hardening requirement for any deployment
//! where clients are not trusted.

use crate::presence::{ConnectionSink, PresenceRegistry};
use crate::ConnId;
use std::sync::Arc;
use telecare_rtc_core::signaling::{ClientMessage, ServerEvent};
use telecare_rtc_core::types::{CallAnswer, CallEnd, CallInvite, IceCandidateMsg};
use tracing::debug;

/// Signaling forwarder over a [`PresenceRegistry`]
pub struct SignalingRelay<C: ConnectionSink> {
    registry: Arc<PresenceRegistry<C>>,
}

impl<C: ConnectionSink> SignalingRelay<C> {
    /// Create a relay over `registry`
    #[must_use]
    pub fn new(registry: Arc<PresenceRegistry<C>>) -> Self {
        Self { registry }
    }

    /// The underlying registry
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry<C>> {
        &self.registry
    }

    /// Handle one inbound client message. This is the whole relay surface:
    /// joins land in the registry, everything else is forwarded.
    #[tracing::instrument(skip(self, sink, message), fields(%conn_id))]
    pub async fn handle(&self, conn_id: ConnId, sink: Arc<C>, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { identity } => {
                self.registry.join(conn_id, identity, sink);
            }
            ClientMessage::CallUser(invite) => self.relay_invite(invite).await,
            ClientMessage::AnswerCall(answer) => self.relay_answer(answer).await,
            ClientMessage::IceCandidate(candidate) => self.relay_ice(candidate).await,
            ClientMessage::EndCall(end) => self.relay_end(end).await,
        }
    }

    /// Forward a call invite to the callee
    pub async fn relay_invite(&self, invite: CallInvite) {
        let to = invite.to.clone();
        let delivered = self
            .registry
            .dispatch(&to, ServerEvent::IncomingCall(invite))
            .await;
        if delivered == 0 {
            debug!(%to, "invite target offline");
        }
    }

    /// Forward an answer to the caller
    pub async fn relay_answer(&self, answer: CallAnswer) {
        let to = answer.to.clone();
        let delivered = self
            .registry
            .dispatch(&to, ServerEvent::CallAccepted(answer))
            .await;
        if delivered == 0 {
            debug!(%to, "answer target offline");
        }
    }

    /// Forward a trickled ICE candidate
    pub async fn relay_ice(&self, candidate: IceCandidateMsg) {
        let to = candidate.to.clone();
        let delivered = self
            .registry
            .dispatch(&to, ServerEvent::IceCandidate(candidate))
            .await;
        if delivered == 0 {
            debug!(%to, "candidate target offline");
        }
    }

    /// Forward a call termination
    pub async fn relay_end(&self, end: CallEnd) {
        let to = end.to.clone();
        let delivered = self
            .registry
            .dispatch(&to, ServerEvent::CallEnded(end))
            .await;
        if delivered == 0 {
            debug!(%to, "end target offline");
        }
    }

    /// Drop a closed connection from the registry
    pub fn disconnect(&self, conn_id: ConnId) {
        self.registry.disconnect(conn_id);
    }
}

impl<C: ConnectionSink> std::fmt::Debug for SignalingRelay<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingRelay")
            .field("registry", &self.registry)
            .finish()
    }
}

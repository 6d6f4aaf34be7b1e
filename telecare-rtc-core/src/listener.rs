//! Inbound signaling dispatch
//!
//! The [`CallSessionListener`] is subscribed for the whole lifetime of the
//! client, whatever screen is showing. It is the single place inbound
//! [`ServerEvent`]s enter the call layer: invites create callee sessions
//! (or get an immediate busy reply), everything else is routed to the
//! session its call id names.

use crate::identity::Identity;
use crate::link::PeerLinkFactory;
use crate::manager::SessionManager;
use crate::media::MediaSource;
use crate::session::{CallSession, SessionConfig};
use crate::signaling::{ClientMessage, ServerEvent, SignalingSender};
use crate::types::{CallEnd, CallEvent, CallInvite, EndReason};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Always-active handler for relay-to-client events
pub struct CallSessionListener {
    local: Identity,
    manager: Arc<SessionManager>,
    signal: Arc<dyn SignalingSender>,
    media_source: Arc<dyn MediaSource>,
    links: Arc<dyn PeerLinkFactory>,
    config: SessionConfig,
}

impl CallSessionListener {
    /// Create a listener for `local`, registering callee sessions in
    /// `manager`
    pub fn new(
        local: Identity,
        manager: Arc<SessionManager>,
        signal: Arc<dyn SignalingSender>,
        media_source: Arc<dyn MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            local,
            manager,
            signal,
            media_source,
            links,
            config,
        }
    }

    /// Route one inbound server event
    #[tracing::instrument(skip(self, event), fields(local = %self.local))]
    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall(invite) => self.handle_invite(invite).await,
            ServerEvent::CallAccepted(answer) => {
                match self.manager.get(answer.call_id).await {
                    Some(session) => session.handle_answer(answer).await,
                    None => debug!(call_id = %answer.call_id, "answer for unknown call"),
                }
            }
            ServerEvent::IceCandidate(msg) => match self.manager.get(msg.call_id).await {
                Some(session) => session.handle_remote_candidate(msg.candidate).await,
                None => debug!(call_id = %msg.call_id, "candidate for unknown call"),
            },
            ServerEvent::CallEnded(end) => match self.manager.get(end.call_id).await {
                Some(session) => session.handle_remote_end(end).await,
                None => debug!(call_id = %end.call_id, "end for unknown call"),
            },
        }
    }

    /// Handle an invite: busy-reply if a call is already active, otherwise
    /// create the callee session and start ringing.
    async fn handle_invite(&self, invite: CallInvite) {
        if self.manager.active_session().await.is_some() {
            info!(call_id = %invite.call_id, from = %invite.from, "busy, rejecting invite");
            let reply = ClientMessage::EndCall(CallEnd {
                call_id: invite.call_id,
                from: self.local.clone(),
                to: invite.from.clone(),
                reason: EndReason::Busy,
            });
            if let Err(e) = self.signal.send(reply).await {
                warn!(error = %e, "busy reply not delivered");
            }
            let _ = self.manager.event_sender().send(CallEvent::BusyRejected {
                call_id: invite.call_id,
                from: invite.from,
            });
            return;
        }

        let call_id = invite.call_id;
        let from = invite.from.clone();
        let display_name = invite.display_name.clone();
        let session = CallSession::callee(
            self.local.clone(),
            invite,
            Arc::clone(&self.signal),
            Arc::clone(&self.media_source),
            Arc::clone(&self.links),
            self.config.clone(),
            self.manager.event_sender(),
        );
        self.manager.insert(Arc::clone(&session)).await;
        let _ = self.manager.event_sender().send(CallEvent::IncomingCall {
            call_id,
            from: from.clone(),
            display_name,
        });
        info!(%call_id, %from, "incoming call");

        if let Err(e) = session.ring().await {
            warn!(%call_id, error = %e, "callee session could not start ringing");
        }
    }
}

impl std::fmt::Debug for CallSessionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionListener")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

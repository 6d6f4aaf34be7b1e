//! Call session state machine
//!
//! A [`CallSession`] owns exactly one call: its media, its peer link and its
//! signaling traffic. It is pure state machine; everything user-visible goes
//! out as [`CallEvent`]s on a broadcast stream and user intent comes back in
//! as method calls ([`dial`](CallSession::dial), [`accept`](CallSession::accept),
//! [`decline`](CallSession::decline), [`hangup`](CallSession::hangup)).
//!
//! Teardown discipline: stop local media, close the link, best-effort
//! `endCall` at most once, discard buffered candidates. Every exit path runs
//! it, including failures, so capture devices are never left open.

use crate::identity::Identity;
use crate::link::{LinkConfig, LinkError, PeerLink, PeerLinkFactory};
use crate::media::{LocalMedia, MediaError, MediaSource};
use crate::signaling::{ClientMessage, SignalError, SignalingSender};
use crate::types::{
    CallAnswer, CallEnd, CallEvent, CallId, CallInvite, CallRole, CallState, EndReason,
    FailureReason, IceCandidate, IceCandidateMsg, MediaConstraints, MediaType,
    SessionDescription,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an unanswered invite may sit in `Offering` or `Ringing`
    pub invite_timeout: Duration,
    /// ICE configuration for the peer link
    pub link: LinkConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite_timeout: Duration::from_secs(45),
            link: LinkConfig::default(),
        }
    }
}

/// Session errors
///
/// These surface to the immediate caller of a session method; the session
/// itself has already transitioned to a terminal state where applicable, so
/// no caller needs to run recovery.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state: expected {expected}, was {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: &'static str,
        /// State the session was in
        actual: CallState,
    },

    /// The session reached a terminal failure
    #[error("session failed: {0}")]
    Failed(FailureReason),

    /// Media acquisition error
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer link error
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Signaling transport error
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Mutable session internals, behind one async lock
struct SessionShared {
    state: CallState,
    media: Option<LocalMedia>,
    link: Option<Arc<dyn PeerLink>>,
    /// Inbound candidates that arrived before the remote description
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// Remote offer held from the invite until `accept`
    pending_offer: Option<SessionDescription>,
    offer_sent: bool,
    answer_sent: bool,
    /// An `endCall` has been sent or received for this call
    end_exchanged: bool,
    candidate_pump: Option<JoinHandle<()>>,
}

/// One call, one state machine
pub struct CallSession {
    id: CallId,
    role: CallRole,
    local: Identity,
    remote: Identity,
    display_name: String,
    config: SessionConfig,
    signal: Arc<dyn SignalingSender>,
    media_source: Arc<dyn MediaSource>,
    links: Arc<dyn PeerLinkFactory>,
    shared: Mutex<SessionShared>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Create the caller-side session for a call to `remote`.
    ///
    /// `display_name` is the local user's name, carried on the invite.
    #[allow(clippy::too_many_arguments)]
    pub fn caller(
        local: Identity,
        remote: Identity,
        display_name: impl Into<String>,
        signal: Arc<dyn SignalingSender>,
        media_source: Arc<dyn MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
        config: SessionConfig,
        events: broadcast::Sender<CallEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: CallId::new(),
            role: CallRole::Caller,
            local,
            remote,
            display_name: display_name.into(),
            config,
            signal,
            media_source,
            links,
            shared: Mutex::new(SessionShared::new(None)),
            events,
        })
    }

    /// Create the callee-side session for a received `invite`.
    ///
    /// The offer is buffered and only applied on [`accept`](Self::accept).
    pub fn callee(
        local: Identity,
        invite: CallInvite,
        signal: Arc<dyn SignalingSender>,
        media_source: Arc<dyn MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
        config: SessionConfig,
        events: broadcast::Sender<CallEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: invite.call_id,
            role: CallRole::Callee,
            local,
            remote: invite.from,
            display_name: invite.display_name,
            config,
            signal,
            media_source,
            links,
            shared: Mutex::new(SessionShared::new(Some(invite.offer))),
            events,
        })
    }

    /// Call identifier
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Caller or callee
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Identity of the remote party
    #[must_use]
    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    /// Remote party's display name (callee side: the caller's name)
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Current state
    pub async fn state(&self) -> CallState {
        self.shared.lock().await.state.clone()
    }

    /// Start an outgoing call: acquire media, open the link, send the offer.
    ///
    /// On success the session is in `Offering` with the invite timeout armed.
    /// On failure it is terminal `Failed` and the error reports the reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not `Idle` or any setup step fails.
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn dial(self: &Arc<Self>) -> Result<(), SessionError> {
        self.require_state(CallState::Idle, "Idle").await?;
        self.prepare_media_and_link().await?;

        let offer = {
            let shared = self.shared.lock().await;
            if shared.offer_sent {
                return Err(SessionError::InvalidState {
                    expected: "no offer sent",
                    actual: shared.state.clone(),
                });
            }
            let link = shared.link.clone().ok_or(LinkError::Closed)?;
            drop(shared);
            let offer = match link.create_offer().await {
                Ok(offer) => offer,
                Err(e) => {
                    warn!(error = %e, "offer creation failed");
                    self.fail(FailureReason::NegotiationError).await;
                    return Err(SessionError::Failed(FailureReason::NegotiationError));
                }
            };
            let mut shared = self.shared.lock().await;
            shared.offer_sent = true;
            offer
        };

        let invite = ClientMessage::CallUser(CallInvite {
            call_id: self.id,
            from: self.local.clone(),
            to: self.remote.clone(),
            offer,
            display_name: self.display_name.clone(),
            timestamp: Utc::now(),
        });
        if let Err(e) = self.signal.send(invite).await {
            warn!(error = %e, "invite could not reach the relay");
            self.fail(FailureReason::RelayUnreachable).await;
            return Err(SessionError::Failed(FailureReason::RelayUnreachable));
        }

        {
            let mut shared = self.shared.lock().await;
            // A hangup may have landed while the invite was in flight.
            if shared.state != CallState::AcquiringMedia {
                debug!(state = ?shared.state, "call ended while the invite was in flight");
                return Ok(());
            }
            self.set_state(&mut shared, CallState::Offering);
        }
        self.arm_invite_timeout();
        info!(to = %self.remote, "invite sent");
        Ok(())
    }

    /// Start ringing for a received invite: acquire media and open the link
    /// so an [`accept`](Self::accept) is immediate.
    ///
    /// The buffered remote offer is not applied here, so a decline never
    /// exposes a local media failure to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not a fresh callee session or
    /// setup fails.
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn ring(self: &Arc<Self>) -> Result<(), SessionError> {
        self.require_state(CallState::Idle, "Idle").await?;
        self.prepare_media_and_link().await?;

        {
            let mut shared = self.shared.lock().await;
            if shared.state != CallState::AcquiringMedia {
                debug!(state = ?shared.state, "call ended during setup");
                return Ok(());
            }
            self.set_state(&mut shared, CallState::Ringing);
        }
        self.arm_invite_timeout();
        info!(from = %self.remote, "ringing");
        Ok(())
    }

    /// Accept a ringing call: apply the buffered offer, flush buffered
    /// candidates in arrival order, send the answer.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not `Ringing` or negotiation fails.
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn accept(self: &Arc<Self>) -> Result<(), SessionError> {
        let (link, offer) = {
            let mut shared = self.shared.lock().await;
            if shared.state != CallState::Ringing {
                return Err(SessionError::InvalidState {
                    expected: "Ringing",
                    actual: shared.state.clone(),
                });
            }
            self.set_state(&mut shared, CallState::Answering);
            let link = shared.link.clone().ok_or(LinkError::Closed)?;
            let offer = shared.pending_offer.take().ok_or(SessionError::InvalidState {
                expected: "buffered offer",
                actual: shared.state.clone(),
            })?;
            (link, offer)
        };

        if let Err(e) = link.set_remote_description(offer).await {
            warn!(error = %e, "offer could not be applied");
            self.fail(FailureReason::NegotiationError).await;
            return Err(SessionError::Failed(FailureReason::NegotiationError));
        }
        self.mark_remote_description_set_and_flush(&link).await;

        let answer = {
            let shared = self.shared.lock().await;
            if shared.answer_sent {
                return Err(SessionError::InvalidState {
                    expected: "no answer sent",
                    actual: shared.state.clone(),
                });
            }
            drop(shared);
            let answer = match link.create_answer().await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(error = %e, "answer creation failed");
                    self.fail(FailureReason::NegotiationError).await;
                    return Err(SessionError::Failed(FailureReason::NegotiationError));
                }
            };
            let mut shared = self.shared.lock().await;
            shared.answer_sent = true;
            answer
        };

        let message = ClientMessage::AnswerCall(CallAnswer {
            call_id: self.id,
            from: self.local.clone(),
            to: self.remote.clone(),
            answer,
            timestamp: Utc::now(),
        });
        if let Err(e) = self.signal.send(message).await {
            warn!(error = %e, "answer could not reach the relay");
            self.fail(FailureReason::RelayUnreachable).await;
            return Err(SessionError::Failed(FailureReason::RelayUnreachable));
        }

        let mut shared = self.shared.lock().await;
        // A hangup may have landed while the answer was in flight.
        if shared.state != CallState::Answering {
            debug!(state = ?shared.state, "call ended while the answer was in flight");
            return Ok(());
        }
        self.set_state(&mut shared, CallState::Connected);
        info!(from = %self.remote, "call accepted");
        Ok(())
    }

    /// Decline a ringing call: notify the caller, release everything.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not `Ringing`.
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn decline(&self) -> Result<(), SessionError> {
        let pending_end = {
            let mut shared = self.shared.lock().await;
            if shared.state != CallState::Ringing {
                return Err(SessionError::InvalidState {
                    expected: "Ringing",
                    actual: shared.state.clone(),
                });
            }
            self.set_state(&mut shared, CallState::Ending);
            let pending_end = self.teardown(&mut shared, EndReason::Declined).await;
            self.set_state(&mut shared, CallState::Ended);
            pending_end
        };
        self.send_end(pending_end).await;
        info!(from = %self.remote, "call declined");
        Ok(())
    }

    /// Hang up. Idempotent and valid in every state; repeat calls after the
    /// first are no-ops.
    #[tracing::instrument(skip(self), fields(call_id = %self.id))]
    pub async fn hangup(&self) {
        let pending_end = {
            let mut shared = self.shared.lock().await;
            if shared.state.is_terminal() || shared.state == CallState::Ending {
                debug!(state = ?shared.state, "hangup ignored");
                return;
            }
            self.set_state(&mut shared, CallState::Ending);
            let pending_end = self.teardown(&mut shared, EndReason::Hangup).await;
            self.set_state(&mut shared, CallState::Ended);
            pending_end
        };
        self.send_end(pending_end).await;
        info!("call ended locally");
    }

    /// Apply the remote answer (caller side).
    ///
    /// A late answer landing after the session went terminal is ignored.
    #[tracing::instrument(skip(self, answer), fields(call_id = %self.id))]
    pub async fn handle_answer(self: &Arc<Self>, answer: CallAnswer) {
        let link = {
            let shared = self.shared.lock().await;
            if shared.state != CallState::Offering {
                debug!(state = ?shared.state, "answer ignored");
                return;
            }
            match shared.link.clone() {
                Some(link) => link,
                None => return,
            }
        };

        if let Err(e) = link.set_remote_description(answer.answer).await {
            warn!(error = %e, "answer could not be applied");
            self.fail(FailureReason::NegotiationError).await;
            return;
        }
        self.mark_remote_description_set_and_flush(&link).await;

        let mut shared = self.shared.lock().await;
        if shared.state != CallState::Offering {
            return;
        }
        self.set_state(&mut shared, CallState::Connected);
        info!(from = %self.remote, "call accepted by remote");
    }

    /// Take in a trickled remote candidate.
    ///
    /// Applied immediately once the remote description is set, otherwise
    /// buffered FIFO. Application errors are logged and tolerated.
    pub async fn handle_remote_candidate(&self, candidate: IceCandidate) {
        let link = {
            let mut shared = self.shared.lock().await;
            if shared.state.is_terminal() {
                debug!("candidate for finished call ignored");
                return;
            }
            if !shared.remote_description_set {
                shared.pending_candidates.push_back(candidate);
                debug!(
                    buffered = shared.pending_candidates.len(),
                    "candidate buffered until remote description"
                );
                return;
            }
            match shared.link.clone() {
                Some(link) => link,
                None => return,
            }
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            warn!(error = %e, "remote candidate rejected");
        }
    }

    /// Handle the remote party ending the call.
    ///
    /// A busy reply to our own invite becomes `Failed(Busy)`; everything else
    /// is a normal remote hangup or decline and lands in `Ended`.
    #[tracing::instrument(skip(self, end), fields(call_id = %self.id, reason = ?end.reason))]
    pub async fn handle_remote_end(&self, end: CallEnd) {
        let busy_reply = end.reason == EndReason::Busy && self.role == CallRole::Caller;
        let mut shared = self.shared.lock().await;
        if shared.state.is_terminal() {
            debug!("remote end for finished call ignored");
            return;
        }
        shared.end_exchanged = true;
        self.set_state(&mut shared, CallState::Ending);
        let _ = self.teardown(&mut shared, EndReason::Hangup).await;
        if busy_reply {
            self.set_state(&mut shared, CallState::Failed(FailureReason::Busy));
        } else {
            self.set_state(&mut shared, CallState::Ended);
        }
        info!(from = %self.remote, "call ended by remote");
    }

    /// Force the session into terminal `Failed(reason)`, releasing all
    /// resources. No-op if already terminal.
    pub async fn fail(&self, reason: FailureReason) {
        let pending_end = {
            let mut shared = self.shared.lock().await;
            if shared.state.is_terminal() {
                return;
            }
            let pending_end = self.teardown(&mut shared, EndReason::Hangup).await;
            self.set_state(&mut shared, CallState::Failed(reason));
            pending_end
        };
        self.send_end(pending_end).await;
        warn!(call_id = %self.id, %reason, "call failed");
    }

    /// Acquire media (with audio-only fallback), open the peer link, attach
    /// tracks and start the outbound candidate pump.
    async fn prepare_media_and_link(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut shared = self.shared.lock().await;
            self.set_state(&mut shared, CallState::AcquiringMedia);
        }

        let (media, audio_only) = match self.acquire_with_fallback().await {
            Ok(pair) => pair,
            Err(reason) => {
                self.fail(reason).await;
                return Err(SessionError::Failed(reason));
            }
        };
        // Acquisition can suspend on the user's permission prompt; a hangup
        // landing meanwhile already ran teardown, so the late handle must be
        // released here instead of stored.
        {
            let shared = self.shared.lock().await;
            if shared.state != CallState::AcquiringMedia {
                let actual = shared.state.clone();
                drop(shared);
                media.stop();
                debug!(state = ?actual, "call ended during media acquisition, releasing");
                return Err(SessionError::InvalidState {
                    expected: "AcquiringMedia",
                    actual,
                });
            }
        }
        if audio_only {
            let _ = self.events.send(CallEvent::AudioOnlyFallback { call_id: self.id });
            info!(call_id = %self.id, "camera unavailable, continuing audio-only");
        }

        let link = match self.links.open(&self.config.link).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "peer link could not be opened");
                media.stop();
                self.fail(FailureReason::NegotiationError).await;
                return Err(SessionError::Failed(FailureReason::NegotiationError));
            }
        };
        if let Err(e) = link.add_media(&media).await {
            warn!(error = %e, "tracks could not be attached");
            media.stop();
            let _ = link.close().await;
            self.fail(FailureReason::NegotiationError).await;
            return Err(SessionError::Failed(FailureReason::NegotiationError));
        }

        let pump = self.spawn_candidate_pump(&link);
        let mut shared = self.shared.lock().await;
        if shared.state != CallState::AcquiringMedia {
            let actual = shared.state.clone();
            drop(shared);
            media.stop();
            if let Some(pump) = pump {
                pump.abort();
            }
            if let Err(e) = link.close().await {
                debug!(error = %e, "link close reported an error");
            }
            debug!(state = ?actual, "call ended during link setup, releasing");
            return Err(SessionError::InvalidState {
                expected: "AcquiringMedia",
                actual,
            });
        }
        shared.media = Some(media);
        shared.link = Some(link);
        shared.candidate_pump = pump;
        Ok(())
    }

    /// Audio+video first; a missing camera degrades to audio-only.
    async fn acquire_with_fallback(&self) -> Result<(LocalMedia, bool), FailureReason> {
        match self.media_source.acquire(MediaConstraints::video_call()).await {
            Ok(media) => Ok((media, false)),
            Err(MediaError::DeviceNotFound(MediaType::Video)) => {
                match self.media_source.acquire(MediaConstraints::audio_only()).await {
                    Ok(media) => Ok((media, true)),
                    Err(MediaError::PermissionDenied) => Err(FailureReason::PermissionDenied),
                    Err(_) => Err(FailureReason::NoDevice),
                }
            }
            Err(MediaError::PermissionDenied) => Err(FailureReason::PermissionDenied),
            Err(_) => Err(FailureReason::NoDevice),
        }
    }

    /// Relay every locally gathered candidate for as long as the link lives.
    fn spawn_candidate_pump(self: &Arc<Self>, link: &Arc<dyn PeerLink>) -> Option<JoinHandle<()>> {
        let mut rx = link.take_local_candidates()?;
        let signal = Arc::clone(&self.signal);
        let call_id = self.id;
        let from = self.local.clone();
        let to = self.remote.clone();
        Some(tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                let message = ClientMessage::IceCandidate(IceCandidateMsg {
                    call_id,
                    from: from.clone(),
                    to: to.clone(),
                    candidate,
                });
                if let Err(e) = signal.send(message).await {
                    warn!(%call_id, error = %e, "local candidate not relayed");
                }
            }
        }))
    }

    /// Arm the invite timeout. The timer task is never aborted; when it
    /// fires it re-checks the state and no-ops unless the session is still
    /// waiting in `Offering` or `Ringing`.
    fn arm_invite_timeout(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let wait = self.config.invite_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let waiting = {
                let shared = session.shared.lock().await;
                matches!(shared.state, CallState::Offering | CallState::Ringing)
            };
            if waiting {
                info!(call_id = %session.id, "invite timed out");
                session.fail(FailureReason::Timeout).await;
            }
        });
    }

    /// Mark the remote description applied and flush buffered candidates in
    /// arrival order.
    async fn mark_remote_description_set_and_flush(&self, link: &Arc<dyn PeerLink>) {
        let buffered = {
            let mut shared = self.shared.lock().await;
            shared.remote_description_set = true;
            std::mem::take(&mut shared.pending_candidates)
        };
        for candidate in buffered {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!(error = %e, "buffered candidate rejected");
            }
        }
    }

    /// Release everything this session holds. Runs at most once per session
    /// in practice since every caller checks for terminal states first.
    ///
    /// Returns the `endCall` still owed to the remote side, if any; the
    /// caller sends it once the session lock is released so a slow transport
    /// never stalls state queries.
    async fn teardown(&self, shared: &mut SessionShared, reason: EndReason) -> Option<ClientMessage> {
        if let Some(media) = shared.media.take() {
            media.stop();
        }
        if let Some(link) = shared.link.take() {
            if let Err(e) = link.close().await {
                debug!(error = %e, "link close reported an error");
            }
        }
        shared.pending_candidates.clear();
        shared.pending_offer = None;
        if let Some(pump) = shared.candidate_pump.take() {
            pump.abort();
        }
        if shared.end_exchanged {
            return None;
        }
        shared.end_exchanged = true;
        Some(ClientMessage::EndCall(CallEnd {
            call_id: self.id,
            from: self.local.clone(),
            to: self.remote.clone(),
            reason,
        }))
    }

    /// Best-effort delivery of the `endCall` produced by [`teardown`](Self::teardown)
    async fn send_end(&self, message: Option<ClientMessage>) {
        let Some(message) = message else {
            return;
        };
        if let Err(e) = self.signal.send(message).await {
            debug!(error = %e, "endCall not delivered");
        }
    }

    async fn require_state(
        &self,
        expected: CallState,
        name: &'static str,
    ) -> Result<(), SessionError> {
        let shared = self.shared.lock().await;
        if shared.state != expected {
            return Err(SessionError::InvalidState {
                expected: name,
                actual: shared.state.clone(),
            });
        }
        Ok(())
    }

    fn set_state(&self, shared: &mut SessionShared, state: CallState) {
        debug!(call_id = %self.id, from = ?shared.state, to = ?state, "state change");
        shared.state = state.clone();
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: self.id,
            state,
        });
    }
}

impl SessionShared {
    fn new(pending_offer: Option<SessionDescription>) -> Self {
        Self {
            state: CallState::Idle,
            media: None,
            link: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            pending_offer,
            offer_sent: false,
            answer_sent: false,
            end_exchanged: false,
            candidate_pump: None,
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

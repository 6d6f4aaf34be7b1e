//! Call session state machine tests
//!
//! Exercises both call roles against in-memory media, link and signaling
//! fakes: negotiation ordering, candidate buffering, teardown idempotence
//! and resource release on every exit path.

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telecare_rtc_core::testkit::{host_candidate, init_tracing, MockLinkFactory, MockSignaling};
use telecare_rtc_core::{
    CallAnswer, CallEnd, CallEvent, CallInvite, CallSession, CallState, ClientMessage, EndReason,
    FailureReason, Identity, LocalMedia, MediaConstraints, MediaError, MediaSource, Role,
    SessionConfig, SessionDescription, SessionManager, SessionError, SignalError,
    SignalingSender, StaticMediaSource,
};
use tokio::sync::Semaphore;

fn patient() -> Identity {
    Identity::new(Role::Patient, "maria")
}

fn doctor() -> Identity {
    Identity::new(Role::Doctor, "42")
}

struct Harness {
    signal: Arc<MockSignaling>,
    media: Arc<StaticMediaSource>,
    links: Arc<MockLinkFactory>,
    manager: Arc<SessionManager>,
}

impl Harness {
    fn new() -> Self {
        Self::with_media(StaticMediaSource::full())
    }

    fn with_media(media: StaticMediaSource) -> Self {
        init_tracing();
        Self {
            signal: MockSignaling::new(),
            media: Arc::new(media),
            links: MockLinkFactory::new(),
            manager: Arc::new(SessionManager::new()),
        }
    }

    fn caller(&self) -> Arc<CallSession> {
        CallSession::caller(
            patient(),
            doctor(),
            "Maria",
            self.signal.clone(),
            self.media.clone(),
            self.links.clone(),
            SessionConfig::default(),
            self.manager.event_sender(),
        )
    }

    fn callee(&self, invite: CallInvite) -> Arc<CallSession> {
        CallSession::callee(
            doctor(),
            invite,
            self.signal.clone(),
            self.media.clone(),
            self.links.clone(),
            SessionConfig::default(),
            self.manager.event_sender(),
        )
    }

    fn media_released(&self) -> bool {
        let probes = self.media.issued_probes();
        !probes.is_empty() && probes.iter().all(|p| p.is_released())
    }
}

/// Sender that parks invites and answers on a gate, so a test can interleave
/// other session calls while the message is still in flight
struct StallingSignaling {
    inner: Arc<MockSignaling>,
    gate: Semaphore,
    held: AtomicUsize,
}

impl StallingSignaling {
    fn new(inner: Arc<MockSignaling>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
            held: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingSender for StallingSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalError> {
        if matches!(
            message,
            ClientMessage::CallUser(_) | ClientMessage::AnswerCall(_)
        ) {
            self.held.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
        }
        self.inner.send(message).await
    }
}

/// Media source that parks acquisition on a gate, standing in for a user
/// staring at the permission prompt
struct GatedMediaSource {
    inner: StaticMediaSource,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GatedMediaSource {
    fn new(inner: StaticMediaSource) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn inner(&self) -> &StaticMediaSource {
        &self.inner
    }
}

#[async_trait]
impl MediaSource for GatedMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
        self.inner.acquire(constraints).await
    }
}

fn invite() -> CallInvite {
    CallInvite {
        call_id: telecare_rtc_core::CallId::new(),
        from: patient(),
        to: doctor(),
        offer: SessionDescription::offer("remote-offer"),
        display_name: "Maria".to_string(),
        timestamp: Utc::now(),
    }
}

fn answer_for(session: &CallSession) -> CallAnswer {
    CallAnswer {
        call_id: session.id(),
        from: doctor(),
        to: patient(),
        answer: SessionDescription::answer("remote-answer"),
        timestamp: Utc::now(),
    }
}

fn remote_end(session: &CallSession, reason: EndReason) -> CallEnd {
    CallEnd {
        call_id: session.id(),
        from: doctor(),
        to: patient(),
        reason,
    }
}

#[tokio::test]
async fn dial_sends_one_invite_and_reaches_offering() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();

    assert_eq!(session.state().await, CallState::Offering);
    let link = h.links.last_link().unwrap();
    assert_eq!(link.offers_created(), 1);

    let sent = h.signal.sent();
    let invites: Vec<_> = sent
        .iter()
        .filter(|m| matches!(m, ClientMessage::CallUser(_)))
        .collect();
    assert_eq!(invites.len(), 1);
    let ClientMessage::CallUser(invite) = invites[0] else {
        unreachable!()
    };
    assert_eq!(invite.call_id, session.id());
    assert_eq!(invite.from, patient());
    assert_eq!(invite.to, doctor());
    assert_eq!(invite.display_name, "Maria");
}

#[tokio::test]
async fn remote_answer_connects_the_caller() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();

    session.handle_answer(answer_for(&session)).await;

    assert_eq!(session.state().await, CallState::Connected);
    let link = h.links.last_link().unwrap();
    assert_eq!(
        link.remote_descriptions(),
        vec![SessionDescription::answer("remote-answer")]
    );
}

#[tokio::test]
async fn dial_requires_idle() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    assert!(matches!(
        session.dial().await,
        Err(SessionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn hangup_many_times_equals_hangup_once() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    session.handle_answer(answer_for(&session)).await;

    session.hangup().await;
    session.hangup().await;
    session.hangup().await;

    assert_eq!(session.state().await, CallState::Ended);
    assert_eq!(h.signal.end_calls().len(), 1);
    assert_eq!(h.links.last_link().unwrap().close_calls(), 1);
    assert!(h.media_released());
}

#[tokio::test]
async fn hangup_is_valid_before_any_negotiation() {
    let h = Harness::new();
    let session = h.caller();
    session.hangup().await;
    assert_eq!(session.state().await, CallState::Ended);
    // Nothing was set up, so the only traffic is the endCall itself.
    assert_eq!(h.signal.end_calls().len(), 1);
}

#[tokio::test]
async fn early_candidates_buffered_and_flushed_in_arrival_order() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    let link = h.links.last_link().unwrap();

    session.handle_remote_candidate(host_candidate(1)).await;
    session.handle_remote_candidate(host_candidate(2)).await;
    assert!(link.applied_candidates().is_empty());

    session.handle_answer(answer_for(&session)).await;
    assert_eq!(
        link.applied_candidates(),
        vec![host_candidate(1), host_candidate(2)]
    );

    // Once the remote description is set, candidates apply immediately.
    session.handle_remote_candidate(host_candidate(3)).await;
    assert_eq!(
        link.applied_candidates(),
        vec![host_candidate(1), host_candidate(2), host_candidate(3)]
    );
}

#[tokio::test]
async fn duplicate_candidates_are_tolerated() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    session.handle_answer(answer_for(&session)).await;

    session.handle_remote_candidate(host_candidate(1)).await;
    session.handle_remote_candidate(host_candidate(1)).await;

    assert_eq!(session.state().await, CallState::Connected);
    assert_eq!(h.links.last_link().unwrap().applied_candidates().len(), 2);
}

#[tokio::test]
async fn local_candidates_are_relayed_while_the_link_lives() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    let link = h.links.last_link().unwrap();

    link.emit_local_candidate(host_candidate(7)).await;
    // Give the pump task a chance to forward it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let relayed: Vec<_> = h
        .signal
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::IceCandidate(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].call_id, session.id());
    assert_eq!(relayed[0].candidate, host_candidate(7));
}

#[tokio::test]
async fn unreachable_relay_fails_the_dial_and_releases_media() {
    let h = Harness::new();
    h.signal.set_failing(true);
    let session = h.caller();

    let err = session.dial().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Failed(FailureReason::RelayUnreachable)
    ));
    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::RelayUnreachable)
    );
    assert!(h.media_released());
    assert_eq!(h.links.last_link().unwrap().close_calls(), 1);
}

#[tokio::test]
async fn permission_denied_fails_without_fallback() {
    let h = Harness::new();
    h.media.deny_permission();
    let session = h.caller();

    let err = session.dial().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Failed(FailureReason::PermissionDenied)
    ));
    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::PermissionDenied)
    );
}

#[tokio::test]
async fn missing_camera_falls_back_to_audio_only() {
    let h = Harness::with_media(StaticMediaSource::audio_only());
    let mut events = h.manager.subscribe();
    let session = h.caller();

    session.dial().await.unwrap();
    session.handle_answer(answer_for(&session)).await;
    assert_eq!(session.state().await, CallState::Connected);

    let link = h.links.last_link().unwrap();
    let tracks = link.attached_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].kind, telecare_rtc_core::MediaType::Audio);

    let mut saw_fallback = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CallEvent::AudioOnlyFallback { call_id } if call_id == session.id()) {
            saw_fallback = true;
        }
    }
    assert!(saw_fallback);
}

#[tokio::test]
async fn no_microphone_at_all_is_no_device() {
    let h = Harness::with_media(StaticMediaSource::with_devices(false, false));
    let session = h.caller();

    let err = session.dial().await.unwrap_err();
    assert!(matches!(err, SessionError::Failed(FailureReason::NoDevice)));
    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::NoDevice)
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_times_out() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    assert_eq!(session.state().await, CallState::Offering);

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::Timeout)
    );
    assert!(h.media_released());
}

#[tokio::test(start_paused = true)]
async fn answer_before_the_timeout_disarms_it() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    session.handle_answer(answer_for(&session)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(session.state().await, CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn late_answer_after_timeout_is_ignored() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();

    tokio::time::sleep(Duration::from_secs(46)).await;
    session.handle_answer(answer_for(&session)).await;

    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn unaccepted_ring_times_out() {
    let h = Harness::new();
    let session = h.callee(invite());
    session.ring().await.unwrap();
    assert_eq!(session.state().await, CallState::Ringing);

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::Timeout)
    );
    assert!(h.media_released());
}

#[tokio::test]
async fn callee_buffers_the_offer_until_accept() {
    let h = Harness::new();
    let session = h.callee(invite());
    session.ring().await.unwrap();

    let link = h.links.last_link().unwrap();
    assert_eq!(session.state().await, CallState::Ringing);
    assert!(link.remote_descriptions().is_empty());

    session.accept().await.unwrap();

    assert_eq!(session.state().await, CallState::Connected);
    assert_eq!(
        link.remote_descriptions(),
        vec![SessionDescription::offer("remote-offer")]
    );
    assert_eq!(link.answers_created(), 1);
    let answers: Vec<_> = h
        .signal
        .sent()
        .into_iter()
        .filter(|m| matches!(m, ClientMessage::AnswerCall(_)))
        .collect();
    assert_eq!(answers.len(), 1);
}

#[tokio::test]
async fn candidates_arriving_while_ringing_flush_on_accept() {
    let h = Harness::new();
    let session = h.callee(invite());
    session.ring().await.unwrap();

    session.handle_remote_candidate(host_candidate(1)).await;
    session.handle_remote_candidate(host_candidate(2)).await;
    let link = h.links.last_link().unwrap();
    assert!(link.applied_candidates().is_empty());

    session.accept().await.unwrap();
    assert_eq!(
        link.applied_candidates(),
        vec![host_candidate(1), host_candidate(2)]
    );
}

#[tokio::test]
async fn decline_notifies_the_caller_and_releases_everything() {
    let h = Harness::new();
    let session = h.callee(invite());
    session.ring().await.unwrap();

    session.decline().await.unwrap();

    assert_eq!(session.state().await, CallState::Ended);
    assert!(h.media_released());
    let ends = h.signal.end_calls();
    assert_eq!(ends.len(), 1);
    let ClientMessage::EndCall(end) = &ends[0] else {
        unreachable!()
    };
    assert_eq!(end.reason, EndReason::Declined);
    assert_eq!(end.to, patient());
    // The offer was never applied, so the caller saw only the decline.
    assert!(h.links.last_link().unwrap().remote_descriptions().is_empty());
}

#[tokio::test]
async fn accept_requires_ringing() {
    let h = Harness::new();
    let session = h.callee(invite());
    assert!(matches!(
        session.accept().await,
        Err(SessionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn busy_reply_fails_the_caller_without_echoing_an_end() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();

    session
        .handle_remote_end(remote_end(&session, EndReason::Busy))
        .await;

    assert_eq!(session.state().await, CallState::Failed(FailureReason::Busy));
    assert!(h.media_released());
    assert!(h.signal.end_calls().is_empty());
}

#[tokio::test]
async fn remote_hangup_ends_the_call_without_echoing_an_end() {
    let h = Harness::new();
    let session = h.caller();
    session.dial().await.unwrap();
    session.handle_answer(answer_for(&session)).await;

    session
        .handle_remote_end(remote_end(&session, EndReason::Hangup))
        .await;

    assert_eq!(session.state().await, CallState::Ended);
    assert!(h.media_released());
    assert!(h.signal.end_calls().is_empty());
    assert_eq!(h.links.last_link().unwrap().close_calls(), 1);
}

#[tokio::test]
async fn negotiation_failure_is_terminal_and_releases_media() {
    let h = Harness::new();
    let session = h.callee(invite());
    session.ring().await.unwrap();
    h.links.last_link().unwrap().set_fail_negotiation(true);

    let err = session.accept().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Failed(FailureReason::NegotiationError)
    ));
    assert_eq!(
        session.state().await,
        CallState::Failed(FailureReason::NegotiationError)
    );
    assert!(h.media_released());
}

#[tokio::test]
async fn manager_tracks_active_sessions_and_reaps_terminal_ones() {
    let h = Harness::new();
    let session = h.caller();
    h.manager.insert(Arc::clone(&session)).await;

    assert!(h.manager.active_session().await.is_none());
    session.dial().await.unwrap();
    assert_eq!(
        h.manager.active_session().await.unwrap().id(),
        session.id()
    );

    session.hangup().await;
    assert!(h.manager.active_session().await.is_none());
    assert_eq!(h.manager.reap_terminal().await, 1);
    assert!(h.manager.is_empty().await);
}

#[tokio::test]
async fn state_changes_are_broadcast() {
    let h = Harness::new();
    let mut events = h.manager.subscribe();
    let session = h.caller();
    session.dial().await.unwrap();
    session.handle_answer(answer_for(&session)).await;

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CallEvent::StateChanged { call_id, state } = event {
            assert_eq!(call_id, session.id());
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            CallState::AcquiringMedia,
            CallState::Offering,
            CallState::Connected
        ]
    );
}

#[tokio::test]
async fn hangup_while_the_invite_is_in_flight_stays_ended() {
    let h = Harness::new();
    let stall = StallingSignaling::new(h.signal.clone());
    let session = CallSession::caller(
        patient(),
        doctor(),
        "Maria",
        stall.clone(),
        h.media.clone(),
        h.links.clone(),
        SessionConfig::default(),
        h.manager.event_sender(),
    );

    let dialing = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.dial().await }
    });
    while stall.held() == 0 {
        tokio::task::yield_now().await;
    }

    session.hangup().await;
    assert_eq!(session.state().await, CallState::Ended);

    stall.release();
    dialing.await.unwrap().unwrap();

    // The invite that was still in flight must not revive the ended call.
    assert_eq!(session.state().await, CallState::Ended);
    assert_eq!(h.signal.end_calls().len(), 1);
    assert!(h.media_released());
    assert_eq!(h.links.last_link().unwrap().close_calls(), 1);
}

#[tokio::test]
async fn hangup_while_the_answer_is_in_flight_stays_ended() {
    let h = Harness::new();
    let stall = StallingSignaling::new(h.signal.clone());
    let session = CallSession::callee(
        doctor(),
        invite(),
        stall.clone(),
        h.media.clone(),
        h.links.clone(),
        SessionConfig::default(),
        h.manager.event_sender(),
    );
    session.ring().await.unwrap();

    let accepting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.accept().await }
    });
    while stall.held() == 0 {
        tokio::task::yield_now().await;
    }

    session.hangup().await;
    assert_eq!(session.state().await, CallState::Ended);

    stall.release();
    accepting.await.unwrap().unwrap();

    // The answer that was still in flight must not flip the call back to
    // Connected.
    assert_eq!(session.state().await, CallState::Ended);
    assert_eq!(h.signal.end_calls().len(), 1);
    assert!(h.media_released());
}

#[tokio::test]
async fn hangup_during_media_acquisition_releases_the_late_bundle() {
    init_tracing();
    let media = GatedMediaSource::new(StaticMediaSource::full());
    let signal = MockSignaling::new();
    let links = MockLinkFactory::new();
    let manager = Arc::new(SessionManager::new());
    let session = CallSession::caller(
        patient(),
        doctor(),
        "Maria",
        signal.clone(),
        media.clone(),
        links.clone(),
        SessionConfig::default(),
        manager.event_sender(),
    );

    let dialing = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.dial().await }
    });
    while media.waiting() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(session.state().await, CallState::AcquiringMedia);

    session.hangup().await;
    assert_eq!(session.state().await, CallState::Ended);

    media.release();
    let err = dialing.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));

    // The bundle granted after the hangup is released, not stored, and no
    // link is ever opened for the dead call.
    assert_eq!(session.state().await, CallState::Ended);
    let probes = media.inner().issued_probes();
    assert_eq!(probes.len(), 1);
    assert!(probes[0].is_released());
    assert!(links.links().is_empty());
    assert_eq!(signal.end_calls().len(), 1);
}

//! In-memory fakes for exercising the call layer without devices or network
//!
//! Available to integration tests (and downstream crates' tests) through the
//! `test-utils` feature.

use crate::link::{LinkConfig, LinkError, PeerLink, PeerLinkFactory};
use crate::media::{LocalMedia, LocalTrack};
use crate::signaling::{ClientMessage, SignalError, SignalingSender};
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Install a test subscriber printing spans and events. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Signaling sender that records every message in order
#[derive(Debug, Default)]
pub struct MockSignaling {
    sent: parking_lot::Mutex<Vec<ClientMessage>>,
    failing: AtomicBool,
}

impl MockSignaling {
    /// A sender that accepts everything
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything sent so far, in order
    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// The `endCall` messages sent so far
    #[must_use]
    pub fn end_calls(&self) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m, ClientMessage::EndCall(_)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalingSender for MockSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SignalError::Transport("mock transport down".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Peer link that records negotiation steps instead of connecting
#[derive(Debug)]
pub struct MockLink {
    remote_descriptions: parking_lot::Mutex<Vec<SessionDescription>>,
    applied_candidates: parking_lot::Mutex<Vec<IceCandidate>>,
    attached_tracks: parking_lot::Mutex<Vec<LocalTrack>>,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    close_calls: AtomicUsize,
    fail_negotiation: AtomicBool,
    local_tx: parking_lot::Mutex<Option<mpsc::Sender<IceCandidate>>>,
    local_rx: parking_lot::Mutex<Option<mpsc::Receiver<IceCandidate>>>,
}

impl MockLink {
    /// A fresh link with an open local-candidate channel
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            remote_descriptions: parking_lot::Mutex::new(Vec::new()),
            applied_candidates: parking_lot::Mutex::new(Vec::new()),
            attached_tracks: parking_lot::Mutex::new(Vec::new()),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_negotiation: AtomicBool::new(false),
            local_tx: parking_lot::Mutex::new(Some(tx)),
            local_rx: parking_lot::Mutex::new(Some(rx)),
        })
    }

    /// Make negotiation calls fail from now on
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Pretend the ICE agent gathered a local candidate
    pub async fn emit_local_candidate(&self, candidate: IceCandidate) {
        let tx = self.local_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(candidate).await;
        }
    }

    /// Remote descriptions applied, in order
    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    /// Remote candidates applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    /// Tracks attached via `add_media`
    #[must_use]
    pub fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.attached_tracks.lock().clone()
    }

    /// How many offers have been created
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    /// How many answers have been created
    #[must_use]
    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    /// How many times `close` has been called
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn check_negotiation(&self) -> Result<(), LinkError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(LinkError::Negotiation("mock negotiation failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn add_media(&self, media: &LocalMedia) -> Result<(), LinkError> {
        self.check_negotiation()?;
        self.attached_tracks.lock().extend_from_slice(media.tracks());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.check_negotiation()?;
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("mock-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.check_negotiation()?;
        if self.remote_descriptions.lock().is_empty() {
            return Err(LinkError::Negotiation(
                "answer requested before remote offer".to_string(),
            ));
        }
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("mock-answer-{n}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.check_negotiation()?;
        self.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.check_negotiation()?;
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<IceCandidate>> {
        self.local_rx.lock().take()
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        // Ends the candidate stream for anyone still pumping it.
        self.local_tx.lock().take();
        Ok(())
    }
}

/// Factory handing out [`MockLink`]s and remembering them for inspection
#[derive(Debug, Default)]
pub struct MockLinkFactory {
    links: parking_lot::Mutex<Vec<Arc<MockLink>>>,
    fail_open: AtomicBool,
}

impl MockLinkFactory {
    /// A factory producing working links
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `open` fail from now on
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Every link handed out so far
    #[must_use]
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    /// The most recently opened link
    #[must_use]
    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl PeerLinkFactory for MockLinkFactory {
    async fn open(&self, _config: &LinkConfig) -> Result<Arc<dyn PeerLink>, LinkError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::Negotiation("mock open failure".to_string()));
        }
        let link = MockLink::new();
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

/// A plausible host candidate for tests
#[must_use]
pub fn host_candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 54400 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

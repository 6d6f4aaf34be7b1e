//! Peer link abstraction
//!
//! A [`PeerLink`] is the media-plane connection to the remote party. The
//! session state machine drives it exclusively through this trait so that
//! negotiation logic can run against in-memory links; the production
//! implementation lives in [`crate::rtc_link`].

use crate::media::LocalMedia;
use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Peer link errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Creating or applying a session description failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// An ICE candidate could not be applied
    #[error("candidate rejected: {0}")]
    Candidate(String),

    /// The link is closed
    #[error("link closed")]
    Closed,

    /// Underlying stack error
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// ICE server configuration for a peer link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

/// Media-plane connection to the remote party
///
/// Candidate ordering discipline lives in the session, not here: the link
/// only ever sees candidates after the remote description is applied.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach local capture tracks for sending
    async fn add_media(&self, media: &LocalMedia) -> Result<(), LinkError>;

    /// Create the SDP offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create the SDP answer and set it as the local description
    ///
    /// Requires the remote offer to have been applied first.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply the remote session description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError>;

    /// Apply a remote ICE candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Take the stream of locally gathered candidates for trickling to the
    /// remote side
    ///
    /// Yields the receiver once; later calls return `None`. The stream ends
    /// when gathering is complete or the link is closed.
    fn take_local_candidates(&self) -> Option<tokio::sync::mpsc::Receiver<IceCandidate>>;

    /// Close the link. Idempotent.
    async fn close(&self) -> Result<(), LinkError>;
}

/// Factory for peer links, one per call session
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Open a fresh link with the given ICE configuration
    async fn open(&self, config: &LinkConfig) -> Result<Arc<dyn PeerLink>, LinkError>;
}

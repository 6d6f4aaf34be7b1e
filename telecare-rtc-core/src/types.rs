//! Core call types and data structures

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio capture
    pub audio: bool,
    /// Enable video capture
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

/// Which side of the call this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Initiated the call
    Caller,
    /// Received the invite
    Callee,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// Negotiated description of a peer's media capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged during connectivity negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

/// Why a session reached the `Failed` terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// User denied the media permission prompt
    PermissionDenied,
    /// No usable capture device at all
    NoDevice,
    /// Description or answer application failed
    NegotiationError,
    /// Signaling transport is down
    RelayUnreachable,
    /// Remote side is already in a call
    Busy,
    /// No answer within the invite timeout
    Timeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission-denied",
            Self::NoDevice => "no-device",
            Self::NegotiationError => "negotiation-error",
            Self::RelayUnreachable => "relay-unreachable",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Call session state
///
/// `Ended` and `Failed` are terminal; `Failed` carries a machine-readable
/// reason surfaced to the UI. A session visits `Ending` at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No negotiation started yet
    Idle,
    /// Acquiring camera/microphone (the only suspending wait on the user)
    AcquiringMedia,
    /// Offer sent, waiting for the remote answer (caller)
    Offering,
    /// Invite surfaced to the user, offer buffered but not applied (callee)
    Ringing,
    /// Accept in progress: applying the offer and sending the answer (callee)
    Answering,
    /// Descriptions exchanged; ICE completes connectivity asynchronously
    Connected,
    /// Teardown in progress
    Ending,
    /// Torn down normally
    Ended,
    /// Torn down by an unrecoverable error
    Failed(FailureReason),
}

impl CallState {
    /// Whether the session can still make progress
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }

    /// Whether a call is in flight (anything past `Idle`, not yet terminal)
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }
}

/// Why a call ended, carried on the `endCall`/`callEnded` wire messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Either side hung up (or tore down on a fatal error)
    Hangup,
    /// Callee declined the invite
    Declined,
    /// Callee already has an active session
    Busy,
}

/// Call invite: offer plus addressing and the caller's display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    /// Call identifier, minted by the caller
    pub call_id: CallId,
    /// Identity of the caller
    pub from: Identity,
    /// Identity of the callee
    pub to: Identity,
    /// SDP offer
    pub offer: SessionDescription,
    /// Caller's display name, surfaced on the callee's ring screen
    pub display_name: String,
    /// When the invite was created
    pub timestamp: DateTime<Utc>,
}

/// Answer to a call invite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswer {
    /// Call identifier
    pub call_id: CallId,
    /// Identity of the callee
    pub from: Identity,
    /// Identity of the original caller
    pub to: Identity,
    /// SDP answer
    pub answer: SessionDescription,
    /// When the answer was created
    pub timestamp: DateTime<Utc>,
}

/// Trickle ICE candidate message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateMsg {
    /// Call identifier
    pub call_id: CallId,
    /// Sender identity
    pub from: Identity,
    /// Target identity
    pub to: Identity,
    /// The candidate
    pub candidate: IceCandidate,
}

/// Call termination message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnd {
    /// Call identifier
    pub call_id: CallId,
    /// Sender identity
    pub from: Identity,
    /// Target identity
    pub to: Identity,
    /// Why the call ended
    pub reason: EndReason,
}

/// Call event for UI notification
///
/// Sessions and the listener publish these on one broadcast stream; the
/// presentation layer only subscribes and issues user-intent calls back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// An invite arrived and a callee session was created
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: Identity,
        /// Caller's display name
        display_name: String,
    },
    /// A session changed state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
    },
    /// Camera was unavailable; the session fell back to audio-only
    AudioOnlyFallback {
        /// Call identifier
        call_id: CallId,
    },
    /// An invite was rejected with busy because a session is active
    BusyRejected {
        /// Call identifier of the rejected invite
        call_id: CallId,
        /// Who was calling
        from: Identity,
    },
}

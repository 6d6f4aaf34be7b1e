//! Signaling wire protocol and transport seam
//!
//! The relay speaks JSON envelopes of the form
//! `{ "event": "<name>", "data": { ... } }`. [`ClientMessage`] is the
//! client-to-relay direction, [`ServerEvent`] the relay-to-client one.
//! Sessions send through the [`SignalingSender`] trait so the state machine
//! never owns a socket.

use crate::identity::Identity;
use crate::types::{CallAnswer, CallEnd, CallInvite, IceCandidateMsg};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling transport errors
#[derive(Error, Debug, Clone)]
pub enum SignalError {
    /// The transport to the relay is down
    #[error("signaling transport unavailable: {0}")]
    Transport(String),
}

/// Messages a client sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Join the room addressed by `identity`; sent once per identity,
    /// typically the personal identity plus a role-wide broadcast one
    #[serde(rename = "join_room")]
    JoinRoom {
        /// Identity to join under
        identity: Identity,
    },

    /// Invite `to` to a call, carrying the SDP offer
    #[serde(rename = "callUser")]
    CallUser(CallInvite),

    /// Answer a received invite, carrying the SDP answer
    #[serde(rename = "answerCall")]
    AnswerCall(CallAnswer),

    /// Trickle one ICE candidate to the remote party
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidateMsg),

    /// Terminate a call (hangup, decline or busy reply)
    #[serde(rename = "endCall")]
    EndCall(CallEnd),
}

/// Events the relay delivers to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A call invite addressed to this identity
    #[serde(rename = "incomingCall")]
    IncomingCall(CallInvite),

    /// The callee accepted; carries the SDP answer
    #[serde(rename = "callAccepted")]
    CallAccepted(CallAnswer),

    /// A trickled remote ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidateMsg),

    /// The remote party ended the call
    #[serde(rename = "callEnded")]
    CallEnded(CallEnd),
}

/// Outbound half of the signaling connection
#[async_trait]
pub trait SignalingSender: Send + Sync {
    /// Send one message to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Transport`] when the relay connection is down.
    async fn send(&self, message: ClientMessage) -> Result<(), SignalError>;
}

//! Telecare RTC relay - presence registry and signaling forwarder
//!
//! Relay-side half of the telecare call layer. Clients join under their
//! typed identities and the relay fans call signaling out to whichever
//! connections are currently present:
//!
//! - **[`PresenceRegistry`]**: identity to live connections, sharded so
//!   unrelated identities never contend
//! - **[`SignalingRelay`]**: stateless forwarding of invites, answers,
//!   ICE candidates and call terminations
//!
//! The relay never inspects call semantics; it is a pure addressed-message
//! switch over whatever transport hands it [`ClientMessage`]s.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Presence registry
pub mod presence;

/// Stateless signaling relay
pub mod relay;

pub use presence::{ConnectionSink, DeliveryError, PresenceRegistry};
pub use relay::SignalingRelay;

pub use telecare_rtc_core::signaling::{ClientMessage, ServerEvent};
pub use telecare_rtc_core::{Identity, Role};

/// Identifier of one client connection, minted by the transport on accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub Uuid);

impl ConnId {
    /// Mint a fresh connection id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

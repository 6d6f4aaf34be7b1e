//! Telecare RTC - real-time call signaling and session management
//!
//! Client-side call layer for the telecare platform. It lets two platform
//! users (doctor, patient, admin) establish a direct audio/video session
//! through a lightweight signaling relay:
//!
//! - **Typed identities**: users are addressed as `role:id`, with role-wide
//!   broadcast addresses
//! - **One session per call**: a [`CallSession`] state machine owns media,
//!   peer link and signaling for exactly one call
//! - **Registry, not a global slot**: sessions are keyed by call id in the
//!   [`SessionManager`], so concurrent invites are handled deterministically
//! - **Always-on listener**: the [`CallSessionListener`] receives invites on
//!   any screen and replies busy while a call is active
//!
//! # Examples
//!
//! ```rust,no_run
//! use telecare_rtc_core::{
//!     CallSession, Identity, Role, RtcLinkFactory, SessionConfig, SessionManager,
//!     StaticMediaSource,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(signal: Arc<dyn telecare_rtc_core::SignalingSender>) -> anyhow::Result<()> {
//! let manager = Arc::new(SessionManager::new());
//! let media = Arc::new(StaticMediaSource::full());
//! let links = Arc::new(RtcLinkFactory);
//!
//! // Call a doctor
//! let session = CallSession::caller(
//!     Identity::new(Role::Patient, "maria"),
//!     Identity::new(Role::Doctor, "42"),
//!     "Maria",
//!     signal,
//!     media,
//!     links,
//!     SessionConfig::default(),
//!     manager.event_sender(),
//! );
//! manager.insert(Arc::clone(&session)).await;
//! session.dial().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Typed user identities (`role:id`)
pub mod identity;

/// Core call types and wire data structures
pub mod types;

/// Local media acquisition
pub mod media;

/// Peer link abstraction
pub mod link;

/// WebRTC-backed peer link (requires webrtc-link feature)
#[cfg(feature = "webrtc-link")]
pub mod rtc_link;

/// Signaling wire protocol and transport seam
pub mod signaling;

/// Call session state machine
pub mod session;

/// Call session registry
pub mod manager;

/// Inbound signaling dispatch
pub mod listener;

/// In-memory fakes for tests (requires test-utils feature)
#[cfg(feature = "test-utils")]
pub mod testkit;

// Re-export main types at crate root
pub use identity::{Identity, IdentityParseError, Role};
pub use link::{LinkConfig, LinkError, PeerLink, PeerLinkFactory};
pub use listener::CallSessionListener;
pub use manager::SessionManager;
pub use media::{LocalMedia, LocalTrack, MediaError, MediaProbe, MediaSource, StaticMediaSource};
#[cfg(feature = "webrtc-link")]
pub use rtc_link::{RtcLinkFactory, RtcPeerLink};
pub use session::{CallSession, SessionConfig, SessionError};
pub use signaling::{ClientMessage, ServerEvent, SignalError, SignalingSender};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{Identity, Role};
    pub use crate::link::{LinkConfig, PeerLink, PeerLinkFactory};
    pub use crate::listener::CallSessionListener;
    pub use crate::manager::SessionManager;
    pub use crate::media::{MediaSource, StaticMediaSource};
    #[cfg(feature = "webrtc-link")]
    pub use crate::rtc_link::RtcLinkFactory;
    pub use crate::session::{CallSession, SessionConfig};
    pub use crate::signaling::{ClientMessage, ServerEvent, SignalingSender};
    pub use crate::types::{
        CallEvent, CallId, CallRole, CallState, EndReason, FailureReason, MediaConstraints,
    };
}

//! Local media acquisition
//!
//! Sessions acquire capture tracks through the [`MediaSource`] trait so the
//! state machine never touches device APIs directly. [`StaticMediaSource`]
//! is the in-process implementation: it hands out placeholder tracks for
//! whatever devices it is configured with, which is enough for negotiation
//! and for exercising permission and missing-device paths.

use crate::types::{MediaConstraints, MediaType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User denied the capture permission prompt
    #[error("media permission denied")]
    PermissionDenied,

    /// Requested device kind is not present
    #[error("no {0:?} capture device")]
    DeviceNotFound(MediaType),

    /// Constraints requested no media at all
    #[error("constraints request no media")]
    NothingRequested,
}

/// One acquired capture track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier, unique within the media bundle
    pub id: String,
    /// Audio or video
    pub kind: MediaType,
}

/// A bundle of acquired capture tracks
///
/// Holds a release flag shared with any [`MediaProbe`] handed out, so
/// teardown observability survives the bundle being dropped.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    released: Arc<AtomicBool>,
}

impl LocalMedia {
    /// Bundle the given tracks
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The acquired tracks
    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Whether the bundle contains a track of `kind`
    #[must_use]
    pub fn has_kind(&self, kind: MediaType) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Stop all capture. Safe to call more than once.
    pub fn stop(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// A probe observing this bundle's release flag
    #[must_use]
    pub fn probe(&self) -> MediaProbe {
        MediaProbe(Arc::clone(&self.released))
    }
}

/// Observer for a media bundle's release flag
#[derive(Debug, Clone)]
pub struct MediaProbe(Arc<AtomicBool>);

impl MediaProbe {
    /// Whether the observed bundle has been stopped
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source of local capture tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire capture tracks matching `constraints`.
    ///
    /// The source must fail whole-or-nothing: a partial grant is reported as
    /// [`MediaError::DeviceNotFound`] for the missing kind so the caller can
    /// decide whether to retry with reduced constraints.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// In-process media source with a fixed device inventory
#[derive(Debug)]
pub struct StaticMediaSource {
    has_microphone: bool,
    has_camera: bool,
    permission_denied: AtomicBool,
    issued: parking_lot::Mutex<Vec<MediaProbe>>,
}

impl StaticMediaSource {
    /// A source with both a microphone and a camera
    #[must_use]
    pub fn full() -> Self {
        Self::with_devices(true, true)
    }

    /// A source with a microphone but no camera
    #[must_use]
    pub fn audio_only() -> Self {
        Self::with_devices(true, false)
    }

    /// A source with the given device inventory
    #[must_use]
    pub fn with_devices(has_microphone: bool, has_camera: bool) -> Self {
        Self {
            has_microphone,
            has_camera,
            permission_denied: AtomicBool::new(false),
            issued: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent acquisition fail with `PermissionDenied`
    pub fn deny_permission(&self) {
        self.permission_denied.store(true, Ordering::SeqCst);
    }

    /// Probes for every bundle this source has handed out
    #[must_use]
    pub fn issued_probes(&self) -> Vec<MediaProbe> {
        self.issued.lock().clone()
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::full()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !constraints.has_audio() && !constraints.has_video() {
            return Err(MediaError::NothingRequested);
        }
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        if constraints.has_audio() && !self.has_microphone {
            return Err(MediaError::DeviceNotFound(MediaType::Audio));
        }
        if constraints.has_video() && !self.has_camera {
            return Err(MediaError::DeviceNotFound(MediaType::Video));
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(LocalTrack {
                id: format!("audio-{}", uuid::Uuid::new_v4()),
                kind: MediaType::Audio,
            });
        }
        if constraints.has_video() {
            tracks.push(LocalTrack {
                id: format!("video-{}", uuid::Uuid::new_v4()),
                kind: MediaType::Video,
            });
        }

        let media = LocalMedia::new(tracks);
        self.issued.lock().push(media.probe());
        Ok(media)
    }
}

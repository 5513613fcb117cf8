//! Local capture and remote media handles
//!
//! `MediaDevices` is the capture capability (microphone/camera access). A
//! successful acquisition yields a [`LocalMedia`] handle whose tracks are
//! attached to every transport session of the owning call. The handle is owned
//! by exactly one call at a time and must be stopped before another call may
//! acquire capture again.

use crate::config::MediaConstraints;
use crate::types::MediaKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused capture
    #[error("Permission denied: {0}")]
    Denied(String),

    /// Requested device kind not present
    #[error("Device not found: {0}")]
    NoDevice(String),

    /// Operation on stopped media
    #[error("Media already stopped")]
    Stopped,
}

/// Capture capability
///
/// Implement this for the platform's microphone/camera access. The engine
/// calls `acquire` before any transport session is created.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire local capture matching `constraints`
    ///
    /// # Errors
    ///
    /// Returns error if capture is denied or no matching device exists
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// One captured local track
///
/// Clones share the enabled/live flags, so a clone handed to a transport
/// observes mute and stop on the original.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Device label
    pub label: String,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the track is sending media (not muted)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether capture is still running
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop capture; returns `false` if it was already stopped
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }
}

/// Handle to acquired local capture
#[derive(Debug, Clone)]
pub struct LocalMedia {
    /// Stream identifier
    pub stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Wrap captured tracks into one stream
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// All captured tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Captured audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Audio)
    }

    /// Whether every track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_live())
    }

    /// Stop all tracks; safe to call repeatedly
    pub fn stop(&self) {
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        if stopped > 0 {
            tracing::debug!(stream_id = %self.stream_id, tracks = stopped, "Local media stopped");
        }
    }

    /// Enable or disable every audio track
    ///
    /// # Errors
    ///
    /// Returns error if the media was already stopped
    pub fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        if self.is_stopped() {
            return Err(MediaError::Stopped);
        }
        for track in self.audio_tracks() {
            track.set_enabled(!muted);
        }
        Ok(())
    }

    /// Whether audio is currently muted
    pub fn is_muted(&self) -> bool {
        let mut audio = self.audio_tracks().peekable();
        audio.peek().is_some() && audio.all(|t| !t.is_enabled())
    }
}

/// Inbound track delivered by a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier as announced by the sender
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Remote stream the track belongs to
    pub stream_id: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn media() -> LocalMedia {
        LocalMedia::new(vec![
            LocalTrack::new(MediaKind::Audio, "mic"),
            LocalTrack::new(MediaKind::Video, "cam"),
        ])
    }

    #[test]
    fn test_stop_is_idempotent() {
        let media = media();
        assert!(!media.is_stopped());
        media.stop();
        assert!(media.is_stopped());
        media.stop();
        assert!(media.is_stopped());
    }

    #[test]
    fn test_clones_share_track_state() {
        let media = media();
        let attached = media.clone();
        media.stop();
        assert!(attached.is_stopped());
    }

    #[test]
    fn test_mute_only_touches_audio() {
        let media = media();
        media.set_muted(true).unwrap();
        assert!(media.is_muted());
        let video = media
            .tracks()
            .iter()
            .find(|t| t.kind == MediaKind::Video)
            .unwrap();
        assert!(video.is_enabled());

        media.set_muted(false).unwrap();
        assert!(!media.is_muted());
    }

    #[test]
    fn test_mute_after_stop_fails() {
        let media = media();
        media.stop();
        assert_eq!(media.set_muted(true), Err(MediaError::Stopped));
    }

    #[test]
    fn test_video_only_is_never_muted() {
        let media = LocalMedia::new(vec![LocalTrack::new(MediaKind::Video, "cam")]);
        media.set_muted(true).unwrap();
        assert!(!media.is_muted());
    }
}

//! Local capture device lifecycle.
//!
//! The call machine is the only component allowed to acquire and release
//! capture handles; UI-level toggles (mute, video off) are applied to the
//! handle through the machine so the handle can never outlive its session.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Whether a session captures audio only or audio plus video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local-only toggles layered onto the capture handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaFlags {
    pub muted: bool,
    pub video_suppressed: bool,
}

/// Errors from acquiring a capture device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("no capture device available")]
    NoDevice,
    #[error("{0}")]
    Other(String),
}

/// A capturable local media handle.
///
/// `set_muted` and `set_video_suppressed` are synchronous and side-effect
/// only; toggling a track the handle does not carry (e.g. video on an
/// audio-only handle) is a no-op. `release` is idempotent and safe to call
/// on an already-released handle.
pub trait MediaHandle: Send + Sync {
    fn kind(&self) -> MediaKind;
    fn set_muted(&self, muted: bool);
    fn set_video_suppressed(&self, suppressed: bool);
    fn release(&self);
}

/// Acquires local capture handles.
///
/// The call machine calls `acquire` at most once per session and pairs every
/// successful acquire with exactly one `release` on its termination path.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, kind: MediaKind)
    -> Result<Arc<dyn MediaHandle>, MediaAcquisitionError>;
}

/// Capture source for headless use: hands out handles that track their
/// toggle state but move no media.
#[derive(Debug, Default)]
pub struct NullMediaSource;

#[async_trait]
impl MediaSource for NullMediaSource {
    async fn acquire(
        &self,
        kind: MediaKind,
    ) -> Result<Arc<dyn MediaHandle>, MediaAcquisitionError> {
        Ok(Arc::new(NullMediaHandle {
            kind,
            muted: AtomicBool::new(false),
            video_suppressed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }))
    }
}

pub struct NullMediaHandle {
    kind: MediaKind,
    muted: AtomicBool,
    video_suppressed: AtomicBool,
    released: AtomicBool,
}

impl MediaHandle for NullMediaHandle {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn set_video_suppressed(&self, suppressed: bool) {
        if self.kind.wants_video() {
            self.video_suppressed.store(suppressed, Ordering::Relaxed);
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("released {} capture handle", self.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_source_acquire() {
        let source = NullMediaSource;
        let handle = source.acquire(MediaKind::Video).await.unwrap();
        assert_eq!(handle.kind(), MediaKind::Video);
    }

    #[tokio::test]
    async fn test_video_toggle_is_noop_on_audio_handle() {
        let source = NullMediaSource;
        let handle = source.acquire(MediaKind::Audio).await.unwrap();
        handle.set_video_suppressed(true);

        let null = source.acquire(MediaKind::Audio).await.unwrap();
        null.set_video_suppressed(true);
        // Audio-only handles ignore video toggles.
        assert_eq!(null.kind(), MediaKind::Audio);
    }

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
    }

    #[test]
    fn test_release_is_idempotent() {
        let handle = NullMediaHandle {
            kind: MediaKind::Audio,
            muted: AtomicBool::new(false),
            video_suppressed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        };
        handle.release();
        handle.release();
        assert!(handle.released.load(Ordering::SeqCst));
    }
}

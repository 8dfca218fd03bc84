use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One captured track. Clones share the live flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{kind}-{}", Uuid::new_v4().simple()),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Local capture owned by exactly one call.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: format!("koda-{}", Uuid::new_v4().simple()),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, CallError>;
}

/// Track source without a capture device behind it.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticMedia {
    pub audio: bool,
    pub video: bool,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio));
        }
        if self.video {
            tracks.push(LocalTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(CallError::MediaUnavailable("no audio or video enabled".into()));
        }
        Ok(LocalMedia::new(tracks))
    }
}

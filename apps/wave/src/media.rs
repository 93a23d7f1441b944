//! Local media as the negotiation core sees it: track descriptors only.
//!
//! Capture devices live behind [`MediaCapture`]. The core never touches
//! samples; it adds descriptors to the connection handle and lets the
//! handle decide how they are encoded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
        }
    }

    pub fn audio(stream_id: impl Into<String>) -> Self {
        Self::new(format!("audio-{}", Uuid::new_v4()), MediaKind::Audio, stream_id)
    }

    pub fn video(stream_id: impl Into<String>) -> Self {
        Self::new(format!("video-{}", Uuid::new_v4()), MediaKind::Video, stream_id)
    }
}

/// Ordered set of tracks keyed by track id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    tracks: Vec<MediaTrack>,
}

impl TrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One audio and one video track sharing a fresh stream id.
    pub fn camera_and_microphone() -> Self {
        let stream = format!("stream-{}", Uuid::new_v4());
        Self::from(vec![MediaTrack::audio(&stream), MediaTrack::video(&stream)])
    }

    /// Returns `false` when a track with the same id is already present.
    pub fn insert(&mut self, track: MediaTrack) -> bool {
        if self.contains(&track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Adds every track not yet present and returns the ones that were new.
    pub fn merge(&mut self, other: &TrackSet) -> TrackSet {
        let mut added = TrackSet::new();
        for track in other.iter() {
            if self.insert(track.clone()) {
                added.tracks.push(track.clone());
            }
        }
        added
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks.iter().any(|track| track.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl From<Vec<MediaTrack>> for TrackSet {
    fn from(tracks: Vec<MediaTrack>) -> Self {
        let mut set = TrackSet::new();
        for track in tracks {
            set.insert(track);
        }
        set
    }
}

impl IntoIterator for TrackSet {
    type Item = MediaTrack;
    type IntoIter = std::vec::IntoIter<MediaTrack>;

    fn into_iter(self) -> Self::IntoIter {
        self.tracks.into_iter()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),
    #[error("media capture failed: {0}")]
    Capture(String),
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire_local_tracks(&self) -> Result<TrackSet, MediaError>;
}

/// Hands out the same track set on every call, or a fixed failure.
#[derive(Debug, Clone)]
pub struct StaticCapture {
    outcome: Result<TrackSet, MediaError>,
}

impl StaticCapture {
    pub fn new(tracks: TrackSet) -> Self {
        Self { outcome: Ok(tracks) }
    }

    pub fn camera_and_microphone() -> Self {
        Self::new(TrackSet::camera_and_microphone())
    }

    pub fn empty() -> Self {
        Self::new(TrackSet::new())
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            outcome: Err(error),
        }
    }
}

#[async_trait]
impl MediaCapture for StaticCapture {
    async fn acquire_local_tracks(&self) -> Result<TrackSet, MediaError> {
        self.outcome.clone()
    }
}

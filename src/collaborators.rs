//! Seams to the parts of a call this crate does not implement: rendering,
//! speech recognition and speech synthesis.

use crate::peer::types::{MediaTrack, RemoteTrackInfo};
use async_trait::async_trait;
use std::sync::Arc;

/// Rendering surface for local and remote media.
pub trait MediaSink: Send + Sync {
    fn attach_local(&self, tracks: &[MediaTrack]);
    fn attach_remote(&self, track: &RemoteTrackInfo);
    fn detach_all(&self);
}

/// Sink that renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MediaSink for NullSink {
    fn attach_local(&self, _tracks: &[MediaTrack]) {}
    fn attach_remote(&self, _track: &RemoteTrackInfo) {}
    fn detach_all(&self) {}
}

/// Receives recognised speech from an external recogniser.
pub type TranscriptHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Outbound text-to-speech.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(&self, text: &str, language_code: &str);
}

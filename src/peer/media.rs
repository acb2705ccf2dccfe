use crate::error::MediaAcquisitionError;
use crate::peer::types::{MediaKind, MediaTrack, TrackSnapshot, TrackSource};
use crate::utils::random_id;
use async_trait::async_trait;
use tracing::{info, warn};

/// Source of local camera/microphone tracks.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaAcquisitionError>;
}

/// Host without capture hardware; always falls through to the synthetic stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCaptureDevice;

#[async_trait]
impl CaptureDevice for NoCaptureDevice {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaAcquisitionError> {
        Err(MediaAcquisitionError::Unavailable(
            "no capture backend on this host".into(),
        ))
    }
}

/// A stream the caller already holds (e.g. a preview that is already
/// rendering); it is reused instead of opening the devices again.
#[derive(Debug, Clone, Default)]
pub struct ExistingStream {
    tracks: Vec<MediaTrack>,
}

impl ExistingStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }
}

#[async_trait]
impl CaptureDevice for ExistingStream {
    async fn acquire(&self) -> Result<Vec<MediaTrack>, MediaAcquisitionError> {
        if self.tracks.is_empty() {
            return Err(MediaAcquisitionError::Empty);
        }
        Ok(self.tracks.clone())
    }
}

/// One silent audio track and one placeholder video track, shaped like a
/// real capture so negotiation runs the same path either way.
pub fn synthetic_stream() -> Vec<MediaTrack> {
    vec![
        MediaTrack::new(
            format!("audio-{}", random_id()),
            MediaKind::Audio,
            "Silent Audio",
            TrackSource::Synthetic,
        ),
        MediaTrack::new(
            format!("video-{}", random_id()),
            MediaKind::Video,
            "Local Camera",
            TrackSource::Synthetic,
        ),
    ]
}

/// Tries the device and substitutes the synthetic stream on any failure.
pub async fn acquire_tracks(device: &dyn CaptureDevice) -> Vec<MediaTrack> {
    match device.acquire().await {
        Ok(tracks) if !tracks.is_empty() => {
            info!(count = tracks.len(), "acquired local media");
            tracks
        }
        Ok(_) => {
            warn!(error = %MediaAcquisitionError::Empty, "using synthetic media stream");
            synthetic_stream()
        }
        Err(err) => {
            warn!(error = %err, "could not access capture device, using synthetic media stream");
            synthetic_stream()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub tracks: Vec<TrackSnapshot>,
}

/// Local tracks plus the audio/video switches. Switches flipped before any
/// track exists are remembered and applied when tracks are installed.
#[derive(Debug)]
pub struct LocalMedia {
    audio_enabled: bool,
    video_enabled: bool,
    tracks: Vec<MediaTrack>,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            tracks: Vec::new(),
        }
    }
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, tracks: Vec<MediaTrack>) -> Vec<MediaTrack> {
        for track in &tracks {
            track.set_enabled(self.wanted(track.kind()));
        }
        self.tracks = tracks;
        self.tracks.clone()
    }

    /// Flips every track of `kind`. Returns how many tracks were touched.
    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> usize {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
        let mut touched = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            info!(track = track.label(), ?kind, enabled, "track toggled");
            touched += 1;
        }
        touched
    }

    /// Stops and releases every track.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.tracks.iter().filter(|track| track.stop()).count();
        self.tracks.clear();
        stopped
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            tracks: self.tracks.iter().map(MediaTrack::snapshot).collect(),
        }
    }

    fn wanted(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }
}

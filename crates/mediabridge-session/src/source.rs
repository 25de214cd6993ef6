use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mediabridge_rpc::Multiplexer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::dump::TrackDump;
use crate::error::{Result, SessionError};
use crate::handle::{Liveness, RemoteHandle};
use crate::methods;

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
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Live,
    Ended,
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    Device,
    File,
    Url,
}

impl FromStr for SourceOrigin {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "device" => Ok(SourceOrigin::Device),
            "file" => Ok(SourceOrigin::File),
            "url" => Ok(SourceOrigin::Url),
            other => Err(SessionError::UnsupportedSource(other.to_string())),
        }
    }
}

/// Options for one track of a media source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSourceSpec {
    /// `device`, `file` or `url`. Anything else is rejected before the
    /// request is sent.
    #[serde(rename = "source")]
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl TrackSourceSpec {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            device: None,
            file: None,
            url: None,
            format: None,
            options: None,
        }
    }

    pub fn device(name: impl Into<String>) -> Self {
        Self {
            device: Some(name.into()),
            ..Self::new("device")
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file: Some(path.into()),
            ..Self::new("file")
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::new("url")
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    fn validate(&self) -> Result<SourceOrigin> {
        let origin: SourceOrigin = self.origin.parse()?;
        match origin {
            SourceOrigin::File if self.file.is_none() => Err(SessionError::InvalidArgument(
                "file origin requires a file".to_string(),
            )),
            SourceOrigin::Url if self.url.is_none() => Err(SessionError::InvalidArgument(
                "url origin requires a url".to_string(),
            )),
            _ => Ok(origin),
        }
    }
}

/// What to acquire: an audio track, a video track, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaSourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<TrackSourceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<TrackSourceSpec>,
}

impl MediaSourceSpec {
    pub fn with_audio(mut self, spec: TrackSourceSpec) -> Self {
        self.audio = Some(spec);
        self
    }

    pub fn with_video(mut self, spec: TrackSourceSpec) -> Self {
        self.video = Some(spec);
        self
    }

    /// Audio and video from the same origin.
    pub fn audio_video(spec: TrackSourceSpec) -> Self {
        Self {
            audio: Some(spec.clone()),
            video: Some(spec),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.audio.is_none() && self.video.is_none() {
            return Err(SessionError::InvalidArgument(
                "media source needs audio, video or both".to_string(),
            ));
        }
        for spec in self.audio.iter().chain(self.video.iter()) {
            spec.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AcquiredSource {
    pub source_id: String,
    pub tracks: Vec<TrackDump>,
}

struct SourceInner {
    handle: RemoteHandle,
    tracks: Vec<MediaTrack>,
    mux: Multiplexer,
}

/// A producible media source living in the engine.
#[derive(Clone)]
pub struct MediaSource {
    inner: Arc<SourceInner>,
}

impl MediaSource {
    pub(crate) fn new(mux: Multiplexer, engine: &Liveness, acquired: AcquiredSource) -> Self {
        let handle = RemoteHandle::new(acquired.source_id, engine);
        let tracks = acquired
            .tracks
            .into_iter()
            .map(|track| MediaTrack::new(mux.clone(), &handle, track))
            .collect();
        Self {
            inner: Arc::new(SourceInner {
                handle,
                tracks,
                mux,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.handle.id()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    /// First track of `kind`.
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.inner.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.handle.is_closed()
    }

    /// Release the source in the engine. Every track ends. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner
            .mux
            .request(methods::SOURCE_CLOSE, Some(self.id()), json!({}))
            .await?;
        if self.inner.handle.close() {
            debug!(source_id = self.id(), "media source closed");
        }
        Ok(())
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.id())
            .field("tracks", &self.inner.tracks)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct TrackInner {
    handle: RemoteHandle,
    kind: MediaKind,
    source_id: String,
    mux: Multiplexer,
}

/// One track of a [`MediaSource`].
///
/// Cheap to clone; clones share readiness.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    fn new(mux: Multiplexer, source: &RemoteHandle, track: TrackDump) -> Self {
        let handle = RemoteHandle::new(track.id, source.liveness());
        if track.ready_state == ReadyState::Ended {
            handle.close();
        }
        Self {
            inner: Arc::new(TrackInner {
                handle,
                kind: track.kind,
                source_id: source.id().to_string(),
                mux,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.handle.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    /// `Ended` once stopped, or once its source or engine closed.
    pub fn ready_state(&self) -> ReadyState {
        if self.inner.handle.is_closed() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    /// Stop the track in the engine. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.ready_state() == ReadyState::Ended {
            return Ok(());
        }
        self.inner
            .mux
            .request(
                methods::SOURCE_STOP_TRACK,
                Some(self.source_id()),
                json!({ "trackId": self.id() }),
            )
            .await?;
        if self.inner.handle.close() {
            debug!(track_id = self.id(), kind = %self.kind(), "track stopped");
        }
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_origin_is_unsupported() {
        let spec = MediaSourceSpec::default().with_audio(TrackSourceSpec::new("bogus"));
        assert!(matches!(
            spec.validate(),
            Err(SessionError::UnsupportedSource(origin)) if origin == "bogus"
        ));
    }

    #[test]
    fn empty_spec_is_invalid() {
        assert!(matches!(
            MediaSourceSpec::default().validate(),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_origin_needs_a_path() {
        let spec = MediaSourceSpec::default().with_video(TrackSourceSpec::new("file"));
        assert!(matches!(spec.validate(), Err(SessionError::InvalidArgument(_))));
    }

    #[test]
    fn spec_serializes_like_the_engine_expects() {
        let spec = MediaSourceSpec::default()
            .with_audio(TrackSourceSpec::file("small.mp4").with_format("mp4"))
            .with_video(TrackSourceSpec::device("/dev/video0"));
        assert!(spec.validate().is_ok());

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            value,
            json!({
                "audio": { "source": "file", "file": "small.mp4", "format": "mp4" },
                "video": { "source": "device", "device": "/dev/video0" }
            })
        );
    }
}

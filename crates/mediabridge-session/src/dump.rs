//! Engine snapshot returned by `dump`.

use serde::{Deserialize, Serialize};

use crate::source::{MediaKind, ReadyState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDump {
    pub pid: u32,
    #[serde(default)]
    pub sources: Vec<SourceDump>,
    #[serde(default)]
    pub sessions: Vec<HandlerDump>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDump {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<TrackDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDump {
    pub id: String,
    pub kind: MediaKind,
    pub ready_state: ReadyState,
}

/// One handler as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDump {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub signaling_state: String,
    #[serde(alias = "iceConnectionState")]
    pub ice_state: String,
    #[serde(default)]
    pub send_transceivers: Vec<SendTransceiverDump>,
    #[serde(default)]
    pub transceivers: Vec<TransceiverDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransceiverDump {
    pub mid: String,
    pub local_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransceiverDump {
    pub mid: Option<String>,
    pub kind: MediaKind,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderDump {
    pub track_id: Option<String>,
}

impl EngineDump {
    pub fn source(&self, id: &str) -> Option<&SourceDump> {
        self.sources.iter().find(|source| source.id == id)
    }

    pub fn session(&self, id: &str) -> Option<&HandlerDump> {
        self.sessions
            .iter()
            .find(|session| session.id.as_deref() == Some(id))
    }
}

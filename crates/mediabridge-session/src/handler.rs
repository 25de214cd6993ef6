use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use mediabridge_rpc::{Multiplexer, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{decode, Result, SessionError};
use crate::handle::{lock, Liveness, RemoteHandle};
use crate::methods;
use crate::source::{MediaKind, MediaTrack, ReadyState};

/// Which way media flows through a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        })
    }
}

/// Transport connection state as reported by the engine.
///
/// `New → Connecting → Connected ⇄ Disconnected`, and `Closed` from anywhere.
/// Only engine notifications move it, except `Closed`, which is local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }

    /// Map an engine ICE connection state. `new` and `closed` do not move the
    /// local state.
    pub fn from_ice_state(state: &str) -> Option<Self> {
        match state {
            "checking" => Some(ConnectionState::Connecting),
            "connected" | "completed" => Some(ConnectionState::Connected),
            "disconnected" | "failed" => Some(ConnectionState::Disconnected),
            _ => None,
        }
    }

    fn apply_ice_state(self, state: &str) -> Option<Self> {
        if self == ConnectionState::Closed {
            return None;
        }
        let next = Self::from_ice_state(state)?;
        (next != self).then_some(next)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data sent with `createHandler`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerOptions {
    pub direction: Direction,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_data: Option<Value>,
}

impl HandlerOptions {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: json!({}),
            sctp_parameters: None,
            app_data: None,
        }
    }

    pub fn with_ice(mut self, parameters: Value, candidates: Value) -> Self {
        self.ice_parameters = parameters;
        self.ice_candidates = candidates;
        self
    }

    pub fn with_dtls_parameters(mut self, parameters: Value) -> Self {
        self.dtls_parameters = parameters;
        self
    }

    pub fn with_sctp_parameters(mut self, parameters: Value) -> Self {
        self.sctp_parameters = Some(parameters);
        self
    }

    pub fn with_app_data(mut self, app_data: Value) -> Self {
        self.app_data = Some(app_data);
        self
    }
}

/// Options for [`Handler::add_producing_track`].
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Stop the outgoing track when it is replaced or its producer closes.
    pub stop_tracks: bool,
    pub encodings: Option<Value>,
    pub codec_options: Option<Value>,
    pub app_data: Option<Value>,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            stop_tracks: true,
            encodings: None,
            codec_options: None,
            app_data: None,
        }
    }
}

impl ProduceOptions {
    pub fn with_stop_tracks(mut self, stop_tracks: bool) -> Self {
        self.stop_tracks = stop_tracks;
        self
    }

    pub fn with_encodings(mut self, encodings: Value) -> Self {
        self.encodings = Some(encodings);
        self
    }

    pub fn with_codec_options(mut self, codec_options: Value) -> Self {
        self.codec_options = Some(codec_options);
        self
    }

    pub fn with_app_data(mut self, app_data: Value) -> Self {
        self.app_data = Some(app_data);
        self
    }
}

/// Remote consumer parameters for [`Handler::add_consuming_track`].
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Option<Value>,
}

impl ConsumeOptions {
    pub fn new(
        id: impl Into<String>,
        producer_id: impl Into<String>,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Self {
        Self {
            id: id.into(),
            producer_id: producer_id.into(),
            kind,
            rtp_parameters,
            app_data: None,
        }
    }
}

/// Options for [`Handler::open_data_channel`]. Sent as-is to the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelOptions {
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u32>,
    pub label: String,
    pub protocol: String,
    /// SCTP stream to bind on receiving handlers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u16>,
    /// Required on receiving handlers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_producer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_data: Option<Value>,
}

impl Default for DataChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
            label: String::new(),
            protocol: String::new(),
            stream_id: None,
            data_producer_id: None,
            app_data: None,
        }
    }
}

impl DataChannelOptions {
    pub fn labeled(label: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            protocol: protocol.into(),
            ..Self::default()
        }
    }
}

/// Local view of one transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub mid: String,
    pub kind: MediaKind,
    pub direction: Direction,
    pub stopped: bool,
    pub local_track_id: Option<String>,
}

/// A track that can be produced: a local source track, or the track a
/// [`Consumer`] receives, forwarded back out.
#[derive(Debug, Clone, Copy)]
pub enum TrackRef<'a> {
    Local(&'a MediaTrack),
    Received(&'a Consumer),
}

impl TrackRef<'_> {
    pub fn id(&self) -> &str {
        match self {
            TrackRef::Local(track) => track.id(),
            TrackRef::Received(consumer) => consumer.track_id(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            TrackRef::Local(track) => track.kind(),
            TrackRef::Received(consumer) => consumer.kind(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        match self {
            TrackRef::Local(track) => track.ready_state(),
            TrackRef::Received(consumer) => consumer.track_state(),
        }
    }
}

impl<'a> From<&'a MediaTrack> for TrackRef<'a> {
    fn from(track: &'a MediaTrack) -> Self {
        TrackRef::Local(track)
    }
}

impl<'a> From<&'a Consumer> for TrackRef<'a> {
    fn from(consumer: &'a Consumer) -> Self {
        TrackRef::Received(consumer)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    track_id: &'a str,
    kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    encodings: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    codec_options: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_data: Option<&'a Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    local_id: String,
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    rtp_parameters: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveRequest<'a> {
    track_id: &'a str,
    kind: MediaKind,
    rtp_parameters: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_data: Option<&'a Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiveResponse {
    local_id: String,
    #[serde(default)]
    mid: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataChannelResponse {
    data_channel_id: String,
    #[serde(default)]
    sctp_stream_parameters: Value,
    #[serde(default)]
    mid: Option<String>,
}

#[derive(Deserialize)]
struct StateChange {
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackStateChange {
    track_id: String,
    ready_state: ReadyState,
}

struct Transceiver {
    mid: String,
    kind: MediaKind,
    direction: Direction,
    stopped: bool,
    local_id: String,
    /// Local track being sent. Only these are ever stopped by the handler.
    track: Option<MediaTrack>,
    /// Track not owned by this controller: the received track on a recv
    /// transceiver, or a forwarded consumer track on a send transceiver.
    remote_track_id: Option<String>,
    stop_tracks: bool,
}

impl Transceiver {
    fn info(&self) -> TransceiverInfo {
        let local_track_id = match (&self.track, &self.remote_track_id) {
            _ if self.stopped => None,
            (Some(track), _) => Some(track.id().to_string()),
            (None, Some(remote)) => Some(remote.clone()),
            (None, None) => None,
        };
        TransceiverInfo {
            mid: self.mid.clone(),
            kind: self.kind,
            direction: self.direction,
            stopped: self.stopped,
            local_track_id,
        }
    }
}

struct HandlerState {
    transceivers: Vec<Transceiver>,
    used_mids: HashSet<String>,
    data_mid: Option<String>,
    remote_parameters: Option<Value>,
    signaling_state: String,
    track_states: HashMap<String, ReadyState>,
    subscriptions: Vec<Subscription>,
}

impl HandlerState {
    fn claim_mid(&mut self, mid: &str) -> Result<()> {
        if self.used_mids.insert(mid.to_string()) {
            Ok(())
        } else {
            Err(SessionError::DuplicateMid(mid.to_string()))
        }
    }

    fn transceiver(&self, mid: &str) -> Result<&Transceiver> {
        self.transceivers
            .iter()
            .find(|t| t.mid == mid)
            .ok_or_else(|| SessionError::UnknownTransceiver(mid.to_string()))
    }

    fn transceiver_mut(&mut self, mid: &str) -> Result<&mut Transceiver> {
        self.transceivers
            .iter_mut()
            .find(|t| t.mid == mid)
            .ok_or_else(|| SessionError::UnknownTransceiver(mid.to_string()))
    }
}

struct HandlerShared {
    id: String,
    direction: Direction,
    mux: Multiplexer,
    liveness: Liveness,
    connection: watch::Sender<ConnectionState>,
    state: Mutex<HandlerState>,
}

impl HandlerShared {
    fn on_ice_state(&self, data: &Value) {
        if self.liveness.is_closed() {
            return;
        }
        let Ok(change) = serde_json::from_value::<StateChange>(data.clone()) else {
            warn!(handler_id = %self.id, %data, "malformed iceconnectionstatechange");
            return;
        };
        let mut moved = None;
        self.connection.send_if_modified(|current| {
            match current.apply_ice_state(&change.state) {
                Some(next) => {
                    moved = Some((*current, next));
                    *current = next;
                    true
                }
                None => false,
            }
        });
        if let Some((from, to)) = moved {
            debug!(handler_id = %self.id, %from, %to, ice = %change.state, "connection state changed");
        }
    }

    fn on_signaling_state(&self, data: &Value) {
        if self.liveness.is_closed() {
            return;
        }
        match serde_json::from_value::<StateChange>(data.clone()) {
            Ok(change) => lock(&self.state).signaling_state = change.state,
            Err(_) => warn!(handler_id = %self.id, %data, "malformed signalingstatechange"),
        }
    }

    fn on_track_state(&self, data: &Value) {
        if self.liveness.is_closed() {
            return;
        }
        match serde_json::from_value::<TrackStateChange>(data.clone()) {
            Ok(change) => {
                debug!(
                    handler_id = %self.id,
                    track_id = %change.track_id,
                    ready_state = ?change.ready_state,
                    "track state changed"
                );
                lock(&self.state)
                    .track_states
                    .insert(change.track_id, change.ready_state);
            }
            Err(_) => warn!(handler_id = %self.id, %data, "malformed trackstatechange"),
        }
    }

    /// Close without telling the engine. Returns whether this call did it.
    fn close_local(&self) -> bool {
        if !self.liveness.close() {
            return false;
        }
        self.connection
            .send_modify(|state| *state = ConnectionState::Closed);
        self.mux.unsubscribe_target(&self.id);
        let subscriptions = std::mem::take(&mut lock(&self.state).subscriptions);
        drop(subscriptions);
        info!(handler_id = %self.id, direction = %self.direction, "handler closed");
        true
    }
}

/// One simulated peer connection driven through the engine.
///
/// Cheap to clone. Remote state is only ever updated from confirmed call
/// results or engine notifications.
#[derive(Clone)]
pub struct Handler {
    shared: Arc<HandlerShared>,
}

/// Non-owning reference kept by the engine to close handlers on shutdown.
pub(crate) struct WeakHandler(Weak<HandlerShared>);

impl WeakHandler {
    pub(crate) fn close_local(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.close_local();
        }
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.0.upgrade().is_none_or(|shared| shared.liveness.is_closed())
    }
}

impl Handler {
    pub(crate) fn new(mux: Multiplexer, engine: &Liveness, id: String, direction: Direction) -> Self {
        let (connection, _) = watch::channel(ConnectionState::New);
        let shared = Arc::new(HandlerShared {
            id,
            direction,
            mux,
            liveness: engine.child(),
            connection,
            state: Mutex::new(HandlerState {
                transceivers: Vec::new(),
                used_mids: HashSet::new(),
                data_mid: None,
                remote_parameters: None,
                signaling_state: "stable".to_string(),
                track_states: HashMap::new(),
                subscriptions: Vec::new(),
            }),
        });

        let subscriptions = vec![
            listen(&shared, methods::EVENT_ICE_CONNECTION_STATE_CHANGE, HandlerShared::on_ice_state),
            listen(&shared, methods::EVENT_SIGNALING_STATE_CHANGE, HandlerShared::on_signaling_state),
            listen(&shared, methods::EVENT_TRACK_STATE_CHANGE, HandlerShared::on_track_state),
        ];
        lock(&shared.state).subscriptions = subscriptions;

        info!(handler_id = %shared.id, %direction, "handler created");
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> WeakHandler {
        WeakHandler(Arc::downgrade(&self.shared))
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    pub fn signaling_state(&self) -> String {
        lock(&self.shared.state).signaling_state.clone()
    }

    /// Remote transport parameters, once set.
    pub fn remote_parameters(&self) -> Option<Value> {
        lock(&self.shared.state).remote_parameters.clone()
    }

    /// Transceivers in creation order, stopped ones included.
    pub fn transceivers(&self) -> Vec<TransceiverInfo> {
        lock(&self.shared.state)
            .transceivers
            .iter()
            .map(Transceiver::info)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.liveness.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        self.shared.liveness.ensure_open("handler")
    }

    fn ensure_direction(&self, direction: Direction, operation: &'static str) -> Result<()> {
        if self.shared.direction == direction {
            Ok(())
        } else {
            Err(SessionError::WrongDirection {
                operation,
                direction: self.shared.direction,
            })
        }
    }

    async fn request(&self, method: &'static str, data: Value) -> Result<Value> {
        Ok(self
            .shared
            .mux
            .request(method, Some(&self.shared.id), data)
            .await?)
    }

    /// Hand the remote transport parameters to the engine. Allowed once.
    ///
    /// Returns the engine's reply (its local DTLS parameters). The connection
    /// state is left to engine notifications.
    pub async fn set_transport_remote_parameters(&self, parameters: Value) -> Result<Value> {
        self.ensure_open()?;
        if lock(&self.shared.state).remote_parameters.is_some() {
            return Err(SessionError::AlreadyConfigured);
        }

        let reply = self
            .request(methods::HANDLER_SET_REMOTE_PARAMETERS, parameters.clone())
            .await?;

        let mut state = lock(&self.shared.state);
        if state.remote_parameters.is_some() {
            return Err(SessionError::AlreadyConfigured);
        }
        state.remote_parameters = Some(parameters);
        Ok(reply)
    }

    /// Add a sending transceiver for `track`.
    ///
    /// `track` is a local [`MediaTrack`] or a [`Consumer`] whose received
    /// track is sent back out. A forwarded track is never stopped by this
    /// handler, whatever `stop_tracks` says.
    pub async fn add_producing_track<'a>(
        &self,
        track: impl Into<TrackRef<'a>>,
        options: ProduceOptions,
    ) -> Result<Producer> {
        let track: TrackRef<'a> = track.into();
        self.ensure_open()?;
        self.ensure_direction(Direction::Send, "add_producing_track")?;
        if track.ready_state() == ReadyState::Ended {
            return Err(SessionError::InvalidArgument(format!(
                "track {} has ended",
                track.id()
            )));
        }

        let body = serde_json::to_value(SendRequest {
            track_id: track.id(),
            kind: track.kind(),
            encodings: options.encodings.as_ref(),
            codec_options: options.codec_options.as_ref(),
            app_data: options.app_data.as_ref(),
        })?;
        let reply = self.request(methods::HANDLER_SEND, body).await?;
        let sent: SendResponse = decode(methods::HANDLER_SEND, reply)?;
        let mid = sent
            .mid
            .clone()
            .or_else(|| {
                sent.rtp_parameters
                    .get("mid")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| SessionError::UnexpectedResponse {
                method: methods::HANDLER_SEND,
                detail: "no mid assigned".to_string(),
            })?;

        {
            let mut state = lock(&self.shared.state);
            self.ensure_open()?;
            state.claim_mid(&mid)?;
            state.transceivers.push(Transceiver {
                mid: mid.clone(),
                kind: track.kind(),
                direction: Direction::Send,
                stopped: false,
                local_id: sent.local_id.clone(),
                track: match track {
                    TrackRef::Local(local) => Some(local.clone()),
                    TrackRef::Received(_) => None,
                },
                remote_track_id: match track {
                    TrackRef::Local(_) => None,
                    TrackRef::Received(consumer) => Some(consumer.track_id().to_string()),
                },
                stop_tracks: options.stop_tracks,
            });
        }
        debug!(handler_id = self.id(), %mid, track_id = track.id(), "producing track added");

        Ok(Producer {
            handle: RemoteHandle::new(sent.local_id, &self.shared.liveness),
            mid,
            kind: track.kind(),
            rtp_parameters: sent.rtp_parameters,
            app_data: options.app_data,
            handler: self.clone(),
        })
    }

    /// Swap the track sent on `mid`. `None` sends nothing.
    ///
    /// The outgoing track is stopped when the transceiver was created with
    /// `stop_tracks`.
    pub async fn replace_track(&self, mid: &str, track: Option<&MediaTrack>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_direction(Direction::Send, "replace_track")?;
        {
            let state = lock(&self.shared.state);
            let transceiver = state.transceiver(mid)?;
            if transceiver.stopped {
                return Err(SessionError::Closed("transceiver"));
            }
            if let Some(track) = track {
                if track.kind() != transceiver.kind {
                    return Err(SessionError::InvalidArgument(format!(
                        "cannot send {} track on {} transceiver {mid}",
                        track.kind(),
                        transceiver.kind
                    )));
                }
                if track.ready_state() == ReadyState::Ended {
                    return Err(SessionError::InvalidArgument(format!(
                        "track {} has ended",
                        track.id()
                    )));
                }
            }
        }

        self.request(
            methods::HANDLER_REPLACE_TRACK,
            json!({ "mid": mid, "trackId": track.map(MediaTrack::id) }),
        )
        .await?;

        let (previous, stop_tracks) = {
            let mut state = lock(&self.shared.state);
            let transceiver = state.transceiver_mut(mid)?;
            // Removed while the engine was replacing.
            if transceiver.stopped {
                return Err(SessionError::Closed("transceiver"));
            }
            transceiver.remote_track_id = None;
            let previous = std::mem::replace(&mut transceiver.track, track.cloned());
            (previous, transceiver.stop_tracks)
        };

        if let Some(previous) = previous {
            let reused = track.is_some_and(|track| track.same_as(&previous));
            if stop_tracks && !reused {
                if let Err(err) = previous.stop().await {
                    warn!(handler_id = self.id(), track_id = previous.id(), error = %err, "failed to stop replaced track");
                }
            }
        }
        Ok(())
    }

    /// Add a receiving transceiver for a remote producer.
    pub async fn add_consuming_track(&self, options: ConsumeOptions) -> Result<Consumer> {
        self.ensure_open()?;
        self.ensure_direction(Direction::Recv, "add_consuming_track")?;

        let body = serde_json::to_value(ReceiveRequest {
            track_id: &options.id,
            kind: options.kind,
            rtp_parameters: &options.rtp_parameters,
            app_data: options.app_data.as_ref(),
        })?;
        let reply = self.request(methods::HANDLER_RECEIVE, body).await?;
        let received: ReceiveResponse = decode(methods::HANDLER_RECEIVE, reply)?;
        let mid = received
            .mid
            .ok_or_else(|| SessionError::UnexpectedResponse {
                method: methods::HANDLER_RECEIVE,
                detail: "no mid assigned".to_string(),
            })?;

        {
            let mut state = lock(&self.shared.state);
            self.ensure_open()?;
            state.claim_mid(&mid)?;
            state.transceivers.push(Transceiver {
                mid: mid.clone(),
                kind: options.kind,
                direction: Direction::Recv,
                stopped: false,
                local_id: received.local_id.clone(),
                track: None,
                remote_track_id: Some(options.id.clone()),
                stop_tracks: false,
            });
            // An engine notification that arrived before the reply wins.
            state
                .track_states
                .entry(options.id.clone())
                .or_insert(ReadyState::Live);
        }
        debug!(handler_id = self.id(), %mid, consumer_id = %options.id, "consuming track added");

        Ok(Consumer {
            handle: RemoteHandle::new(options.id.clone(), &self.shared.liveness),
            producer_id: options.producer_id,
            kind: options.kind,
            mid,
            local_id: received.local_id,
            track_id: options.id,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            handler: self.clone(),
        })
    }

    /// Stop the transceiver on `mid`. Its mid stays reserved.
    pub async fn remove_transceiver(&self, mid: &str) -> Result<()> {
        self.detach_transceiver(mid).await.map(|_| ())
    }

    /// Returns the track that was sent and the transceiver's stop policy.
    async fn detach_transceiver(&self, mid: &str) -> Result<Option<(MediaTrack, bool)>> {
        self.ensure_open()?;
        if lock(&self.shared.state).transceiver(mid)?.stopped {
            return Ok(None);
        }

        self.request(methods::HANDLER_REMOVE_TRANSCEIVER, json!({ "mid": mid }))
            .await?;

        let mut state = lock(&self.shared.state);
        let transceiver = state.transceiver_mut(mid)?;
        transceiver.stopped = true;
        let detached = transceiver
            .track
            .take()
            .map(|track| (track, transceiver.stop_tracks));
        let received = match transceiver.direction {
            Direction::Recv => transceiver.remote_track_id.clone(),
            Direction::Send => None,
        };
        if let Some(remote) = received {
            state.track_states.insert(remote, ReadyState::Ended);
        }
        debug!(handler_id = self.id(), mid, "transceiver removed");
        Ok(detached)
    }

    /// Open an SCTP data channel: a [`DataProducer`] on sending handlers, a
    /// [`DataConsumer`] on receiving ones.
    pub async fn open_data_channel(&self, options: DataChannelOptions) -> Result<DataChannel> {
        self.ensure_open()?;
        if self.shared.direction == Direction::Recv && options.data_producer_id.is_none() {
            return Err(SessionError::InvalidArgument(
                "receiving data channel needs a data producer id".to_string(),
            ));
        }

        let body = serde_json::to_value(&options)?;
        let reply = self.request(methods::HANDLER_CREATE_DATA_CHANNEL, body).await?;
        let opened: DataChannelResponse = decode(methods::HANDLER_CREATE_DATA_CHANNEL, reply)?;

        if let Some(mid) = &opened.mid {
            let mut state = lock(&self.shared.state);
            self.ensure_open()?;
            if state.data_mid.as_ref() != Some(mid) {
                state.claim_mid(mid)?;
                state.data_mid = Some(mid.clone());
            }
        }

        let handle = RemoteHandle::new(opened.data_channel_id, &self.shared.liveness);
        debug!(handler_id = self.id(), data_channel_id = handle.id(), label = %options.label, "data channel opened");
        let channel = DataChannelParts {
            handle,
            label: options.label,
            protocol: options.protocol,
            sctp_stream_parameters: opened.sctp_stream_parameters,
            handler: self.clone(),
        };
        Ok(match (self.shared.direction, options.data_producer_id) {
            (Direction::Recv, Some(data_producer_id)) => DataChannel::Consumer(DataConsumer {
                channel,
                data_producer_id,
            }),
            _ => DataChannel::Producer(DataProducer { channel }),
        })
    }

    /// [`open_data_channel`](Self::open_data_channel) on a sending handler.
    pub async fn produce_data(&self, options: DataChannelOptions) -> Result<DataProducer> {
        self.ensure_direction(Direction::Send, "produce_data")?;
        match self.open_data_channel(options).await? {
            DataChannel::Producer(producer) => Ok(producer),
            DataChannel::Consumer(_) => Err(SessionError::WrongDirection {
                operation: "produce_data",
                direction: self.shared.direction,
            }),
        }
    }

    /// [`open_data_channel`](Self::open_data_channel) on a receiving handler.
    pub async fn consume_data(&self, options: DataChannelOptions) -> Result<DataConsumer> {
        self.ensure_direction(Direction::Recv, "consume_data")?;
        match self.open_data_channel(options).await? {
            DataChannel::Consumer(consumer) => Ok(consumer),
            DataChannel::Producer(_) => Err(SessionError::WrongDirection {
                operation: "consume_data",
                direction: self.shared.direction,
            }),
        }
    }

    pub async fn transport_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.request(methods::HANDLER_GET_TRANSPORT_STATS, json!({}))
            .await
    }

    pub async fn restart_ice(&self, ice_parameters: Value) -> Result<()> {
        self.ensure_open()?;
        self.request(
            methods::HANDLER_RESTART_ICE,
            json!({ "iceParameters": ice_parameters }),
        )
        .await?;
        Ok(())
    }

    /// Close the handler. Every handle it created is invalidated and later
    /// engine notifications for it are dropped. Idempotent.
    pub async fn close(&self) {
        if !self.shared.close_local() || self.shared.mux.is_closed() {
            return;
        }
        if let Err(err) = self
            .shared
            .mux
            .request(methods::HANDLER_CLOSE, Some(&self.shared.id), json!({}))
            .await
        {
            debug!(handler_id = self.id(), error = %err, "handler.close not acknowledged");
        }
    }

    fn track_state(&self, track_id: &str) -> ReadyState {
        lock(&self.shared.state)
            .track_states
            .get(track_id)
            .copied()
            .unwrap_or(ReadyState::Live)
    }

    fn sent_track(&self, mid: &str) -> Option<MediaTrack> {
        lock(&self.shared.state)
            .transceiver(mid)
            .ok()
            .and_then(|t| t.track.clone())
    }

    fn sent_track_id(&self, mid: &str) -> Option<String> {
        lock(&self.shared.state)
            .transceiver(mid)
            .ok()
            .and_then(|t| t.info().local_track_id)
    }

    fn local_id(&self, mid: &str) -> Option<String> {
        lock(&self.shared.state)
            .transceiver(mid)
            .ok()
            .map(|t| t.local_id.clone())
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

fn listen(
    shared: &Arc<HandlerShared>,
    event: &str,
    on_event: fn(&HandlerShared, &Value),
) -> Subscription {
    let weak = Arc::downgrade(shared);
    shared.mux.subscribe(&shared.id, event, move |data| {
        if let Some(shared) = weak.upgrade() {
            on_event(&shared, data);
        }
    })
}

/// Sending side of a transceiver.
#[derive(Debug, Clone)]
pub struct Producer {
    handle: RemoteHandle,
    mid: String,
    kind: MediaKind,
    rtp_parameters: Value,
    app_data: Option<Value>,
    handler: Handler,
}

impl Producer {
    /// Engine-assigned local id.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rtp_parameters(&self) -> &Value {
        &self.rtp_parameters
    }

    pub fn app_data(&self) -> Option<&Value> {
        self.app_data.as_ref()
    }

    /// Local track currently sent, if any. `None` for a forwarded track.
    pub fn track(&self) -> Option<MediaTrack> {
        self.handler.sent_track(&self.mid)
    }

    /// Id of the track currently sent, local or forwarded.
    pub fn track_id(&self) -> Option<String> {
        self.handler.sent_track_id(&self.mid)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn replace_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        self.handle.ensure_open("producer")?;
        self.handler.replace_track(&self.mid, track).await
    }

    pub async fn stats(&self) -> Result<Value> {
        self.handle.ensure_open("producer")?;
        let local_id = self.handler.local_id(&self.mid).unwrap_or_default();
        self.handler
            .request(methods::HANDLER_GET_SENDER_STATS, json!({ "localId": local_id }))
            .await
    }

    /// Stop sending. The track is stopped too when the producer was created
    /// with `stop_tracks`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        let detached = self.handler.detach_transceiver(&self.mid).await?;
        self.handle.close();
        if let Some((track, true)) = detached {
            track.stop().await?;
        }
        Ok(())
    }
}

/// Receiving side of a transceiver.
#[derive(Debug, Clone)]
pub struct Consumer {
    handle: RemoteHandle,
    producer_id: String,
    kind: MediaKind,
    mid: String,
    local_id: String,
    track_id: String,
    rtp_parameters: Value,
    app_data: Option<Value>,
    handler: Handler,
}

impl Consumer {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn rtp_parameters(&self) -> &Value {
        &self.rtp_parameters
    }

    pub fn app_data(&self) -> Option<&Value> {
        self.app_data.as_ref()
    }

    /// Readiness of the received track, driven by engine notifications.
    /// `Ended` once the consumer or its handler closed.
    pub fn track_state(&self) -> ReadyState {
        if self.handle.is_closed() {
            ReadyState::Ended
        } else {
            self.handler.track_state(&self.track_id)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn stats(&self) -> Result<Value> {
        self.handle.ensure_open("consumer")?;
        self.handler
            .request(
                methods::HANDLER_GET_RECEIVER_STATS,
                json!({ "localId": self.local_id }),
            )
            .await
    }

    /// Stop receiving. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handler.detach_transceiver(&self.mid).await?;
        self.handle.close();
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct DataChannelParts {
    handle: RemoteHandle,
    label: String,
    protocol: String,
    sctp_stream_parameters: Value,
    handler: Handler,
}

impl DataChannelParts {
    async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handler
            .request(
                methods::HANDLER_CLOSE_DATA_CHANNEL,
                json!({ "dataChannelId": self.handle.id() }),
            )
            .await?;
        self.handle.close();
        Ok(())
    }
}

/// A data channel opened by [`Handler::open_data_channel`].
#[derive(Debug, Clone)]
pub enum DataChannel {
    Producer(DataProducer),
    Consumer(DataConsumer),
}

impl DataChannel {
    pub fn id(&self) -> &str {
        match self {
            DataChannel::Producer(producer) => producer.id(),
            DataChannel::Consumer(consumer) => consumer.id(),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            DataChannel::Producer(producer) => producer.close().await,
            DataChannel::Consumer(consumer) => consumer.close().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataProducer {
    channel: DataChannelParts,
}

impl DataProducer {
    pub fn id(&self) -> &str {
        self.channel.handle.id()
    }

    pub fn label(&self) -> &str {
        &self.channel.label
    }

    pub fn protocol(&self) -> &str {
        &self.channel.protocol
    }

    pub fn sctp_stream_parameters(&self) -> &Value {
        &self.channel.sctp_stream_parameters
    }

    pub fn is_closed(&self) -> bool {
        self.channel.handle.is_closed()
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close().await
    }
}

#[derive(Debug, Clone)]
pub struct DataConsumer {
    channel: DataChannelParts,
    data_producer_id: String,
}

impl DataConsumer {
    pub fn id(&self) -> &str {
        self.channel.handle.id()
    }

    pub fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    pub fn label(&self) -> &str {
        &self.channel.label
    }

    pub fn protocol(&self) -> &str {
        &self.channel.protocol
    }

    pub fn sctp_stream_parameters(&self) -> &Value {
        &self.channel.sctp_stream_parameters
    }

    pub fn is_closed(&self) -> bool {
        self.channel.handle.is_closed()
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_states_map_to_connection_states() {
        use ConnectionState::*;

        assert_eq!(New.apply_ice_state("checking"), Some(Connecting));
        assert_eq!(Connecting.apply_ice_state("connected"), Some(Connected));
        assert_eq!(Connecting.apply_ice_state("completed"), Some(Connected));
        assert_eq!(Connected.apply_ice_state("disconnected"), Some(Disconnected));
        assert_eq!(Connected.apply_ice_state("failed"), Some(Disconnected));
        assert_eq!(Disconnected.apply_ice_state("connected"), Some(Connected));
    }

    #[test]
    fn ignored_and_repeated_ice_states_do_not_move() {
        use ConnectionState::*;

        assert_eq!(Connected.apply_ice_state("new"), None);
        assert_eq!(Connected.apply_ice_state("closed"), None);
        assert_eq!(Connected.apply_ice_state("connected"), None);
        assert_eq!(Connected.apply_ice_state("bogus"), None);
    }

    #[test]
    fn closed_is_terminal() {
        for ice in ["new", "checking", "connected", "completed", "disconnected", "failed"] {
            assert_eq!(ConnectionState::Closed.apply_ice_state(ice), None);
        }
    }

    #[test]
    fn handler_options_serialize_camel_case() {
        let options = HandlerOptions::new(Direction::Recv)
            .with_sctp_parameters(json!({ "port": 5000 }))
            .with_app_data(json!({ "baz": "BAZ" }));
        let value = serde_json::to_value(&options).unwrap();

        assert_eq!(value["direction"], "recv");
        assert_eq!(value["iceCandidates"], json!([]));
        assert_eq!(value["sctpParameters"]["port"], 5000);
        assert_eq!(value["appData"]["baz"], "BAZ");
    }

    #[test]
    fn data_channel_options_skip_absent_fields() {
        let options = DataChannelOptions {
            ordered: false,
            max_packet_life_time: Some(5555),
            ..DataChannelOptions::labeled("FOO", "BAR")
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(
            value,
            json!({
                "ordered": false,
                "maxPacketLifeTime": 5555,
                "label": "FOO",
                "protocol": "BAR"
            })
        );
    }

    #[test]
    fn stopped_transceiver_reports_no_track() {
        let transceiver = Transceiver {
            mid: "0".to_string(),
            kind: MediaKind::Video,
            direction: Direction::Recv,
            stopped: true,
            local_id: "l-0".to_string(),
            track: None,
            remote_track_id: Some("c-1".to_string()),
            stop_tracks: false,
        };
        let info = transceiver.info();
        assert!(info.stopped);
        assert_eq!(info.local_track_id, None);
        assert_eq!(info.mid, "0");
    }
}

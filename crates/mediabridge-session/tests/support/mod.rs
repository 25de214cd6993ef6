//! In-process engine used by the integration tests.
//!
//! Speaks the control protocol over an in-memory duplex pipe and keeps just
//! enough state to answer like the real engine does.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mediabridge_frame::{
    FrameConfig, FramedChannel, Inbound, Message, Notification, Request, Response,
};
use mediabridge_session::{Engine, EngineConfig};
use serde_json::{json, Value};
use tokio::io::{duplex, split};

pub const FAKE_PID: u32 = 4242;
pub const WAIT: Duration = Duration::from_secs(5);

/// Behaviour switches for the fake engine.
#[derive(Debug, Default, Clone)]
pub struct Knobs {
    /// Methods that are recorded but never answered.
    pub silent: HashSet<String>,
    /// Answer every `handler.send` with mid `0`.
    pub duplicate_mid: bool,
    /// Reject file origins with `UnsupportedSource`.
    pub unsupported_file: bool,
    /// Report every received track as ended before answering `handler.receive`.
    pub end_on_receive: bool,
    /// Methods whose reply is held back until the next request has been answered.
    pub hold: HashSet<String>,
}

#[derive(Debug, Clone)]
struct FakeTrack {
    id: String,
    kind: String,
    ended: bool,
}

#[derive(Debug, Clone)]
struct FakeTransceiver {
    mid: String,
    kind: String,
    local_id: String,
    track_id: Option<String>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct FakeHandler {
    direction: String,
    ice_state: String,
    next_mid: u32,
    data_mid: Option<String>,
    transceivers: Vec<FakeTransceiver>,
}

impl FakeHandler {
    fn allocate_mid(&mut self) -> String {
        let mid = self.next_mid.to_string();
        self.next_mid += 1;
        mid
    }
}

#[derive(Debug, Default)]
struct FakeState {
    knobs: Knobs,
    requests: Vec<Request>,
    next_id: u64,
    sources: BTreeMap<String, Vec<FakeTrack>>,
    handlers: BTreeMap<String, FakeHandler>,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

enum Reply {
    Ok(Value),
    Rejected(&'static str),
}

struct Outcome {
    before: Vec<Notification>,
    reply: Reply,
    close_after: bool,
}

impl Outcome {
    fn ok(data: Value) -> Self {
        Self {
            before: Vec::new(),
            reply: Reply::Ok(data),
            close_after: false,
        }
    }

    fn rejected(reason: &'static str) -> Self {
        Self {
            before: Vec::new(),
            reply: Reply::Rejected(reason),
            close_after: false,
        }
    }
}

/// Test-side handle to the running fake engine.
pub struct FakeEngine {
    channel: FramedChannel,
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.state()
            .requests
            .iter()
            .map(|request| request.method.clone())
            .collect()
    }

    pub fn last_request(&self, method: &str) -> Option<Request> {
        self.state()
            .requests
            .iter()
            .rev()
            .find(|request| request.method == method)
            .cloned()
    }

    pub async fn notify(&self, target: &str, event: &str, data: Value) {
        self.channel
            .send(
                Notification {
                    target_id: target.to_string(),
                    event: event.to_string(),
                    data,
                }
                .into(),
            )
            .await
            .expect("notification should be sent");
    }

    /// Drop the connection as if the engine died.
    pub async fn vanish(&self) {
        self.channel.close().await;
    }
}

pub fn start() -> (Engine, FakeEngine) {
    start_with(Knobs::default(), EngineConfig::default())
}

pub fn start_with(knobs: Knobs, config: EngineConfig) -> (Engine, FakeEngine) {
    let (host, remote) = duplex(256 * 1024);
    let (read, write) = split(host);
    let engine = Engine::attach(read, write, config);

    let (read, write) = split(remote);
    let (channel, inbound) = FramedChannel::open(read, write, FrameConfig::default());
    let state = Arc::new(Mutex::new(FakeState {
        knobs,
        ..FakeState::default()
    }));
    tokio::spawn(serve(channel.clone(), inbound, Arc::clone(&state)));

    (engine, FakeEngine { channel, state })
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold before the deadline");
}

async fn serve(channel: FramedChannel, mut inbound: Inbound, state: Arc<Mutex<FakeState>>) {
    let mut held: Vec<(u64, Outcome)> = Vec::new();
    while let Some(message) = inbound.recv().await {
        let Message::Request(request) = message else {
            continue;
        };
        let id = request.id;
        let (outcome, hold) = {
            let mut state = state.lock().unwrap();
            state.requests.push(request.clone());
            if state.knobs.silent.contains(&request.method) {
                continue;
            }
            let hold = state.knobs.hold.contains(&request.method);
            (answer(&mut state, &request), hold)
        };
        if hold {
            held.push((id, outcome));
            continue;
        }

        let close_after = outcome.close_after;
        if !deliver(&channel, id, outcome).await {
            return;
        }
        for (held_id, held_outcome) in held.drain(..) {
            if !deliver(&channel, held_id, held_outcome).await {
                return;
            }
        }
        if close_after {
            channel.close().await;
            return;
        }
    }
}

async fn deliver(channel: &FramedChannel, id: u64, outcome: Outcome) -> bool {
    for notification in outcome.before {
        if channel.send(notification.into()).await.is_err() {
            return false;
        }
    }
    let response = match outcome.reply {
        Reply::Ok(data) => Response::ok(id, data),
        Reply::Rejected(reason) => Response::error(id, reason, None),
    };
    channel.send(response.into()).await.is_ok()
}

fn target(request: &Request) -> String {
    request.target_id.clone().unwrap_or_default()
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn answer(state: &mut FakeState, request: &Request) -> Outcome {
    let data = &request.data;
    match request.method.as_str() {
        "dump" => Outcome::ok(dump(state)),
        "getUserMedia" => get_user_media(state, data),
        "getRtpCapabilities" => Outcome::ok(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ]
        })),
        "createHandler" => {
            let id = state.next("h");
            let direction = str_field(data, "direction").unwrap_or_default();
            state.handlers.insert(
                id.clone(),
                FakeHandler {
                    direction,
                    ice_state: "new".to_string(),
                    ..FakeHandler::default()
                },
            );
            Outcome::ok(json!({ "handlerId": id }))
        }
        "close" => Outcome {
            close_after: true,
            ..Outcome::ok(json!({}))
        },
        "source.stopTrack" => {
            let track_id = str_field(data, "trackId").unwrap_or_default();
            let Some(tracks) = state.sources.get_mut(&target(request)) else {
                return Outcome::rejected("NotFound");
            };
            match tracks.iter_mut().find(|track| track.id == track_id) {
                Some(track) => {
                    track.ended = true;
                    Outcome::ok(json!({}))
                }
                None => Outcome::rejected("NotFound"),
            }
        }
        "source.close" => match state.sources.remove(&target(request)) {
            Some(_) => Outcome::ok(json!({})),
            None => Outcome::rejected("NotFound"),
        },
        method if method.starts_with("handler.") => handler_call(state, request),
        _ => Outcome::rejected("UnknownMethod"),
    }
}

fn dump(state: &FakeState) -> Value {
    let sources: Vec<Value> = state
        .sources
        .iter()
        .map(|(id, tracks)| {
            let tracks: Vec<Value> = tracks
                .iter()
                .map(|track| {
                    json!({
                        "id": track.id,
                        "kind": track.kind,
                        "readyState": if track.ended { "ended" } else { "live" }
                    })
                })
                .collect();
            json!({ "id": id, "tracks": tracks })
        })
        .collect();
    let sessions: Vec<Value> = state
        .handlers
        .iter()
        .map(|(id, handler)| {
            let send: Vec<Value> = handler
                .transceivers
                .iter()
                .filter(|_| handler.direction == "send")
                .map(|t| json!({ "mid": t.mid, "localId": t.local_id }))
                .collect();
            let transceivers: Vec<Value> = handler
                .transceivers
                .iter()
                .map(|t| {
                    json!({
                        "mid": t.mid,
                        "kind": t.kind,
                        "stopped": t.stopped,
                        "sender": { "trackId": t.track_id }
                    })
                })
                .collect();
            json!({
                "id": id,
                "signalingState": "stable",
                "iceState": handler.ice_state,
                "sendTransceivers": send,
                "transceivers": transceivers
            })
        })
        .collect();
    json!({ "pid": FAKE_PID, "sources": sources, "sessions": sessions })
}

fn get_user_media(state: &mut FakeState, data: &Value) -> Outcome {
    let mut wanted = Vec::new();
    for kind in ["audio", "video"] {
        if let Some(spec) = data.get(kind) {
            if state.knobs.unsupported_file && str_field(spec, "source").as_deref() == Some("file") {
                return Outcome::rejected("UnsupportedSource");
            }
            wanted.push(kind);
        }
    }
    let source_id = state.next("s");
    let tracks: Vec<FakeTrack> = wanted
        .into_iter()
        .map(|kind| FakeTrack {
            id: state.next("t"),
            kind: kind.to_string(),
            ended: false,
        })
        .collect();
    let reply: Vec<Value> = tracks
        .iter()
        .map(|track| json!({ "id": track.id, "kind": track.kind, "readyState": "live" }))
        .collect();
    state.sources.insert(source_id.clone(), tracks);
    Outcome::ok(json!({ "sourceId": source_id, "tracks": reply }))
}

fn handler_call(state: &mut FakeState, request: &Request) -> Outcome {
    let data = &request.data;
    let handler_id = target(request);
    let duplicate_mid = state.knobs.duplicate_mid;
    let end_on_receive = state.knobs.end_on_receive;
    let local_id = state.next("l");
    let channel_id = state.next("dc");
    let Some(handler) = state.handlers.get_mut(&handler_id) else {
        return Outcome::rejected("NotFound");
    };

    match request.method.as_str() {
        "handler.setRemoteParameters" => {
            handler.ice_state = "checking".to_string();
            Outcome {
                before: vec![Notification {
                    target_id: handler_id,
                    event: "iceconnectionstatechange".to_string(),
                    data: json!({ "state": "checking" }),
                }],
                ..Outcome::ok(json!({ "dtlsParameters": { "role": "client", "fingerprints": [] } }))
            }
        }
        "handler.send" => {
            let mid = if duplicate_mid {
                "0".to_string()
            } else {
                handler.allocate_mid()
            };
            handler.transceivers.push(FakeTransceiver {
                mid: mid.clone(),
                kind: str_field(data, "kind").unwrap_or_default(),
                local_id: local_id.clone(),
                track_id: str_field(data, "trackId"),
                stopped: false,
            });
            Outcome::ok(json!({
                "localId": local_id,
                "rtpParameters": { "mid": mid, "codecs": [], "encodings": [{ "ssrc": 1111 }] }
            }))
        }
        "handler.receive" => {
            let mid = handler.allocate_mid();
            let track_id = str_field(data, "trackId");
            handler.transceivers.push(FakeTransceiver {
                mid: mid.clone(),
                kind: str_field(data, "kind").unwrap_or_default(),
                local_id: local_id.clone(),
                track_id: track_id.clone(),
                stopped: false,
            });
            let before = match (end_on_receive, track_id) {
                (true, Some(track_id)) => vec![Notification {
                    target_id: handler_id,
                    event: "trackstatechange".to_string(),
                    data: json!({ "trackId": track_id, "readyState": "ended" }),
                }],
                _ => Vec::new(),
            };
            Outcome {
                before,
                ..Outcome::ok(json!({ "localId": local_id, "mid": mid }))
            }
        }
        "handler.replaceTrack" => {
            let mid = str_field(data, "mid").unwrap_or_default();
            match handler.transceivers.iter_mut().find(|t| t.mid == mid) {
                Some(transceiver) => {
                    transceiver.track_id = str_field(data, "trackId");
                    Outcome::ok(json!({}))
                }
                None => Outcome::rejected("NotFound"),
            }
        }
        "handler.removeTransceiver" => {
            let mid = str_field(data, "mid").unwrap_or_default();
            match handler.transceivers.iter_mut().find(|t| t.mid == mid) {
                Some(transceiver) => {
                    transceiver.stopped = true;
                    transceiver.track_id = None;
                    Outcome::ok(json!({}))
                }
                None => Outcome::rejected("NotFound"),
            }
        }
        "handler.createDataChannel" => {
            let mid = match &handler.data_mid {
                Some(mid) => mid.clone(),
                None => {
                    let mid = handler.allocate_mid();
                    handler.data_mid = Some(mid.clone());
                    mid
                }
            };
            Outcome::ok(json!({
                "dataChannelId": channel_id,
                "sctpStreamParameters": {
                    "streamId": data.get("streamId").cloned().unwrap_or(json!(0)),
                    "ordered": data.get("ordered").cloned().unwrap_or(json!(true))
                },
                "mid": mid
            }))
        }
        "handler.closeDataChannel" | "handler.restartIce" => Outcome::ok(json!({})),
        "handler.getTransportStats" => Outcome::ok(json!([{ "type": "transport" }])),
        "handler.getSenderStats" => Outcome::ok(json!([{ "type": "outbound-rtp" }])),
        "handler.getReceiverStats" => Outcome::ok(json!([{ "type": "inbound-rtp" }])),
        "handler.close" => {
            state.handlers.remove(&handler_id);
            Outcome::ok(json!({}))
        }
        _ => Outcome::rejected("UnknownMethod"),
    }
}

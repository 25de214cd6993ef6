//! Method and event names understood by the engine.

/// Process-scoped: snapshot of sources and handlers.
pub const DUMP: &str = "dump";
/// Process-scoped: acquire a media source.
pub const GET_USER_MEDIA: &str = "getUserMedia";
/// Process-scoped: create a per-connection handler.
pub const CREATE_HANDLER: &str = "createHandler";
/// Process-scoped: native RTP capabilities of the engine.
pub const GET_RTP_CAPABILITIES: &str = "getRtpCapabilities";
/// Process-scoped: ask the engine to exit.
pub const CLOSE: &str = "close";

pub const SOURCE_STOP_TRACK: &str = "source.stopTrack";
pub const SOURCE_CLOSE: &str = "source.close";

pub const HANDLER_SET_REMOTE_PARAMETERS: &str = "handler.setRemoteParameters";
pub const HANDLER_SEND: &str = "handler.send";
pub const HANDLER_RECEIVE: &str = "handler.receive";
pub const HANDLER_REPLACE_TRACK: &str = "handler.replaceTrack";
pub const HANDLER_REMOVE_TRANSCEIVER: &str = "handler.removeTransceiver";
pub const HANDLER_CREATE_DATA_CHANNEL: &str = "handler.createDataChannel";
pub const HANDLER_CLOSE_DATA_CHANNEL: &str = "handler.closeDataChannel";
pub const HANDLER_GET_TRANSPORT_STATS: &str = "handler.getTransportStats";
pub const HANDLER_GET_SENDER_STATS: &str = "handler.getSenderStats";
pub const HANDLER_GET_RECEIVER_STATS: &str = "handler.getReceiverStats";
pub const HANDLER_RESTART_ICE: &str = "handler.restartIce";
pub const HANDLER_CLOSE: &str = "handler.close";

/// Handler notification: ICE connection state changed.
pub const EVENT_ICE_CONNECTION_STATE_CHANGE: &str = "iceconnectionstatechange";
/// Handler notification: signaling state changed.
pub const EVENT_SIGNALING_STATE_CHANGE: &str = "signalingstatechange";
/// Handler notification: a receiving track changed readiness.
pub const EVENT_TRACK_STATE_CHANGE: &str = "trackstatechange";

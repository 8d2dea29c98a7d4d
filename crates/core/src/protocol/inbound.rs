use serde::Deserialize;

use crate::session::session_config::ConfigProposal;

/// Events a client sends, framed as `{"event": ..., "data": ...}`.
///
/// Payload fields are optional so that a malformed event can still be
/// routed and answered with a scoped validation error.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Connect(ConnectPayload),
    Initialize(InitializePayload),
    Control(ControlPayload),
    VideoFrame(VideoFramePayload),
    Disconnect,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectPayload {
    pub token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InitializePayload {
    pub client_id: Option<String>,
    pub config: ConfigProposal,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlPayload {
    pub action: Option<String>,
    pub config: Option<ConfigProposal>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VideoFramePayload {
    pub frame_id: Option<u64>,
    pub timestamp: Option<f64>,
    pub resolution: Option<[u32; 2]>,
    pub data: Option<String>,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Initialize(_) => "initialize",
            Self::Control(_) => "control",
            Self::VideoFrame(_) => "video_frame",
            Self::Disconnect => "disconnect",
        }
    }

    /// Frame id an error about this event should be scoped to.
    pub fn frame_id(&self) -> Option<u64> {
        match self {
            Self::VideoFrame(p) => p.frame_id,
            _ => None,
        }
    }
}

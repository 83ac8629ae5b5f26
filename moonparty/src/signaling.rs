//! WebSocket signaling envelope shared with the browser client.
//!
//! Everything rides one JSON-tagged enum per direction. Input events are
//! part of the same envelope and are re-used as the payload of routed input
//! packets on their way to the upstream host.

use serde::{Deserialize, Serialize};

use crate::session::{InputKind, Peer};

/// SDP description as the browser hands it over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcSessionDescription {
    #[serde(rename = "type")]
    pub ty: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcIceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// Tagged with its own key so it nests inside the `type`-tagged envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalingMessage {
    Description(RtcSessionDescription),
    AddIceCandidate(RtcIceCandidate),
}

/// One input event from a browser peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove {
        delta_x: i16,
        delta_y: i16,
    },
    MousePosition {
        x: i16,
        y: i16,
        width: i16,
        height: i16,
    },
    MouseButton {
        button: u8,
        down: bool,
    },
    Scroll {
        amount: i16,
    },
    HScroll {
        amount: i16,
    },
    Key {
        code: i16,
        down: bool,
        modifiers: u8,
    },
    Text {
        text: String,
    },
    Gamepad {
        buttons: i32,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    },
    Touch {
        event_type: u8,
        pointer_id: u32,
        x: f32,
        y: f32,
        pressure: f32,
        contact_area_major: f32,
        contact_area_minor: f32,
        rotation: u16,
    },
    Pen {
        event_type: u8,
        tool_type: u8,
        buttons: u8,
        x: f32,
        y: f32,
        pressure: f32,
        contact_area_major: f32,
        contact_area_minor: f32,
        rotation: u16,
        tilt: u8,
    },
    Motion {
        motion_type: u8,
        x: f32,
        y: f32,
        z: f32,
    },
    Battery {
        state: u8,
        percentage: u8,
    },
}

impl InputEvent {
    /// Permission class for the session arbiter.
    pub fn kind(&self) -> InputKind {
        match self {
            Self::MouseMove { .. } | Self::MousePosition { .. } | Self::MouseButton { .. } => {
                InputKind::Mouse
            }
            Self::Scroll { .. } | Self::HScroll { .. } => InputKind::Scroll,
            Self::Key { .. } => InputKind::Keyboard,
            Self::Text { .. } => InputKind::Text,
            Self::Gamepad { .. } => InputKind::Gamepad,
            Self::Touch { .. } => InputKind::Touch,
            Self::Pen { .. } => InputKind::Pen,
            Self::Motion { .. } => InputKind::Motion,
            Self::Battery { .. } => InputKind::Battery,
        }
    }
}

/// Browser -> bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on the socket. The first joiner becomes the Host.
    Join { name: String },
    Signaling { payload: SignalingMessage },
    Input(InputEvent),
    /// Host-only roster operations.
    Promote { peer_id: String },
    Demote { peer_id: String },
    SetKeyboard { peer_id: String, enabled: bool },
}

/// Bridge -> browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        session_id: String,
        peer: Peer,
    },
    Roster {
        peers: Vec<Peer>,
    },
    Signaling {
        payload: SignalingMessage,
    },
    StageStarting {
        stage: String,
    },
    StageComplete {
        stage: String,
    },
    StageFailed {
        stage: String,
        error: String,
    },
    ConnectionStarted,
    ConnectionTerminated {
        error_code: i32,
    },
    ConnectionStatus {
        status: String,
    },
    Hdr {
        enabled: bool,
    },
    Rumble {
        controller: u16,
        low_freq: u16,
        high_freq: u16,
    },
    RumbleTriggers {
        controller: u16,
        left: u16,
        right: u16,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_events_deserialize_from_browser_json() {
        let event: InputEvent = serde_json::from_str(
            r#"{"kind":"key","code":65,"down":true,"modifiers":2}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            InputEvent::Key {
                code: 65,
                down: true,
                modifiers: 2
            }
        ));
        assert_eq!(event.kind(), InputKind::Keyboard);

        let event: InputEvent = serde_json::from_str(
            r#"{"kind":"gamepad","buttons":4096,"left_trigger":0,"right_trigger":255,
               "left_stick_x":0,"left_stick_y":0,"right_stick_x":-100,"right_stick_y":100}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), InputKind::Gamepad);
    }

    #[test]
    fn client_envelope_round_trips() {
        let message = ClientMessage::Input(InputEvent::Scroll { amount: 120 });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"input""#));
        assert!(json.contains(r#""kind":"scroll""#));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            ClientMessage::Input(InputEvent::Scroll { amount: 120 })
        ));
    }

    #[test]
    fn server_messages_tag_cleanly() {
        let json = serde_json::to_string(&ServerMessage::StageStarting {
            stage: "RTSP handshake".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"stage_starting""#));
    }
}

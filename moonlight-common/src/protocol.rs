//! Wire protocol constants: packet magics, control packet-type tables,
//! channel ids and the netfloat encoding shared by the Sunshine input
//! extensions.

/// RTP header layout: `header, packet_type, seq(BE u16), ts(BE u32), ssrc(BE u32)`.
pub const RTP_HEADER_SIZE: usize = 12;
/// RTP header with a possible extension word.
pub const MAX_RTP_HEADER_SIZE: usize = 16;

/// Video encryption preamble: `IV(12) || tag(16)`.
pub const ENC_VIDEO_HEADER_SIZE: usize = 28;
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// Default UDP ports applied when a SETUP response omits a Transport port.
pub const DEFAULT_VIDEO_PORT: u16 = 47998;
pub const DEFAULT_CONTROL_PORT: u16 = 47999;
pub const DEFAULT_AUDIO_PORT: u16 = 48000;
pub const DEFAULT_RTSP_PORT: u16 = 48010;
pub const DEFAULT_HTTP_PORT: u16 = 47989;
pub const DEFAULT_HTTPS_PORT: u16 = 47984;

// Colorspace selectors carried in the SDP offer.
pub const COLORSPACE_REC_601: u32 = 0;
pub const COLORSPACE_REC_709: u32 = 1;
pub const COLORSPACE_REC_2020: u32 = 2;

// Input packet magic numbers. The "gen5" variants apply to hosts with
// appversion major >= 5.
pub const KEYBOARD_MAGIC_DOWN: u32 = 0x03;
pub const KEYBOARD_MAGIC_UP: u32 = 0x04;
pub const MOUSE_MOVE_REL_MAGIC: u32 = 0x06;
pub const MOUSE_MOVE_REL_MAGIC_GEN5: u32 = 0x07;
pub const MOUSE_MOVE_ABS_MAGIC: u32 = 0x05;
pub const MOUSE_BUTTON_DOWN_MAGIC: u32 = 0x07;
pub const MOUSE_BUTTON_UP_MAGIC: u32 = 0x08;
pub const SCROLL_MAGIC: u32 = 0x09;
pub const SCROLL_MAGIC_GEN5: u32 = 0x0A;
pub const CONTROLLER_MAGIC: u32 = 0x0D;
pub const MULTI_CONTROLLER_MAGIC: u32 = 0x0E;
pub const MULTI_CONTROLLER_MAGIC_GEN5: u32 = 0x1E;
pub const ENABLE_HAPTICS_MAGIC: u32 = 0x55;
pub const UTF8_TEXT_EVENT_MAGIC: u32 = 0x56;

// Sunshine input extensions.
pub const SS_HSCROLL_MAGIC: u32 = 0x57;
pub const SS_TOUCH_MAGIC: u32 = 0x58;
pub const SS_PEN_MAGIC: u32 = 0x59;
pub const SS_CONTROLLER_ARRIVAL_MAGIC: u32 = 0x5A;
pub const SS_CONTROLLER_TOUCH_MAGIC: u32 = 0x5B;
pub const SS_CONTROLLER_MOTION_MAGIC: u32 = 0x5C;
pub const SS_CONTROLLER_BATTERY_MAGIC: u32 = 0x5D;

// Fixed fields of the multi-controller packet body.
pub const MULTI_CONTROLLER_HEADER_B: u16 = 0x001C;
pub const MULTI_CONTROLLER_MID_B: u16 = 0x0014;
pub const MULTI_CONTROLLER_TAIL_A: u16 = 0x0000;
pub const MULTI_CONTROLLER_TAIL_B: u16 = 0x0014;

// Gamepad button flags (low 16 bits).
pub const BUTTON_UP: u32 = 0x0001;
pub const BUTTON_DOWN: u32 = 0x0002;
pub const BUTTON_LEFT: u32 = 0x0004;
pub const BUTTON_RIGHT: u32 = 0x0008;
pub const BUTTON_START: u32 = 0x0010;
pub const BUTTON_BACK: u32 = 0x0020;
pub const BUTTON_LEFT_STICK: u32 = 0x0040;
pub const BUTTON_RIGHT_STICK: u32 = 0x0080;
pub const BUTTON_LEFT_BUMPER: u32 = 0x0100;
pub const BUTTON_RIGHT_BUMPER: u32 = 0x0200;
pub const BUTTON_HOME: u32 = 0x0400;
pub const BUTTON_A: u32 = 0x1000;
pub const BUTTON_B: u32 = 0x2000;
pub const BUTTON_X: u32 = 0x4000;
pub const BUTTON_Y: u32 = 0x8000;

// Extended button flags (Sunshine only, high 16 bits).
pub const BUTTON_MISC: u32 = 0x010000;
pub const BUTTON_PADDLE1: u32 = 0x020000;
pub const BUTTON_PADDLE2: u32 = 0x040000;
pub const BUTTON_PADDLE3: u32 = 0x080000;
pub const BUTTON_PADDLE4: u32 = 0x100000;
pub const BUTTON_TOUCHPAD: u32 = 0x200000;

// Keyboard actions and modifier bits.
pub const KEY_ACTION_DOWN: u8 = 0x03;
pub const KEY_ACTION_UP: u8 = 0x04;
pub const MODIFIER_SHIFT: u8 = 0x01;
pub const MODIFIER_CTRL: u8 = 0x02;
pub const MODIFIER_ALT: u8 = 0x04;
pub const MODIFIER_META: u8 = 0x08;

// Mouse buttons and actions.
pub const MOUSE_BUTTON_LEFT: u8 = 0x01;
pub const MOUSE_BUTTON_MIDDLE: u8 = 0x02;
pub const MOUSE_BUTTON_RIGHT: u8 = 0x03;
pub const MOUSE_BUTTON_X1: u8 = 0x04;
pub const MOUSE_BUTTON_X2: u8 = 0x05;
pub const MOUSE_ACTION_PRESS: u8 = 0x07;
pub const MOUSE_ACTION_RELEASE: u8 = 0x08;

// Touch event types (Sunshine).
pub const TOUCH_EVENT_HOVER: u8 = 0;
pub const TOUCH_EVENT_DOWN: u8 = 1;
pub const TOUCH_EVENT_UP: u8 = 2;
pub const TOUCH_EVENT_MOVE: u8 = 3;
pub const TOUCH_EVENT_CANCEL: u8 = 4;
pub const TOUCH_EVENT_CANCEL_ALL: u8 = 5;
pub const TOUCH_EVENT_HOVER_LEAVE: u8 = 6;
pub const TOUCH_EVENT_BUTTON_ONLY: u8 = 7;

// Pen tools and buttons (Sunshine).
pub const PEN_TOOL_UNKNOWN: u8 = 0;
pub const PEN_TOOL_PEN: u8 = 1;
pub const PEN_TOOL_ERASER: u8 = 2;
pub const PEN_BUTTON_PRIMARY: u8 = 0x01;
pub const PEN_BUTTON_SECONDARY: u8 = 0x02;
pub const PEN_BUTTON_TERTIARY: u8 = 0x04;

// Battery states (Sunshine).
pub const BATTERY_STATE_UNKNOWN: u8 = 0x00;
pub const BATTERY_STATE_NOT_PRESENT: u8 = 0x01;
pub const BATTERY_STATE_DISCHARGING: u8 = 0x02;
pub const BATTERY_STATE_CHARGING: u8 = 0x03;
pub const BATTERY_STATE_NOT_CHARGING: u8 = 0x04;
pub const BATTERY_STATE_FULL: u8 = 0x05;

/// Windows WHEEL_DELTA; legacy GFE expects one scroll event per full notch.
pub const WHEEL_DELTA: i32 = 120;

// Reliable-datagram packet flags (ENet semantics).
pub const PACKET_FLAG_RELIABLE: u32 = 1 << 0;
pub const PACKET_FLAG_UNSEQUENCED: u32 = 1 << 1;

// Control stream channel ids.
pub const CTRL_CHANNEL_GENERIC: u8 = 0;
pub const CTRL_CHANNEL_URGENT: u8 = 1;
pub const CTRL_CHANNEL_KEYBOARD: u8 = 2;
pub const CTRL_CHANNEL_MOUSE: u8 = 3;
/// Channels 4..19 carry gamepads 0..15.
pub const CTRL_CHANNEL_GAMEPAD_BASE: u8 = 4;
/// Channels 20..35 carry motion sensors 0..15.
pub const CTRL_CHANNEL_SENSOR_BASE: u8 = 20;
pub const CTRL_CHANNEL_TOUCH: u8 = 36;
pub const CTRL_CHANNEL_PEN: u8 = 37;
pub const CTRL_CHANNEL_UTF8: u8 = 38;
pub const CTRL_CHANNEL_COUNT: u8 = 39;

/// Named control message types. Tables are version-keyed; lookups go through
/// [`PacketTypes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    StartA,
    StartB,
    RequestIdr,
    InvalidateRefFrames,
    LossStats,
    FrameStats,
    InputData,
    RumbleData,
    RumbleTriggers,
    Termination,
    HdrMode,
    SetMotionEvent,
    SetRgbLed,
    SetAdaptiveTriggers,
    PeriodicPing,
}

/// A read-only packet-type table for one host generation.
#[derive(Debug, Clone, Copy)]
pub struct PacketTypes {
    entries: &'static [(ControlMessage, u16)],
}

impl PacketTypes {
    /// Wire type for an outgoing message, if this generation defines one.
    pub fn get(&self, message: ControlMessage) -> Option<u16> {
        self.entries
            .iter()
            .find(|(m, _)| *m == message)
            .map(|(_, t)| *t)
    }

    /// Reverse lookup for dispatching received packets.
    pub fn message_for(&self, packet_type: u16) -> Option<ControlMessage> {
        self.entries
            .iter()
            .find(|(_, t)| *t == packet_type)
            .map(|(m, _)| *m)
    }
}

/// Gen 7 encrypted-control table (GFE >= 7.1.431 and Sunshine).
pub const PACKET_TYPES_GEN7_ENC: PacketTypes = PacketTypes {
    entries: &[
        (ControlMessage::StartA, 0x0305),
        (ControlMessage::StartB, 0x0307),
        (ControlMessage::RequestIdr, 0x0302),
        (ControlMessage::InvalidateRefFrames, 0x0301),
        (ControlMessage::LossStats, 0x0201),
        (ControlMessage::FrameStats, 0x0204),
        (ControlMessage::InputData, 0x0206),
        (ControlMessage::RumbleData, 0x010B),
        (ControlMessage::Termination, 0x0109),
        (ControlMessage::HdrMode, 0x010E),
        (ControlMessage::RumbleTriggers, 0x5500),
        (ControlMessage::SetMotionEvent, 0x5501),
        (ControlMessage::SetRgbLed, 0x5502),
        (ControlMessage::SetAdaptiveTriggers, 0x5503),
        (ControlMessage::PeriodicPing, 0x0200),
    ],
};

/// Encode a float the way the Sunshine extensions carry it on the wire:
/// IEEE-754 single precision, little-endian.
pub fn float_to_netfloat(value: f32) -> [u8; 4] {
    value.to_bits().to_le_bytes()
}

pub fn netfloat_to_float(bytes: [u8; 4]) -> f32 {
    f32::from_bits(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netfloat_round_trips_finite_values() {
        for value in [0.0f32, -0.0, 1.0, -1.5, 0.333, f32::MAX, f32::MIN_POSITIVE] {
            let wire = float_to_netfloat(value);
            assert_eq!(float_to_netfloat(netfloat_to_float(wire)), wire);
        }
    }

    #[test]
    fn packet_type_lookup_both_directions() {
        let table = PACKET_TYPES_GEN7_ENC;
        assert_eq!(table.get(ControlMessage::RequestIdr), Some(0x0302));
        assert_eq!(table.message_for(0x0109), Some(ControlMessage::Termination));
        assert_eq!(table.message_for(0x7777), None);
    }

    #[test]
    fn gamepad_channels_do_not_collide_with_sensors() {
        assert!(CTRL_CHANNEL_GAMEPAD_BASE + 15 < CTRL_CHANNEL_SENSOR_BASE);
        assert!(CTRL_CHANNEL_SENSOR_BASE + 15 < CTRL_CHANNEL_TOUCH);
    }
}

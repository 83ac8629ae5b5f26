//! Glue between the protocol core and the WebRTC fan-out: implements the
//! core's listener, decoder and audio surfaces, and pumps permitted input
//! from the session arbiter into the upstream input assembler.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use moonlight_common::error::MoonlightError;
use moonlight_common::input::InputStream;
use moonlight_common::protocol;
use moonlight_common::types::{
    AudioConfiguration, AudioRenderer, ConnectionListener, ConnectionStatus, DecodeUnit,
    FrameType, HdrMetadata, MotionType, OpusConfig, Stage, VideoDecoder, VideoFormat,
};

use crate::broadcaster::{AudioSample, Broadcaster, VideoFrame};
use crate::session::{InputPacket, Session};
use crate::signaling::{InputEvent, ServerMessage};

/// Implements the core's callback surfaces and owns the media broadcasters.
pub struct StreamBridge {
    pub video: Broadcaster<VideoFrame>,
    pub audio: Broadcaster<AudioSample>,
    events: broadcast::Sender<ServerMessage>,
    /// 48 kHz RTP clock for outgoing audio.
    audio_clock: std::sync::atomic::AtomicU32,
    audio_samples_per_frame: std::sync::atomic::AtomicU32,
}

impl StreamBridge {
    pub fn new(events: broadcast::Sender<ServerMessage>) -> Arc<Self> {
        Arc::new(Self {
            video: Broadcaster::new(),
            audio: Broadcaster::new(),
            events,
            audio_clock: std::sync::atomic::AtomicU32::new(0),
            audio_samples_per_frame: std::sync::atomic::AtomicU32::new(240),
        })
    }

    fn publish(&self, message: ServerMessage) {
        // No receivers is fine; peers subscribe as they connect.
        let _ = self.events.send(message);
    }
}

impl VideoDecoder for StreamBridge {
    fn setup(&self, format: VideoFormat, width: u32, height: u32, fps: u32) {
        info!("[Bridge]: video setup {format:?} {width}x{height}@{fps}");
    }

    fn submit_decode_unit(&self, unit: DecodeUnit) -> i32 {
        self.video.broadcast(VideoFrame {
            payload: unit.payload,
            timestamp: (unit.presentation_time_ms as u32).wrapping_mul(90),
            is_idr: unit.frame_type == FrameType::Idr,
        });
        0
    }
}

impl AudioRenderer for StreamBridge {
    fn init(&self, config: AudioConfiguration, opus: &OpusConfig) {
        info!(
            "[Bridge]: audio init {:?} ({} Hz, {} samples/frame)",
            config, opus.sample_rate, opus.samples_per_frame
        );
        self.audio_samples_per_frame
            .store(opus.samples_per_frame as u32, Ordering::Relaxed);
    }

    fn play_sample(&self, sample: Option<Bytes>) {
        // The RTP clock advances even for concealed packets so downstream
        // timing stays honest; only real samples carry payload bytes.
        let step = self.audio_samples_per_frame.load(Ordering::Relaxed);
        let timestamp = self.audio_clock.fetch_add(step, Ordering::Relaxed);
        if let Some(payload) = sample {
            self.audio.broadcast(AudioSample { payload, timestamp });
        }
    }
}

impl ConnectionListener for StreamBridge {
    fn stage_starting(&self, stage: Stage) {
        debug!("[Bridge]: stage starting: {stage}");
        self.publish(ServerMessage::StageStarting {
            stage: stage.to_string(),
        });
    }

    fn stage_complete(&self, stage: Stage) {
        debug!("[Bridge]: stage complete: {stage}");
        self.publish(ServerMessage::StageComplete {
            stage: stage.to_string(),
        });
    }

    fn stage_failed(&self, stage: Stage, error: &MoonlightError) {
        warn!("[Bridge]: stage failed: {stage}: {error}");
        self.publish(ServerMessage::StageFailed {
            stage: stage.to_string(),
            error: error.to_string(),
        });
    }

    fn connection_started(&self) {
        info!("[Bridge]: upstream connection started");
        self.publish(ServerMessage::ConnectionStarted);
    }

    fn connection_terminated(&self, error_code: i32) {
        warn!("[Bridge]: upstream connection terminated ({error_code})");
        self.publish(ServerMessage::ConnectionTerminated { error_code });
    }

    fn connection_status_update(&self, status: ConnectionStatus) {
        self.publish(ServerMessage::ConnectionStatus {
            status: match status {
                ConnectionStatus::Okay => "okay".into(),
                ConnectionStatus::Poor => "poor".into(),
            },
        });
    }

    fn set_hdr_mode(&self, enabled: bool, _metadata: Option<HdrMetadata>) {
        self.publish(ServerMessage::Hdr { enabled });
    }

    fn rumble(&self, controller: u16, low_freq: u16, high_freq: u16) {
        self.publish(ServerMessage::Rumble {
            controller,
            low_freq,
            high_freq,
        });
    }

    fn rumble_triggers(&self, controller: u16, left: u16, right: u16) {
        self.publish(ServerMessage::RumbleTriggers {
            controller,
            left,
            right,
        });
    }

    fn set_motion_event_state(&self, controller: u16, motion: MotionType, report_rate_hz: u16) {
        debug!("[Bridge]: motion events {motion:?} at {report_rate_hz} Hz for pad {controller}");
    }

    fn set_controller_led(&self, controller: u16, r: u8, g: u8, b: u8) {
        debug!("[Bridge]: LED #{controller} -> {r},{g},{b}");
    }
}

/// Drain the session's permitted-input queue into the input assembler until
/// the session ends. Each packet already carries the sender's gamepad slot.
pub async fn run_input_pump(session: Arc<Session>, input: Arc<InputStream>) {
    let Some(mut queue) = session.take_input_channel() else {
        warn!("[Bridge]: input queue already taken");
        return;
    };
    let token = session.cancellation();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            packet = queue.recv() => {
                let Some(packet) = packet else { return };
                forward_input(&input, packet);
            }
        }
    }
}

fn forward_input(input: &InputStream, packet: InputPacket) {
    let slot = packet.slot.max(0);
    let result = match packet.event {
        InputEvent::MouseMove { delta_x, delta_y } => input.send_mouse_move(delta_x, delta_y),
        InputEvent::MousePosition {
            x,
            y,
            width,
            height,
        } => input.send_mouse_position(x, y, width, height),
        InputEvent::MouseButton { button, down } => input.send_mouse_button(
            if down {
                protocol::MOUSE_ACTION_PRESS
            } else {
                protocol::MOUSE_ACTION_RELEASE
            },
            button,
        ),
        InputEvent::Scroll { amount } => input.send_scroll(amount),
        InputEvent::HScroll { amount } => input.send_hscroll(amount),
        InputEvent::Key {
            code,
            down,
            modifiers,
        } => input.send_keyboard(
            code,
            if down {
                protocol::KEY_ACTION_DOWN
            } else {
                protocol::KEY_ACTION_UP
            },
            modifiers,
            0,
        ),
        InputEvent::Text { text } => input.send_utf8_text(&text),
        InputEvent::Gamepad {
            buttons,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        } => input.send_multi_controller(
            slot as i16,
            1 << slot,
            buttons,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        ),
        InputEvent::Touch {
            event_type,
            pointer_id,
            x,
            y,
            pressure,
            contact_area_major,
            contact_area_minor,
            rotation,
        } => input.send_touch(
            event_type,
            pointer_id,
            x,
            y,
            pressure,
            contact_area_major,
            contact_area_minor,
            rotation,
        ),
        InputEvent::Pen {
            event_type,
            tool_type,
            buttons,
            x,
            y,
            pressure,
            contact_area_major,
            contact_area_minor,
            rotation,
            tilt,
        } => input.send_pen(
            event_type,
            tool_type,
            buttons,
            x,
            y,
            pressure,
            contact_area_major,
            contact_area_minor,
            rotation,
            tilt,
        ),
        InputEvent::Motion {
            motion_type,
            x,
            y,
            z,
        } => match MotionType::from_wire(motion_type) {
            Some(motion) => input.send_controller_motion(slot as u8, motion, x, y, z),
            None => Ok(()),
        },
        InputEvent::Battery { state, percentage } => {
            input.send_controller_battery(slot as u8, state, percentage)
        }
    };

    if let Err(err) = result {
        debug!("[Bridge]: input from {} not sent: {err}", packet.peer_id);
    }
}

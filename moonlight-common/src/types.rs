//! Shared types for the streaming protocol: configuration, server
//! information, connection stages, statistics and the callback surfaces the
//! embedding application implements.

use std::time::Instant;

use bytes::Bytes;

use crate::protocol;

bitflags::bitflags! {
    /// Codec support advertised by the client, negotiated against the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SupportedVideoFormats: u32 {
        const H264 = 0x0001;
        const H265 = 0x0100;
        const AV1 = 0x0200;
    }
}

/// The single format picked during SDP negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    H264,
    H265,
    Av1,
}

bitflags::bitflags! {
    /// Per-stream encryption advertised by the host (Sunshine `SS_ENC_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncryptionFlags: u32 {
        const CONTROL_V2 = 0x01;
        const VIDEO = 0x02;
        const AUDIO = 0x04;
    }
}

/// Audio channel layout requested for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioConfiguration {
    Stereo,
    Surround51,
    Surround71,
    Surround51HighQuality,
    Surround71HighQuality,
}

impl AudioConfiguration {
    pub fn channel_count(self) -> usize {
        match self {
            Self::Stereo => 2,
            Self::Surround51 | Self::Surround51HighQuality => 6,
            Self::Surround71 | Self::Surround71HighQuality => 8,
        }
    }

    /// Wire encoding: `(mask << 16) | (channels << 8) | 0xCA`.
    pub fn surround_info(self) -> u32 {
        let (channels, mask) = match self {
            Self::Stereo => (2u32, 0x3u32),
            Self::Surround51 | Self::Surround51HighQuality => (6, 0x3F),
            Self::Surround71 | Self::Surround71HighQuality => (8, 0x63F),
        };
        (mask << 16) | (channels << 8) | 0xCA
    }
}

/// Everything the client needs to set up one streaming session.
#[derive(Debug, Clone)]
pub struct StreamConfiguration {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in kbps.
    pub bitrate: u32,
    pub packet_size: usize,
    pub streaming_remotely: bool,
    pub audio_configuration: AudioConfiguration,
    pub supported_video_formats: SupportedVideoFormats,

    /// 16-byte remote-input AES key, fresh per session.
    pub remote_input_aes_key: [u8; 16],
    /// 16-byte IV; the first 4 bytes are the big-endian key id.
    pub remote_input_aes_iv: [u8; 16],

    pub color_space: u32,
    pub color_range_full: bool,
    pub color_depth: u32,
    pub hdr_enabled: bool,

    pub encryption_flags: EncryptionFlags,
    pub audio_encryption: bool,
}

impl StreamConfiguration {
    /// The big-endian key id embedded in the first 4 IV bytes.
    pub fn ri_key_id(&self) -> u32 {
        u32::from_be_bytes([
            self.remote_input_aes_iv[0],
            self.remote_input_aes_iv[1],
            self.remote_input_aes_iv[2],
            self.remote_input_aes_iv[3],
        ])
    }
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate: 20_000,
            packet_size: 1024,
            streaming_remotely: false,
            audio_configuration: AudioConfiguration::Stereo,
            supported_video_formats: SupportedVideoFormats::H264,
            remote_input_aes_key: [0; 16],
            remote_input_aes_iv: [0; 16],
            color_space: protocol::COLORSPACE_REC_709,
            color_range_full: false,
            color_depth: 8,
            hdr_enabled: false,
            encryption_flags: EncryptionFlags::empty(),
            audio_encryption: false,
        }
    }
}

/// Details about the upstream host, gathered from `/serverinfo` and the
/// launch response.
#[derive(Debug, Clone, Default)]
pub struct ServerInformation {
    pub address: String,
    pub app_version: String,
    pub server_codec_mode_support: u32,
    /// `sessionUrl0` from `/launch`, e.g. `rtsp://10.0.0.2:48010`.
    pub rtsp_session_url: Option<String>,
}

impl ServerInformation {
    /// Parse the dotted version string into a `(major, minor, build, patch)`
    /// tuple. Non-numeric suffixes on a component are stripped.
    pub fn version_tuple(&self) -> [u32; 4] {
        let mut out = [0u32; 4];
        for (i, part) in self.app_version.split('.').take(4).enumerate() {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            out[i] = digits.parse().unwrap_or(0);
        }
        out
    }

    pub fn is_sunshine(&self) -> bool {
        self.app_version.to_lowercase().contains("sunshine")
    }
}

/// Compare a version tuple against `major.minor.build`.
pub fn version_at_least(v: [u32; 4], major: u32, minor: u32, build: u32) -> bool {
    if v[0] != major {
        return v[0] > major;
    }
    if v[1] != minor {
        return v[1] > minor;
    }
    v[2] >= build
}

/// Ordered connection stages driven by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    None,
    PlatformInit,
    RtspHandshake,
    ControlStreamInit,
    VideoStreamInit,
    AudioStreamInit,
    InputStreamInit,
    ControlStreamStart,
    VideoStreamStart,
    AudioStreamStart,
    InputStreamStart,
    Complete,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::PlatformInit => "platform initialization",
            Self::RtspHandshake => "RTSP handshake",
            Self::ControlStreamInit => "control stream initialization",
            Self::VideoStreamInit => "video stream initialization",
            Self::AudioStreamInit => "audio stream initialization",
            Self::InputStreamInit => "input stream initialization",
            Self::ControlStreamStart => "control stream start",
            Self::VideoStreamStart => "video stream start",
            Self::AudioStreamStart => "audio stream start",
            Self::InputStreamStart => "input stream start",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Connection quality reported through the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Okay,
    Poor,
}

/// HDR display metadata carried by Sunshine's HDRMode message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrMetadata {
    pub display_primaries: [Chromaticity; 3],
    pub white_point: Chromaticity,
    pub max_display_luminance: u16,
    pub min_display_luminance: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chromaticity {
    pub x: u16,
    pub y: u16,
}

/// Opus decoder configuration derived from the SDP answer.
#[derive(Debug, Clone)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channel_count: usize,
    pub streams: usize,
    pub coupled_streams: usize,
    pub samples_per_frame: usize,
    pub channel_mapping: Vec<u8>,
}

impl OpusConfig {
    pub fn stereo(packet_duration_ms: u32) -> Self {
        Self {
            sample_rate: 48_000,
            channel_count: 2,
            streams: 1,
            coupled_streams: 1,
            samples_per_frame: (48 * packet_duration_ms) as usize,
            channel_mapping: vec![0, 1],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Idr,
    PFrames,
}

/// One reassembled video frame handed to the decoder.
#[derive(Debug, Clone)]
pub struct DecodeUnit {
    pub frame_number: u32,
    pub frame_type: FrameType,
    pub payload: Bytes,
    /// Reassembly latency for this frame, in milliseconds.
    pub enqueue_time_ms: u64,
    pub presentation_time_ms: u64,
}

/// Video pipeline statistics, updated under the stream's lock.
#[derive(Debug, Clone)]
pub struct VideoStats {
    pub received_packets: u32,
    pub dropped_packets: u32,
    pub recovered_packets: u32,
    pub received_frames: u32,
    pub dropped_frames: u32,
    pub network_dropped_frames: u32,
    pub submitted_frames: u32,
    pub requested_idr_frames: u32,
    pub total_reassembly_time_ms: u32,
    pub measurement_start: Instant,
}

impl Default for VideoStats {
    fn default() -> Self {
        Self {
            received_packets: 0,
            dropped_packets: 0,
            recovered_packets: 0,
            received_frames: 0,
            dropped_frames: 0,
            network_dropped_frames: 0,
            submitted_frames: 0,
            requested_idr_frames: 0,
            total_reassembly_time_ms: 0,
            measurement_start: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioStats {
    pub received_packets: u32,
    pub dropped_packets: u32,
    pub measurement_start: Instant,
}

impl Default for AudioStats {
    fn default() -> Self {
        Self {
            received_packets: 0,
            dropped_packets: 0,
            measurement_start: Instant::now(),
        }
    }
}

/// Controller motion sensor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionType {
    Accelerometer = 1,
    Gyro = 2,
}

impl MotionType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Accelerometer),
            2 => Some(Self::Gyro),
            _ => None,
        }
    }
}

/// Decoder capability bits controlling decode-unit delivery.
pub const CAPABILITY_DIRECT_SUBMIT: u32 = 0x01;

/// Video decoder surface implemented by the embedding application.
pub trait VideoDecoder: Send + Sync + 'static {
    fn setup(&self, format: VideoFormat, width: u32, height: u32, fps: u32);
    fn start(&self) {}
    fn stop(&self) {}
    fn cleanup(&self) {}
    /// Submit one frame. A non-zero return requests an IDR.
    fn submit_decode_unit(&self, unit: DecodeUnit) -> i32;
    fn capabilities(&self) -> u32 {
        0
    }
}

/// Audio renderer surface. `None` samples signal packet-loss concealment.
pub trait AudioRenderer: Send + Sync + 'static {
    fn init(&self, config: AudioConfiguration, opus: &OpusConfig);
    fn start(&self) {}
    fn stop(&self) {}
    fn cleanup(&self) {}
    fn play_sample(&self, sample: Option<Bytes>);
    fn capabilities(&self) -> u32 {
        0
    }
}

/// Connection event surface.
#[allow(unused_variables)]
pub trait ConnectionListener: Send + Sync + 'static {
    fn stage_starting(&self, stage: Stage) {}
    fn stage_complete(&self, stage: Stage) {}
    fn stage_failed(&self, stage: Stage, error: &crate::error::MoonlightError) {}
    fn connection_started(&self) {}
    fn connection_terminated(&self, error_code: i32) {}
    fn connection_status_update(&self, status: ConnectionStatus) {}
    fn set_hdr_mode(&self, enabled: bool, metadata: Option<HdrMetadata>) {}
    fn rumble(&self, controller: u16, low_freq: u16, high_freq: u16) {}
    fn rumble_triggers(&self, controller: u16, left: u16, right: u16) {}
    fn set_motion_event_state(&self, controller: u16, motion: MotionType, report_rate_hz: u16) {}
    fn set_controller_led(&self, controller: u16, r: u8, g: u8, b: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tuple_strips_suffixes() {
        let info = ServerInformation {
            app_version: "7.1.431-sunshine".into(),
            ..Default::default()
        };
        assert_eq!(info.version_tuple(), [7, 1, 431, 0]);
    }

    #[test]
    fn sunshine_detection_is_case_insensitive() {
        let info = ServerInformation {
            app_version: "Sunshine 2023.7.1.500".into(),
            ..Default::default()
        };
        assert!(info.is_sunshine());
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least([7, 1, 431, 0], 7, 1, 431));
        assert!(version_at_least([8, 0, 0, 0], 7, 1, 431));
        assert!(!version_at_least([7, 1, 430, 0], 7, 1, 431));
        assert!(!version_at_least([6, 9, 999, 0], 7, 1, 431));
    }

    #[test]
    fn surround_info_encoding() {
        assert_eq!(AudioConfiguration::Stereo.surround_info(), 0x000302CA);
        assert_eq!(AudioConfiguration::Surround51.surround_info(), 0x003F06CA);
    }

    #[test]
    fn ri_key_id_reads_iv_prefix() {
        let mut config = StreamConfiguration::default();
        config.remote_input_aes_iv[..4].copy_from_slice(&0x0102_0304u32.to_be_bytes());
        assert_eq!(config.ri_key_id(), 0x0102_0304);
    }
}

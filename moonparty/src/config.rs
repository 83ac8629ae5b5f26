//! JSON configuration with sensible defaults for a LAN Sunshine host.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use moonlight_common::types::{AudioConfiguration, SupportedVideoFormats};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the web server binds, e.g. ":8080" or "0.0.0.0:8080".
    pub listen_addr: String,
    /// Sunshine host name or IP.
    pub host_address: String,
    /// Moonlight API port (47990 is the web UI and gets corrected).
    pub host_port: u16,
    /// Application to launch; 0 is the host's desktop.
    pub app_id: u32,
    pub ice_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_credential: Option<String>,
    /// Active players including the host-viewer, 1..=4.
    pub max_players: usize,
    /// Directory served at `/` for the browser UI.
    pub static_dir: String,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Kbps.
    pub bitrate: u32,
    pub packet_size: usize,
    /// "h264", "h265" or "av1"; lower formats stay enabled as fallbacks.
    pub codec: String,
    /// 2 for stereo, 6 for 5.1, 8 for 7.1.
    pub audio_channels: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            host_address: "localhost".into(),
            host_port: 47989,
            app_id: 0,
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            turn_username: None,
            turn_credential: None,
            max_players: 4,
            static_dir: "web".into(),
            stream: StreamSettings::default(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate: 20_000,
            packet_size: 1024,
            codec: "h264".into(),
            audio_channels: 2,
        }
    }
}

impl Config {
    /// Read the config file, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing config {}", path.display()))
    }

    /// Codec preference as a client support mask; everything at or below the
    /// configured codec stays available for negotiation.
    pub fn supported_video_formats(&self) -> SupportedVideoFormats {
        match self.stream.codec.to_ascii_lowercase().as_str() {
            "av1" => {
                SupportedVideoFormats::H264
                    | SupportedVideoFormats::H265
                    | SupportedVideoFormats::AV1
            }
            "h265" | "hevc" => SupportedVideoFormats::H264 | SupportedVideoFormats::H265,
            _ => SupportedVideoFormats::H264,
        }
    }

    pub fn audio_configuration(&self) -> AudioConfiguration {
        match self.stream.audio_channels {
            6 => AudioConfiguration::Surround51,
            8 => AudioConfiguration::Surround71,
            _ => AudioConfiguration::Stereo,
        }
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|url| {
                let mut server = RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                };
                if url.starts_with("turn:") || url.starts_with("turns:") {
                    if let (Some(user), Some(credential)) =
                        (&self.turn_username, &self.turn_credential)
                    {
                        server.username = user.clone();
                        server.credential = credential.clone();
                    }
                }
                server
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/moonparty.json")).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.host_port, 47989);
        assert_eq!(config.max_players, 4);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"host_address":"10.0.0.2","stream":{"codec":"h265"}}"#)
                .unwrap();
        assert_eq!(config.host_address, "10.0.0.2");
        assert_eq!(config.stream.width, 1920);
        assert_eq!(
            config.supported_video_formats(),
            SupportedVideoFormats::H264 | SupportedVideoFormats::H265
        );
    }

    #[test]
    fn codec_mask_is_cumulative() {
        let mut config = Config::default();
        config.stream.codec = "av1".into();
        assert!(config.supported_video_formats().contains(SupportedVideoFormats::H264));
        assert!(config.supported_video_formats().contains(SupportedVideoFormats::AV1));
    }

    #[test]
    fn turn_credentials_attach_only_to_turn_urls() {
        let mut config = Config::default();
        config.ice_servers = vec![
            "stun:stun.example.org:3478".into(),
            "turn:turn.example.org:3478".into(),
        ];
        config.turn_username = Some("user".into());
        config.turn_credential = Some("secret".into());

        let servers = config.rtc_ice_servers();
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "user");
    }
}

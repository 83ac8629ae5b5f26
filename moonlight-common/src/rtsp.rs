//! RTSP setup handshake: OPTIONS, DESCRIBE, SETUP x3, ANNOUNCE, PLAY.
//!
//! The host closes the TCP connection after every response, so each request
//! opens a fresh connection. Header casing matters for interoperability:
//! bodies are framed with `Content-length` and `Content-type` exactly as
//! spelled here.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{MoonlightError, Result};
use crate::protocol::{DEFAULT_AUDIO_PORT, DEFAULT_CONTROL_PORT, DEFAULT_VIDEO_PORT};
use crate::types::{
    OpusConfig, StreamConfiguration, SupportedVideoFormats, VideoFormat,
};

const RTSP_TIMEOUT: Duration = Duration::from_secs(15);
const CLIENT_VERSION: u32 = 14;
const DEFAULT_AUDIO_PACKET_DURATION_MS: u32 = 5;

/// Negotiated per-stream UDP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPorts {
    pub video: u16,
    pub audio: u16,
    pub control: u16,
}

/// Everything the streams need from a completed handshake.
#[derive(Debug, Clone)]
pub struct RtspHandshake {
    pub session_id: String,
    pub ports: StreamPorts,
    /// Sunshine's 16-byte token to embed in UDP keepalives.
    pub ping_payload: Option<[u8; 16]>,
    pub negotiated_format: VideoFormat,
    pub audio_packet_duration_ms: u32,
    pub opus_config: OpusConfig,
}

#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub struct RtspClient {
    address: String,
    port: u16,
    cseq: u32,
    session_id: Option<String>,
}

impl RtspClient {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            cseq: 0,
            session_id: None,
        }
    }

    /// Run the full setup sequence and collect the negotiated session.
    pub async fn handshake(&mut self, config: &StreamConfiguration) -> Result<RtspHandshake> {
        self.request("OPTIONS", "/", &[], "").await?;

        let describe = self.request("DESCRIBE", "/", &[("Accept", "application/sdp")], "").await?;
        let answer = parse_sdp(&describe.body);
        let negotiated_format =
            negotiate_video_format(config.supported_video_formats, &answer);

        let mut ping_payload = None;
        let mut ports = StreamPorts {
            video: DEFAULT_VIDEO_PORT,
            audio: DEFAULT_AUDIO_PORT,
            control: DEFAULT_CONTROL_PORT,
        };

        for (stream, port) in [
            ("audio", &mut ports.audio),
            ("video", &mut ports.video),
            ("control", &mut ports.control),
        ] {
            let target = format!("/streamid={stream}/0/0");
            let response = self
                .request(
                    "SETUP",
                    &target,
                    &[("Transport", "unicast;X-GS-ClientPort=50000-50001")],
                    "",
                )
                .await?;

            if self.session_id.is_none() {
                let session = response
                    .header("Session")
                    .ok_or(MoonlightError::RtspNoSession)?;
                // Strip the ";timeout=..." suffix some hosts append.
                let session = session.split(';').next().unwrap_or(session).trim();
                self.session_id = Some(session.to_string());
            }
            if ping_payload.is_none() {
                ping_payload = response
                    .header("X-SS-Ping-Payload")
                    .map(ping_payload_from_header);
            }
            if let Some(transport) = response.header("Transport") {
                if let Some(server_port) = parse_transport_port(transport) {
                    *port = server_port;
                }
            }
        }

        let offer = build_sdp(config, negotiated_format);
        self.request(
            "ANNOUNCE",
            "/",
            &[("Content-type", "application/sdp")],
            &offer,
        )
        .await?;

        self.request("PLAY", "/", &[], "").await?;

        let audio_packet_duration_ms = answer
            .get("x-nv-aqos.packetDuration")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_AUDIO_PACKET_DURATION_MS);

        let session_id = self.session_id.clone().ok_or(MoonlightError::RtspNoSession)?;
        debug!(
            "[Rtsp]: session {session_id} negotiated {:?} on ports video={} audio={} control={}",
            negotiated_format, ports.video, ports.audio, ports.control
        );

        Ok(RtspHandshake {
            session_id,
            ports,
            ping_payload,
            negotiated_format,
            audio_packet_duration_ms,
            opus_config: OpusConfig::stereo(audio_packet_duration_ms),
        })
    }

    /// Best-effort TEARDOWN at shutdown.
    pub async fn teardown(&mut self) {
        let _ = self.request("TEARDOWN", "/", &[], "").await;
    }

    async fn request(
        &mut self,
        method: &'static str,
        target: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> Result<RtspResponse> {
        self.cseq += 1;
        let text = format_request(
            method,
            &self.address,
            self.port,
            target,
            self.cseq,
            self.session_id.as_deref(),
            headers,
            body,
        );

        // One connection per request; the host closes it after responding.
        let mut stream = timeout(
            RTSP_TIMEOUT,
            TcpStream::connect((self.address.as_str(), self.port)),
        )
        .await
        .map_err(|_| MoonlightError::Io(std::io::ErrorKind::TimedOut.into()))??;

        timeout(RTSP_TIMEOUT, stream.write_all(text.as_bytes()))
            .await
            .map_err(|_| MoonlightError::Io(std::io::ErrorKind::TimedOut.into()))??;

        let mut raw = Vec::new();
        timeout(RTSP_TIMEOUT, stream.read_to_end(&mut raw))
            .await
            .map_err(|_| MoonlightError::Io(std::io::ErrorKind::TimedOut.into()))??;

        let response = parse_response(&raw)?;
        if response.status != 200 {
            return Err(MoonlightError::RtspStatus {
                method,
                status: response.status,
                reason: response.reason.clone(),
            });
        }
        Ok(response)
    }
}

#[allow(clippy::too_many_arguments)]
fn format_request(
    method: &str,
    address: &str,
    port: u16,
    target: &str,
    cseq: u32,
    session_id: Option<&str>,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut out = String::with_capacity(256 + body.len());
    out.push_str(&format!(
        "{method} rtsp://{address}:{port}{target} RTSP/1.0\r\n"
    ));
    out.push_str(&format!("CSeq: {cseq}\r\n"));
    out.push_str(&format!("X-GS-ClientVersion: {CLIENT_VERSION}\r\n"));
    out.push_str(&format!("Host: {address}:{port}\r\n"));
    if let Some(session) = session_id {
        out.push_str(&format!("Session: {session}\r\n"));
    }
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        // Lowercase "l" is load-bearing; some hosts reject "Content-Length".
        out.push_str(&format!("Content-length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn parse_response(raw: &[u8]) -> Result<RtspResponse> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| MoonlightError::RtspMalformed("empty response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let proto = parts.next().unwrap_or_default();
    if !proto.starts_with("RTSP/") {
        return Err(MoonlightError::RtspMalformed(format!(
            "bad status line: {status_line}"
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MoonlightError::RtspMalformed(format!("bad status line: {status_line}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    let mut content_length = None;
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            if name.eq_ignore_ascii_case("Content-length") {
                content_length = value.parse::<usize>().ok();
            }
            headers.push((name, value));
        }
    }

    let rest: Vec<&str> = lines.collect();
    let mut body = rest.join("\r\n");
    if let Some(len) = content_length {
        if body.len() > len {
            body.truncate(len);
        }
    }

    Ok(RtspResponse {
        status,
        reason,
        headers,
        body,
    })
}

/// `server_port=NNN` from a Transport header; ranges yield the lower bound.
fn parse_transport_port(transport: &str) -> Option<u16> {
    for part in transport.split(';') {
        if let Some(spec) = part.trim().strip_prefix("server_port=") {
            let low = spec.split('-').next().unwrap_or(spec);
            return low.parse().ok();
        }
    }
    None
}

/// The keepalive token arrives as header text; it is used as raw bytes,
/// zero-padded or truncated to exactly 16.
fn ping_payload_from_header(value: &str) -> [u8; 16] {
    let mut payload = [0u8; 16];
    let bytes = value.as_bytes();
    let len = bytes.len().min(16);
    payload[..len].copy_from_slice(&bytes[..len]);
    payload
}

/// Parse `a=` attributes of an SDP body into a key/value map.
pub fn parse_sdp(sdp: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(attr) = line.strip_prefix("a=") {
            if let Some(idx) = attr.find(':') {
                out.insert(attr[..idx].to_string(), attr[idx + 1..].to_string());
            }
        }
    }
    out
}

/// Pick the best codec supported by both sides, in client-preference order
/// AV1, HEVC, H.264.
pub fn negotiate_video_format(
    supported: SupportedVideoFormats,
    answer: &HashMap<String, String>,
) -> VideoFormat {
    let server_flag = |key: &str| answer.get(key).map(String::as_str) == Some("1");

    if supported.contains(SupportedVideoFormats::AV1) && server_flag("x-nv-video[0].av1Support") {
        VideoFormat::Av1
    } else if supported.contains(SupportedVideoFormats::H265)
        && server_flag("x-nv-video[0].hevcSupport")
    {
        VideoFormat::H265
    } else {
        VideoFormat::H264
    }
}

/// Build the fixed-schema SDP offer carried by ANNOUNCE.
pub fn build_sdp(config: &StreamConfiguration, format: VideoFormat) -> String {
    let mut sdp = String::with_capacity(1024);
    let mut attr = |line: String| {
        sdp.push_str(&line);
        sdp.push_str("\r\n");
    };

    attr(format!(
        "a=x-nv-video[0].clientViewportWd:{}",
        config.width
    ));
    attr(format!(
        "a=x-nv-video[0].clientViewportHt:{}",
        config.height
    ));
    attr(format!("a=x-nv-video[0].maxFPS:{}", config.fps));
    attr(format!("a=x-nv-video[0].packetSize:{}", config.packet_size));
    attr("a=x-nv-video[0].rateControlMode:4".into());
    attr("a=x-nv-video[0].timeoutLengthMs:7000".into());
    attr("a=x-nv-video[0].framesWithInvalidRefThreshold:0".into());

    attr(format!(
        "a=x-nv-video[0].clientSupportHevc:{}",
        u8::from(matches!(format, VideoFormat::H265))
    ));
    attr(format!(
        "a=x-nv-video[0].clientSupportAv1:{}",
        u8::from(matches!(format, VideoFormat::Av1))
    ));
    attr(format!(
        "a=x-nv-vqos[0].bitStreamFormat:{}",
        match format {
            VideoFormat::H264 => 0,
            VideoFormat::H265 => 1,
            VideoFormat::Av1 => 2,
        }
    ));

    attr(format!("a=x-nv-video[0].dynamicRangeMode:{}", u8::from(config.hdr_enabled)));
    attr(format!(
        "a=x-nv-vqos[0].bw.maximumBitrateKbps:{}",
        config.bitrate
    ));
    attr("a=x-nv-vqos[0].drc.enable:0".into());

    attr(format!(
        "a=x-nv-audio.surround.numChannels:{}",
        config.audio_configuration.channel_count()
    ));
    attr(format!(
        "a=x-nv-audio.surround.AudioQuality:{}",
        u8::from(config.audio_configuration.channel_count() > 2)
    ));
    attr(format!(
        "a=x-nv-aqos.packetDuration:{DEFAULT_AUDIO_PACKET_DURATION_MS}"
    ));

    attr(format!(
        "a=x-nv-rikey:{}",
        hex::encode(config.remote_input_aes_key)
    ));
    attr(format!("a=x-nv-rikeyid:{}", config.ri_key_id()));

    attr(format!(
        "a=x-nv-general.useReliableUdp:{}",
        u8::from(config.streaming_remotely)
    ));
    attr("a=x-nv-general.featureFlags:0x42".into());
    attr("a=x-ml-general.featureFlags:0x07".into());
    attr(format!("a=x-nv-clientVersion:{CLIENT_VERSION}"));

    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_formatting_carries_interop_quirks() {
        let text = format_request(
            "ANNOUNCE",
            "10.0.0.2",
            48010,
            "/",
            3,
            Some("DEADBEEF"),
            &[("Content-type", "application/sdp")],
            "v=0",
        );
        assert!(text.starts_with("ANNOUNCE rtsp://10.0.0.2:48010/ RTSP/1.0\r\n"));
        assert!(text.contains("CSeq: 3\r\n"));
        assert!(text.contains("X-GS-ClientVersion: 14\r\n"));
        assert!(text.contains("Session: DEADBEEF\r\n"));
        assert!(text.contains("Content-length: 3\r\n"));
        assert!(text.contains("Content-type: application/sdp\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\nv=0"));
    }

    #[test]
    fn response_parse_extracts_headers_and_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 12345;timeout=60\r\nContent-length: 7\r\n\r\nsdpbody";
        let response = parse_response(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("session"), Some("12345;timeout=60"));
        assert_eq!(response.body, "sdpbody");
    }

    #[test]
    fn non_rtsp_status_line_is_rejected() {
        assert!(parse_response(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn transport_port_takes_range_lower_bound() {
        assert_eq!(
            parse_transport_port("RTP/AVP/UDP;unicast;server_port=48000-48001"),
            Some(48000)
        );
        assert_eq!(parse_transport_port("unicast;server_port=47998"), Some(47998));
        assert_eq!(parse_transport_port("unicast"), None);
    }

    #[test]
    fn sdp_negotiation_prefers_hevc_when_av1_unsupported() {
        let answer = parse_sdp(
            "a=x-nv-video[0].hevcSupport:1\r\na=x-nv-video[0].av1Support:0\r\n",
        );
        let supported =
            SupportedVideoFormats::H264 | SupportedVideoFormats::H265 | SupportedVideoFormats::AV1;
        assert_eq!(negotiate_video_format(supported, &answer), VideoFormat::H265);
    }

    #[test]
    fn sdp_negotiation_falls_back_to_h264() {
        let answer = parse_sdp("a=x-nv-video[0].hevcSupport:1\r\n");
        assert_eq!(
            negotiate_video_format(SupportedVideoFormats::H264, &answer),
            VideoFormat::H264
        );
    }

    #[test]
    fn sdp_negotiation_picks_av1_when_both_sides_support_it() {
        let answer = parse_sdp(
            "a=x-nv-video[0].hevcSupport:1\r\na=x-nv-video[0].av1Support:1\r\n",
        );
        let supported = SupportedVideoFormats::H265 | SupportedVideoFormats::AV1;
        assert_eq!(negotiate_video_format(supported, &answer), VideoFormat::Av1);
    }

    #[test]
    fn sdp_offer_carries_rikey_and_viewport() {
        let mut config = StreamConfiguration::default();
        config.remote_input_aes_key = [0xAB; 16];
        let offer = build_sdp(&config, VideoFormat::H265);
        assert!(offer.contains("a=x-nv-video[0].clientViewportWd:1920"));
        assert!(offer.contains("a=x-nv-video[0].clientSupportHevc:1"));
        assert!(offer.contains(&format!("a=x-nv-rikey:{}", "ab".repeat(16))));
        assert!(offer.contains("a=x-ml-general.featureFlags"));
    }

    #[test]
    fn ping_payload_pads_short_tokens() {
        let payload = ping_payload_from_header("SUNSHINE");
        assert_eq!(&payload[..8], b"SUNSHINE");
        assert_eq!(&payload[8..], &[0u8; 8]);
    }
}

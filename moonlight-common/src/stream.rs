//! Connection supervisor: drives the staged bring-up of one streaming
//! session and owns its teardown.
//!
//! Stages run linearly; every transition is published to the listener, and a
//! failure unwinds whatever came up before it. Teardown order is input,
//! audio, video, control, RTSP, sockets -- the paired identity is never
//! touched.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioStream;
use crate::control::ControlStream;
use crate::error::{MoonlightError, Result, ERR_NO_VIDEO_TRAFFIC};
use crate::input::{InputStream, InputWirePacket};
use crate::protocol::DEFAULT_RTSP_PORT;
use crate::rtsp::{RtspClient, RtspHandshake};
use crate::types::{
    AudioRenderer, ConnectionListener, ServerInformation, Stage, StreamConfiguration,
    VideoDecoder, VideoFormat,
};
use crate::video::{self, VideoEvent, VideoStream};

/// How long teardown waits for the pump tasks before abandoning them.
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// A live streaming session. Dropping it without calling [`stop`] cancels
/// the tasks but skips the RTSP teardown courtesy; call `stop().await` for a
/// clean exit.
///
/// [`stop`]: MoonlightStream::stop
pub struct MoonlightStream {
    token: CancellationToken,
    control: Arc<ControlStream>,
    video: Arc<VideoStream>,
    audio: Arc<AudioStream>,
    input: Arc<InputStream>,
    rtsp: tokio::sync::Mutex<RtspClient>,
    pumps: std::sync::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    negotiated_format: VideoFormat,
    handshake: RtspHandshake,
}

/// Bring up a full session against an already-launched host application.
pub async fn start_stream(
    config: StreamConfiguration,
    server_info: ServerInformation,
    listener: Arc<dyn ConnectionListener>,
    decoder: Arc<dyn VideoDecoder>,
    audio_renderer: Arc<dyn AudioRenderer>,
) -> Result<MoonlightStream> {
    let token = CancellationToken::new();
    let app_version = server_info.version_tuple();
    let is_sunshine = server_info.is_sunshine();

    // -- Platform init: resolve the host before any stream work.
    listener.stage_starting(Stage::PlatformInit);
    let host_addr = match resolve_host(&server_info.address).await {
        Ok(addr) => addr,
        Err(err) => {
            listener.stage_failed(Stage::PlatformInit, &err);
            return Err(err);
        }
    };
    listener.stage_complete(Stage::PlatformInit);

    // -- RTSP handshake.
    listener.stage_starting(Stage::RtspHandshake);
    let rtsp_port = server_info
        .rtsp_session_url
        .as_deref()
        .and_then(rtsp_port_from_url)
        .unwrap_or(DEFAULT_RTSP_PORT);
    let mut rtsp = RtspClient::new(server_info.address.clone(), rtsp_port);
    let handshake = match rtsp.handshake(&config).await {
        Ok(handshake) => handshake,
        Err(err) => {
            listener.stage_failed(Stage::RtspHandshake, &err);
            return Err(err);
        }
    };
    listener.stage_complete(Stage::RtspHandshake);

    let ping_payload = handshake
        .ping_payload
        .unwrap_or_else(video::default_ping_payload);

    // -- Control stream.
    listener.stage_starting(Stage::ControlStreamInit);
    let control = match ControlStream::start(
        &config,
        listener.clone(),
        app_version,
        is_sunshine,
        host_addr,
        handshake.ports.control,
        &token,
    )
    .await
    {
        Ok(control) => Arc::new(control),
        Err(err) => {
            listener.stage_failed(Stage::ControlStreamInit, &err);
            rtsp.teardown().await;
            return Err(err);
        }
    };
    listener.stage_complete(Stage::ControlStreamInit);

    // -- Video stream.
    listener.stage_starting(Stage::VideoStreamInit);
    decoder.setup(
        handshake.negotiated_format,
        config.width,
        config.height,
        config.fps,
    );
    decoder.start();
    let (video_events_tx, video_events_rx) = mpsc::unbounded_channel();
    let video = match VideoStream::start(
        &config,
        decoder.clone(),
        host_addr,
        handshake.ports.video,
        ping_payload,
        video_events_tx,
        &token,
    )
    .await
    {
        Ok(video) => Arc::new(video),
        Err(err) => {
            listener.stage_failed(Stage::VideoStreamInit, &err);
            control.stop().await;
            rtsp.teardown().await;
            return Err(err);
        }
    };
    listener.stage_complete(Stage::VideoStreamInit);

    // -- Audio stream.
    listener.stage_starting(Stage::AudioStreamInit);
    let audio = match AudioStream::start(
        &config,
        audio_renderer,
        host_addr,
        handshake.ports.audio,
        &handshake.opus_config,
        handshake.audio_packet_duration_ms,
        ping_payload,
        &token,
    )
    .await
    {
        Ok(audio) => Arc::new(audio),
        Err(err) => {
            listener.stage_failed(Stage::AudioStreamInit, &err);
            video.stop().await;
            control.stop().await;
            rtsp.teardown().await;
            return Err(err);
        }
    };
    listener.stage_complete(Stage::AudioStreamInit);

    // -- Input assembler.
    listener.stage_starting(Stage::InputStreamInit);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let input = Arc::new(InputStream::new(app_version, is_sunshine, input_tx));
    listener.stage_complete(Stage::InputStreamInit);

    // The start stages are bookkeeping on this transport: every component
    // began running at init, so each start transition completes immediately.
    for stage in [
        Stage::ControlStreamStart,
        Stage::VideoStreamStart,
        Stage::AudioStreamStart,
        Stage::InputStreamStart,
    ] {
        listener.stage_starting(stage);
        listener.stage_complete(stage);
    }

    let stream = MoonlightStream {
        token: token.clone(),
        control: control.clone(),
        video: video.clone(),
        audio,
        input: input.clone(),
        rtsp: tokio::sync::Mutex::new(rtsp),
        pumps: std::sync::Mutex::new(Vec::new()),
        stopped: AtomicBool::new(false),
        negotiated_format: handshake.negotiated_format,
        handshake,
    };

    {
        let mut pumps = stream.pumps.lock().expect("pump lock");
        pumps.push(tokio::spawn(video_event_pump(
            video_events_rx,
            control.clone(),
            video.clone(),
            listener.clone(),
            token.clone(),
        )));
        pumps.push(tokio::spawn(input_pump(
            input_rx,
            control,
            input,
            token.clone(),
        )));
    }

    info!(
        "[Stream]: connection complete ({:?}, session {})",
        stream.negotiated_format, stream.handshake.session_id
    );
    listener.connection_started();

    Ok(stream)
}

impl MoonlightStream {
    pub fn input(&self) -> &Arc<InputStream> {
        &self.input
    }

    pub fn negotiated_format(&self) -> VideoFormat {
        self.negotiated_format
    }

    pub fn session_id(&self) -> &str {
        &self.handshake.session_id
    }

    pub fn video_stats(&self) -> crate::types::VideoStats {
        self.video.stats()
    }

    pub fn audio_stats(&self) -> crate::types::AudioStats {
        self.audio.stats()
    }

    pub fn is_hdr_enabled(&self) -> bool {
        self.control.is_hdr_enabled()
    }

    pub fn hdr_metadata(&self) -> Option<crate::types::HdrMetadata> {
        self.control.hdr_metadata()
    }

    /// Gate the decoder on the next keyframe and ask the host for one.
    pub async fn request_idr_frame(&self) {
        self.video.request_idr_frame();
        if let Err(err) = self.control.request_idr_frame().await {
            warn!("[Stream]: IDR request failed: {err}");
        }
    }

    /// Tear the session down: input first, then audio, video, control, and
    /// finally the RTSP session. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[Stream]: stopping");

        self.input.close();
        self.audio.stop().await;
        self.video.stop().await;
        self.control.stop().await;
        self.rtsp.lock().await.teardown().await;

        self.token.cancel();
        let pumps: Vec<_> = {
            let mut guard = self.pumps.lock().expect("pump lock");
            guard.drain(..).collect()
        };
        for pump in pumps {
            if tokio::time::timeout(JOIN_GRACE, pump).await.is_err() {
                warn!("[Stream]: pump task did not stop within the grace period");
            }
        }
    }
}

impl Drop for MoonlightStream {
    fn drop(&mut self) {
        // Cooperative cancellation for anything still running; a graceful
        // exit goes through stop().
        self.token.cancel();
    }
}

async fn resolve_host(address: &str) -> Result<IpAddr> {
    if let Ok(addr) = address.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host((address, 0)).await?;
    addrs
        .next()
        .map(|socket_addr| socket_addr.ip())
        .ok_or_else(|| {
            MoonlightError::Api(format!("failed to resolve host: {address}"))
        })
}

fn rtsp_port_from_url(url: &str) -> Option<u16> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split('/').next()?;
    let port = authority.rsplit(':').next()?;
    port.parse().ok()
}

/// Forward video pipeline events: frame outcomes feed the loss statistics,
/// recovery failures become IDR requests, and a dead stream terminates the
/// connection.
async fn video_event_pump(
    mut events: mpsc::UnboundedReceiver<VideoEvent>,
    control: Arc<ControlStream>,
    video: Arc<VideoStream>,
    listener: Arc<dyn ConnectionListener>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => {
                match event {
                    None => return,
                    Some(VideoEvent::FrameOutcome { frame_index, good }) => {
                        control.update_frame_stats(frame_index, good);
                    }
                    Some(VideoEvent::RequestIdr) => {
                        video.request_idr_frame();
                        if let Err(err) = control.request_idr_frame().await {
                            debug!("[Stream]: IDR request failed: {err}");
                        }
                    }
                    Some(VideoEvent::NoTraffic) => {
                        listener.connection_terminated(ERR_NO_VIDEO_TRAFFIC);
                        return;
                    }
                }
            }
        }
    }
}

/// Drain assembled input packets into the control stream, completing each
/// send back to the assembler so coalesced state flushes.
async fn input_pump(
    mut packets: mpsc::UnboundedReceiver<InputWirePacket>,
    control: Arc<ControlStream>,
    input: Arc<InputStream>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            packet = packets.recv() => {
                let Some(packet) = packet else { return };
                if let Err(err) = control
                    .send_input_packet(packet.channel_id, packet.flags, &packet.data)
                    .await
                {
                    debug!("[Stream]: input send failed: {err}");
                }
                input.on_send_complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_port_extraction() {
        assert_eq!(
            rtsp_port_from_url("rtsp://192.168.1.10:48010"),
            Some(48010)
        );
        assert_eq!(
            rtsp_port_from_url("rtsp://host.local:21553/stream"),
            Some(21553)
        );
        assert_eq!(rtsp_port_from_url("http://host:80"), None);
        assert_eq!(rtsp_port_from_url("rtsp://hostonly"), None);
    }

    #[tokio::test]
    async fn literal_addresses_skip_dns() {
        assert_eq!(
            resolve_host("127.0.0.1").await.unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_host("::1").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }
}

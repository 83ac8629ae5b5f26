//! One WebRTC peer per connected browser: a dedicated RTCPeerConnection,
//! video and audio tracks fed from the broadcasters, a general data channel
//! for low-latency events, and an input data channel routed through the
//! session arbiter.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use moonlight_common::types::VideoFormat;

use crate::broadcaster::{AudioSample, VideoFrame};
use crate::session::Session;
use crate::signaling::{
    ClientMessage, RtcIceCandidate, RtcSessionDescription, ServerMessage, SignalingMessage,
};

pub struct WebRtcPeer {
    pub peer_id: String,
    pub connection: Arc<RTCPeerConnection>,
    pub general_channel: Arc<RTCDataChannel>,
    pub created_at: Instant,
    token: CancellationToken,
}

fn video_codec(format: VideoFormat) -> RTCRtpCodecCapability {
    match format {
        VideoFormat::H264 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
            rtcp_feedback: vec![],
        },
        VideoFormat::H265 => RTCRtpCodecCapability {
            mime_type: "video/H265".to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        VideoFormat::Av1 => RTCRtpCodecCapability {
            mime_type: "video/AV1".to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// Build the peer connection, attach tracks fed from the broadcasters, and
/// wire its input channel into the session arbiter.
#[allow(clippy::too_many_arguments)]
pub async fn create_peer(
    peer_id: String,
    session: Arc<Session>,
    session_peer_id: String,
    ice_servers: Vec<RTCIceServer>,
    format: VideoFormat,
    mut video_rx: mpsc::UnboundedReceiver<VideoFrame>,
    mut audio_rx: mpsc::UnboundedReceiver<AudioSample>,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
) -> anyhow::Result<Arc<WebRtcPeer>> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .context("register codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .context("register interceptors")?;

    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let connection = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .context("create peer connection")?,
    );

    let general_channel = connection
        .create_data_channel("general", None)
        .await
        .context("create data channel")?;

    let token = CancellationToken::new();

    let video_track = Arc::new(TrackLocalStaticRTP::new(
        video_codec(format),
        format!("video-{peer_id}"),
        "moonparty".to_owned(),
    ));
    let audio_track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        format!("audio-{peer_id}"),
        "moonparty".to_owned(),
    ));

    connection
        .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("add video track")?;
    connection
        .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("add audio track")?;

    // -- Trickle ICE back to the browser.
    {
        let outgoing = outgoing.clone();
        connection.on_ice_candidate(Box::new(move |candidate| {
            let outgoing = outgoing.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(json) = candidate.to_json() else { return };
                let _ = outgoing.send(ServerMessage::Signaling {
                    payload: SignalingMessage::AddIceCandidate(RtcIceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }),
                });
            })
        }));
    }

    // -- Connection lifecycle.
    {
        let peer_label = peer_id.clone();
        let token = token.clone();
        connection.on_peer_connection_state_change(Box::new(move |state| {
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                debug!("[Peer {peer_label}]: connection state {state}, stopping forwarders");
                token.cancel();
            }
            Box::pin(async {})
        }));
    }

    // -- Input over the browser-created data channel.
    {
        let session = session.clone();
        let session_peer_id = session_peer_id.clone();
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            if channel.label() != "input" {
                return Box::pin(async {});
            }
            let session = session.clone();
            let session_peer_id = session_peer_id.clone();
            Box::pin(async move {
                channel.on_message(Box::new(move |message| {
                    let session = session.clone();
                    let session_peer_id = session_peer_id.clone();
                    Box::pin(async move {
                        match serde_json::from_slice::<ClientMessage>(&message.data) {
                            Ok(ClientMessage::Input(event)) => {
                                session.route_input(&session_peer_id, event);
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!("[Peer]: unparseable input message: {err}");
                            }
                        }
                    })
                }));
            })
        }));
    }

    // -- Media forwarding, one task per track.
    {
        let peer_label = peer_id.clone();
        let token = token.clone();
        let sequence = AtomicU16::new(0);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    frame = video_rx.recv() => {
                        let Some(frame) = frame else { return };
                        let packet = webrtc::rtp::packet::Packet {
                            header: webrtc::rtp::header::Header {
                                version: 2,
                                marker: true,
                                payload_type: 96,
                                sequence_number: sequence.fetch_add(1, Ordering::Relaxed),
                                timestamp: frame.timestamp,
                                ..Default::default()
                            },
                            payload: frame.payload,
                        };
                        if let Err(err) = video_track.write_rtp(&packet).await {
                            debug!("[Peer {peer_label}]: video write failed: {err}");
                            return;
                        }
                    }
                }
            }
        });
    }
    {
        let peer_label = peer_id.clone();
        let token = token.clone();
        let sequence = AtomicU16::new(0);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    sample = audio_rx.recv() => {
                        let Some(sample) = sample else { return };
                        let packet = webrtc::rtp::packet::Packet {
                            header: webrtc::rtp::header::Header {
                                version: 2,
                                marker: true,
                                payload_type: 111,
                                sequence_number: sequence.fetch_add(1, Ordering::Relaxed),
                                timestamp: sample.timestamp,
                                ..Default::default()
                            },
                            payload: sample.payload,
                        };
                        if let Err(err) = audio_track.write_rtp(&packet).await {
                            debug!("[Peer {peer_label}]: audio write failed: {err}");
                            return;
                        }
                    }
                }
            }
        });
    }

    info!("[Peer {peer_id}]: created");
    Ok(Arc::new(WebRtcPeer {
        peer_id,
        connection,
        general_channel,
        created_at: Instant::now(),
        token,
    }))
}

impl WebRtcPeer {
    /// Apply a signaling message from the browser; offers produce an answer
    /// on the outgoing channel.
    pub async fn handle_signaling(
        &self,
        message: SignalingMessage,
        outgoing: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        match message {
            SignalingMessage::Description(description) => {
                let is_offer = description.ty.eq_ignore_ascii_case("offer");
                let parsed = if is_offer {
                    RTCSessionDescription::offer(description.sdp)
                } else {
                    RTCSessionDescription::answer(description.sdp)
                };
                let Ok(parsed) = parsed else {
                    warn!("[Peer {}]: invalid session description", self.peer_id);
                    return;
                };
                if let Err(err) = self.connection.set_remote_description(parsed).await {
                    warn!("[Peer {}]: remote description rejected: {err}", self.peer_id);
                    return;
                }
                if is_offer {
                    self.send_answer(outgoing).await;
                }
            }
            SignalingMessage::AddIceCandidate(candidate) => {
                if let Err(err) = self
                    .connection
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                        username_fragment: candidate.username_fragment,
                    })
                    .await
                {
                    warn!("[Peer {}]: ice candidate rejected: {err}", self.peer_id);
                }
            }
        }
    }

    async fn send_answer(&self, outgoing: &mpsc::UnboundedSender<ServerMessage>) {
        let answer = match self.connection.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!("[Peer {}]: create answer failed: {err}", self.peer_id);
                return;
            }
        };
        if let Err(err) = self.connection.set_local_description(answer.clone()).await {
            warn!("[Peer {}]: set local description failed: {err}", self.peer_id);
            return;
        }
        let _ = outgoing.send(ServerMessage::Signaling {
            payload: SignalingMessage::Description(RtcSessionDescription {
                ty: "answer".to_owned(),
                sdp: answer.sdp,
            }),
        });
    }

    pub async fn close(&self) {
        self.token.cancel();
        if let Err(err) = self.connection.close().await {
            debug!("[Peer {}]: close error: {err}", self.peer_id);
        }
    }
}

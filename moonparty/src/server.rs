//! HTTP server, WebSocket signaling endpoint and upstream session control.
//!
//! The first browser to join becomes the session Host and triggers the
//! upstream launch; later joiners spectate until the Host promotes them.
//! One upstream streaming session exists at a time, shared by every peer
//! through the broadcasters.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use futures::StreamExt;
use log::{debug, info, warn};
use rand::RngCore;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use moonlight_common::identity::ClientIdentity;
use moonlight_common::network::MoonlightHost;
use moonlight_common::stream::{start_stream, MoonlightStream};
use moonlight_common::types::StreamConfiguration;

use crate::bridge::{run_input_pump, StreamBridge};
use crate::config::Config;
use crate::peer::{create_peer, WebRtcPeer};
use crate::session::{Peer, Role, Session, SessionManager};
use crate::signaling::{ClientMessage, ServerMessage};

/// A running upstream connection and its fan-out bridge.
pub struct Upstream {
    pub stream: Arc<MoonlightStream>,
    pub bridge: Arc<StreamBridge>,
}

pub struct AppState {
    pub config: Config,
    pub sessions: SessionManager,
    pub identity: ClientIdentity,
    pub host: MoonlightHost,
    /// Stage and connection events fanned out to every connected socket.
    pub events: broadcast::Sender<ServerMessage>,
    pub upstream: tokio::sync::Mutex<Option<Upstream>>,
}

impl AppState {
    pub fn new(config: Config, identity: ClientIdentity, host: MoonlightHost) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let max_players = config.max_players;
        Arc::new(Self {
            config,
            sessions: SessionManager::new(max_players),
            identity,
            host,
            events,
            upstream: tokio::sync::Mutex::new(None),
        })
    }
}

pub fn configure_routes(app: &mut web::ServiceConfig, state: Arc<AppState>) {
    let static_dir = state.config.static_dir.clone();
    app.app_data(web::Data::from(state))
        .route("/api/session", web::get().to(get_session))
        .route("/api/apps", web::get().to(get_apps))
        .route("/ws", web::get().to(ws_route))
        .service(actix_files::Files::new("/", static_dir).index_file("index.html"));
}

async fn get_session(state: web::Data<AppState>) -> impl Responder {
    match state.sessions.active_session() {
        Some(session) => HttpResponse::Ok().json(json!({
            "active": true,
            "session_id": session.id,
            "peers": session.peers(),
        })),
        None => HttpResponse::Ok().json(json!({ "active": false })),
    }
}

async fn get_apps(state: web::Data<AppState>) -> impl Responder {
    match state.host.app_list(state.identity.unique_id()).await {
        Ok(apps) => HttpResponse::Ok().json(
            apps.iter()
                .map(|app| json!({ "id": app.id, "title": app.title }))
                .collect::<Vec<_>>(),
        ),
        Err(err) => {
            warn!("[Server]: applist failed: {err}");
            HttpResponse::BadGateway().json(json!({ "error": err.to_string() }))
        }
    }
}

async fn ws_route(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, ws_session, msg_stream) = actix_ws::handle(&req, payload)?;
    actix_web::rt::spawn(handle_socket(
        state.into_inner(),
        ws_session,
        msg_stream,
    ));
    Ok(response)
}

async fn handle_socket(
    state: Arc<AppState>,
    ws: actix_ws::Session,
    mut messages: actix_ws::MessageStream,
) {
    // Everything we send goes through one ordered queue per socket.
    let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = actix_web::rt::spawn(socket_writer(ws.clone(), outgoing_rx));

    // -- Wait for the Join message before anything else.
    let name = loop {
        match messages.next().await {
            Some(Ok(actix_ws::Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Join { name }) => break name,
                    Ok(_) => {
                        let _ = outgoing.send(ServerMessage::Error {
                            message: "expected a join message".into(),
                        });
                    }
                    Err(err) => {
                        let _ = outgoing.send(ServerMessage::Error {
                            message: format!("bad message: {err}"),
                        });
                    }
                }
            }
            Some(Ok(actix_ws::Message::Ping(_))) | Some(Ok(actix_ws::Message::Pong(_))) => {}
            Some(Ok(actix_ws::Message::Close(_))) | Some(Err(_)) | None => {
                writer.abort();
                return;
            }
            _ => {}
        }
    };

    // -- First joiner hosts; everyone after spectates.
    let (session, peer) = match join_session(&state, &name).await {
        Ok(joined) => joined,
        Err(err) => {
            warn!("[Server]: {name} could not join: {err}");
            let _ = outgoing.send(ServerMessage::Error {
                message: err.to_string(),
            });
            writer.abort();
            return;
        }
    };
    info!(
        "[Server]: {name} joined session {} as {:?}",
        session.id, peer.role
    );
    let _ = outgoing.send(ServerMessage::Joined {
        session_id: session.id.clone(),
        peer: peer.clone(),
    });
    let _ = outgoing.send(ServerMessage::Roster {
        peers: session.peers(),
    });

    // -- Forward global stage/connection events and roster changes.
    let events_task = actix_web::rt::spawn(forward_events(
        state.events.subscribe(),
        session.clone(),
        outgoing.clone(),
    ));

    // -- WebRTC peer with media subscriptions.
    let format = {
        let upstream = state.upstream.lock().await;
        upstream
            .as_ref()
            .map(|u| u.stream.negotiated_format())
            .unwrap_or(moonlight_common::types::VideoFormat::H264)
    };
    let (video_rx, audio_rx) = {
        let upstream = state.upstream.lock().await;
        match upstream.as_ref() {
            Some(u) => (
                u.bridge.video.subscribe(peer.id.clone()),
                u.bridge.audio.subscribe(peer.id.clone()),
            ),
            None => {
                // No upstream (it failed to start); peers can still sit in
                // the roster while the host retries.
                let (_tx, video_rx) = mpsc::unbounded_channel();
                let (_tx2, audio_rx) = mpsc::unbounded_channel();
                (video_rx, audio_rx)
            }
        }
    };

    let rtc_peer = match create_peer(
        peer.id.clone(),
        session.clone(),
        peer.id.clone(),
        state.config.rtc_ice_servers(),
        format,
        video_rx,
        audio_rx,
        outgoing.clone(),
    )
    .await
    {
        Ok(rtc_peer) => rtc_peer,
        Err(err) => {
            warn!("[Server]: peer setup failed for {name}: {err}");
            cleanup_peer(&state, &session, &peer, None).await;
            events_task.abort();
            writer.abort();
            return;
        }
    };

    // -- Main receive loop.
    while let Some(message) = messages.next().await {
        match message {
            Ok(actix_ws::Message::Text(text)) => {
                let parsed = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!("[Server]: bad message from {name}: {err}");
                        continue;
                    }
                };
                handle_client_message(&session, &peer, &rtc_peer, &outgoing, parsed).await;
            }
            Ok(actix_ws::Message::Ping(data)) => {
                let mut ws = ws.clone();
                let _ = ws.pong(&data).await;
            }
            Ok(actix_ws::Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    info!("[Server]: {name} disconnected");
    cleanup_peer(&state, &session, &peer, Some(rtc_peer)).await;
    events_task.abort();
    writer.abort();
}

async fn handle_client_message(
    session: &Arc<Session>,
    peer: &Peer,
    rtc_peer: &Arc<WebRtcPeer>,
    outgoing: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Join { .. } => {}
        ClientMessage::Signaling { payload } => {
            rtc_peer.handle_signaling(payload, outgoing).await;
        }
        ClientMessage::Input(event) => {
            session.route_input(&peer.id, event);
        }
        // Roster operations are host-driven only.
        ClientMessage::Promote { peer_id } => {
            if peer.role == Role::Host {
                if let Err(err) = session.promote_to_player(&peer_id) {
                    let _ = outgoing.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
        }
        ClientMessage::Demote { peer_id } => {
            if peer.role == Role::Host {
                if let Err(err) = session.demote_to_spectator(&peer_id) {
                    let _ = outgoing.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
        }
        ClientMessage::SetKeyboard { peer_id, enabled } => {
            if peer.role == Role::Host {
                session.set_keyboard_enabled(&peer_id, enabled);
            }
        }
    }
}

async fn socket_writer(
    ws: actix_ws::Session,
    mut outgoing: mpsc::UnboundedReceiver<ServerMessage>,
) {
    let mut ws = ws;
    while let Some(message) = outgoing.recv().await {
        let Ok(text) = serde_json::to_string(&message) else {
            continue;
        };
        if ws.text(text).await.is_err() {
            return;
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<ServerMessage>,
    session: Arc<Session>,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut session_events = session.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(message) => {
                        if outgoing.send(message).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("[Server]: socket lagged {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(crate::session::SessionEvent::Closed) => {
                        let _ = outgoing.send(ServerMessage::ConnectionTerminated { error_code: 0 });
                        return;
                    }
                    Ok(_) => {
                        let _ = outgoing.send(ServerMessage::Roster { peers: session.peers() });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = outgoing.send(ServerMessage::Roster { peers: session.peers() });
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Join the active session, creating it (and the upstream connection) for
/// the first peer.
async fn join_session(state: &Arc<AppState>, name: &str) -> anyhow::Result<(Arc<Session>, Peer)> {
    if let Some(session) = state.sessions.active_session() {
        let peer = session.add_spectator(name);
        return Ok((session, peer));
    }

    let (session, host_peer) = state.sessions.create_session(name)?;
    if let Err(err) = start_upstream(state, &session).await {
        warn!("[Server]: upstream start failed: {err}");
        state.sessions.close_session();
        return Err(err);
    }
    Ok((session, host_peer))
}

/// Launch the app on the host and bring up the streaming session.
async fn start_upstream(state: &Arc<AppState>, session: &Arc<Session>) -> anyhow::Result<()> {
    let settings = &state.config.stream;

    // Fresh remote-input key material per session; the first IV word is the
    // key id echoed in the launch query.
    let mut ri_key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut ri_key);
    let ri_key_id: u32 = rand::thread_rng().next_u32();
    let mut ri_iv = [0u8; 16];
    ri_iv[..4].copy_from_slice(&ri_key_id.to_be_bytes());

    let mut server_info = state
        .host
        .server_info(Some(state.identity.unique_id()))
        .await?;

    let launch = state
        .host
        .launch(
            &state.identity,
            state.config.app_id,
            settings.width,
            settings.height,
            settings.fps,
            false,
            false,
            &ri_key,
            ri_key_id,
            session.gamepad_mask(),
        )
        .await?;
    server_info.rtsp_session_url = launch.rtsp_url;

    let stream_config = StreamConfiguration {
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
        bitrate: settings.bitrate,
        packet_size: settings.packet_size,
        audio_configuration: state.config.audio_configuration(),
        supported_video_formats: state.config.supported_video_formats(),
        remote_input_aes_key: ri_key,
        remote_input_aes_iv: ri_iv,
        ..Default::default()
    };

    let bridge = StreamBridge::new(state.events.clone());
    let stream = Arc::new(
        start_stream(
            stream_config,
            server_info,
            bridge.clone(),
            bridge.clone(),
            bridge.clone(),
        )
        .await?,
    );

    tokio::spawn(run_input_pump(session.clone(), stream.input().clone()));

    *state.upstream.lock().await = Some(Upstream { stream, bridge });
    Ok(())
}

pub async fn stop_upstream(state: &Arc<AppState>) {
    let upstream = state.upstream.lock().await.take();
    if let Some(upstream) = upstream {
        info!("[Server]: stopping upstream session");
        upstream.stream.stop().await;
        if let Err(err) = state.host.cancel(state.identity.unique_id()).await {
            debug!("[Server]: cancel failed: {err}");
        }
    }
}

async fn cleanup_peer(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    peer: &Peer,
    rtc_peer: Option<Arc<WebRtcPeer>>,
) {
    if let Some(rtc_peer) = rtc_peer {
        rtc_peer.close().await;
    }
    {
        let upstream = state.upstream.lock().await;
        if let Some(upstream) = upstream.as_ref() {
            upstream.bridge.video.unsubscribe(&peer.id);
            upstream.bridge.audio.unsubscribe(&peer.id);
        }
    }

    session.remove_peer(&peer.id);
    if session.is_closed() {
        state.sessions.close_session();
        stop_upstream(state).await;
    }
}


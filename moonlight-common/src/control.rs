//! Encrypted reliable control channel.
//!
//! Modern hosts (GFE >= 7.1.431 and Sunshine) speak an encrypted framing over
//! UDP: `type=0x0001 (u16 LE) || length (u16 LE) || seq (u32 LE) || tag (16) ||
//! ciphertext`, where the AES-GCM IV is `seq (LE) || zeros || originator ||
//! 'C'`. The plaintext inside is `type (u16 LE) || payload_len (u16 LE) ||
//! payload`. Legacy hosts use a plain `type/length` framing over TCP.
//!
//! One task receives and dispatches host messages; a second drives the
//! periodic ping, loss stats and the connection-quality evaluation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoContext;
use crate::error::{MoonlightError, Result, ERR_UNEXPECTED_TERMINATION};
use crate::protocol::{
    ControlMessage, PacketTypes, CTRL_CHANNEL_GENERIC, CTRL_CHANNEL_URGENT,
    PACKET_FLAG_RELIABLE, PACKET_TYPES_GEN7_ENC,
};
use crate::types::{
    version_at_least, ConnectionListener, ConnectionStatus, HdrMetadata, MotionType,
    StreamConfiguration,
};

const RECV_POLL: Duration = Duration::from_millis(100);
const PERIODIC_PING_INTERVAL: Duration = Duration::from_millis(100);
const LOSS_STATS_INTERVAL_MS: u32 = 50;
const QUALITY_WINDOW: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LEGACY_TCP_PORT: u16 = 47995;

const ENCRYPTED_HEADER_TYPE: u16 = 0x0001;
const IV_ORIGINATOR_CLIENT: u8 = b'C';
const IV_ORIGINATOR_HOST: u8 = b'H';
const IV_CHANNEL_CONTROL: u8 = b'C';

/// Loss percentage at which the connection is reported Poor, and the level it
/// must fall back to before it is reported Okay again.
const LOSS_POOR_THRESHOLD: u32 = 30;
const LOSS_OKAY_THRESHOLD: u32 = 5;

enum Transport {
    Udp(Arc<UdpSocket>),
    Tcp(Mutex<std::net::TcpStream>),
}

impl Transport {
    async fn send(&self, packet: &[u8]) -> Result<()> {
        match self {
            Self::Udp(socket) => {
                socket.send(packet).await?;
                Ok(())
            }
            Self::Tcp(stream) => {
                use std::io::Write;
                let mut guard = stream.lock().expect("control tcp lock");
                guard.write_all(packet)?;
                Ok(())
            }
        }
    }
}

/// Frame-stat counters feeding the 3-second quality evaluation.
struct QualityTracker {
    window_start: Option<Instant>,
    good: u32,
    total: u32,
    last_status: ConnectionStatus,
    last_good_frame: u32,
    last_seen_frame: u32,
}

impl QualityTracker {
    fn new() -> Self {
        Self {
            window_start: None,
            good: 0,
            total: 0,
            last_status: ConnectionStatus::Okay,
            last_good_frame: 0,
            last_seen_frame: 0,
        }
    }

    fn record(&mut self, frame_index: u32, good: bool) {
        self.last_seen_frame = frame_index;
        self.total += 1;
        if good {
            self.last_good_frame = frame_index;
            self.good += 1;
        }
    }

    /// Close out the window if it has elapsed. Returns a status only on a
    /// transition; repeated evaluations in the same state stay silent.
    fn evaluate(&mut self, now: Instant) -> Option<ConnectionStatus> {
        let start = *self.window_start.get_or_insert(now);
        if now.duration_since(start) < QUALITY_WINDOW {
            return None;
        }

        let mut transition = None;
        if self.total > 0 {
            let loss_percent = 100 - (self.good * 100 / self.total);
            if loss_percent >= LOSS_POOR_THRESHOLD
                && self.last_status != ConnectionStatus::Poor
            {
                self.last_status = ConnectionStatus::Poor;
                transition = Some(ConnectionStatus::Poor);
            } else if loss_percent <= LOSS_OKAY_THRESHOLD
                && self.last_status != ConnectionStatus::Okay
            {
                self.last_status = ConnectionStatus::Okay;
                transition = Some(ConnectionStatus::Okay);
            }
        }

        self.window_start = Some(now);
        self.good = 0;
        self.total = 0;
        transition
    }
}

struct ControlInner {
    listener: Arc<dyn ConnectionListener>,
    packet_types: PacketTypes,
    encrypted: bool,
    legacy_tcp: bool,
    is_sunshine: bool,
    crypto: Option<CryptoContext>,
    transport: Transport,
    send_seq: AtomicU32,
    recv_seq: AtomicU32,
    quality: Mutex<QualityTracker>,
    hdr: Mutex<(bool, HdrMetadata)>,
    token: CancellationToken,
}

pub struct ControlStream {
    inner: Arc<ControlInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlStream {
    /// Connect the control channel and start its receive and ping loops.
    pub async fn start(
        config: &StreamConfiguration,
        listener: Arc<dyn ConnectionListener>,
        app_version: [u32; 4],
        is_sunshine: bool,
        host_addr: std::net::IpAddr,
        control_port: u16,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let encrypted = version_at_least(app_version, 7, 1, 431);
        let legacy_tcp = app_version[0] < 5;

        let transport = if legacy_tcp {
            let stream = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((host_addr, LEGACY_TCP_PORT)),
            )
            .await
            .map_err(|_| MoonlightError::Io(std::io::ErrorKind::TimedOut.into()))??;
            let std_stream = stream.into_std()?;
            std_stream.set_nonblocking(false)?;
            std_stream.set_read_timeout(Some(RECV_POLL))?;
            Transport::Tcp(Mutex::new(std_stream))
        } else {
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
            socket.connect((host_addr, control_port)).await?;
            Transport::Udp(Arc::new(socket))
        };

        let crypto = if encrypted {
            Some(CryptoContext::new(&config.remote_input_aes_key)?)
        } else {
            None
        };

        let inner = Arc::new(ControlInner {
            listener,
            packet_types: PACKET_TYPES_GEN7_ENC,
            encrypted,
            legacy_tcp,
            is_sunshine,
            crypto,
            transport,
            send_seq: AtomicU32::new(0),
            recv_seq: AtomicU32::new(0),
            quality: Mutex::new(QualityTracker::new()),
            hdr: Mutex::new((false, HdrMetadata::default())),
            token: parent.child_token(),
        });

        let stream = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        stream.send_start_a().await?;
        stream.send_start_b().await?;

        let mut tasks = stream.tasks.lock().expect("control task lock");
        match &inner.transport {
            Transport::Udp(socket) => {
                tasks.push(tokio::spawn(receive_loop(inner.clone(), socket.clone())));
            }
            Transport::Tcp(stream_guard) => {
                let reader = stream_guard
                    .lock()
                    .expect("control tcp lock")
                    .try_clone()?;
                let inner_tcp = inner.clone();
                tasks.push(tokio::task::spawn_blocking(move || {
                    tcp_receive_loop(inner_tcp, reader)
                }));
            }
        }
        tasks.push(tokio::spawn(ping_loop(inner.clone())));
        drop(tasks);

        Ok(stream)
    }

    /// Cancel both loops and wait for them to unwind.
    pub async fn stop(&self) {
        self.inner.token.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("control task lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Ask the host for a keyframe. Hosts without a dedicated request type
    /// get a reference-frame invalidation covering everything seen so far.
    pub async fn request_idr_frame(&self) -> Result<()> {
        if self.inner.packet_types.get(ControlMessage::RequestIdr).is_some() {
            self.send_message(
                ControlMessage::RequestIdr,
                &[0, 0],
                CTRL_CHANNEL_URGENT,
                PACKET_FLAG_RELIABLE,
            )
            .await
        } else {
            let last_seen = self
                .inner
                .quality
                .lock()
                .expect("quality lock")
                .last_seen_frame;
            self.invalidate_ref_frames(0, last_seen).await
        }
    }

    /// `InvalidateRefFrames(start, end)`: two LE u64 frame indices plus a
    /// reserved tail.
    pub async fn invalidate_ref_frames(&self, start: u32, end: u32) -> Result<()> {
        let mut payload = [0u8; 24];
        payload[0..8].copy_from_slice(&u64::from(start).to_le_bytes());
        payload[8..16].copy_from_slice(&u64::from(end).to_le_bytes());
        self.send_message(
            ControlMessage::InvalidateRefFrames,
            &payload,
            CTRL_CHANNEL_URGENT,
            PACKET_FLAG_RELIABLE,
        )
        .await
    }

    /// Forward an assembled input packet on its channel. Only generation 5+
    /// hosts take input over the control stream.
    pub async fn send_input_packet(&self, channel_id: u8, flags: u32, data: &[u8]) -> Result<()> {
        if self.inner.legacy_tcp {
            return Err(MoonlightError::InputUnsupported);
        }
        self.send_message(ControlMessage::InputData, data, channel_id, flags)
            .await
    }

    /// Record one frame outcome; feeds the loss percentage.
    pub fn update_frame_stats(&self, frame_index: u32, good: bool) {
        self.inner
            .quality
            .lock()
            .expect("quality lock")
            .record(frame_index, good);
    }

    pub fn is_hdr_enabled(&self) -> bool {
        self.inner.hdr.lock().expect("hdr lock").0
    }

    pub fn hdr_metadata(&self) -> Option<HdrMetadata> {
        let guard = self.inner.hdr.lock().expect("hdr lock");
        guard.0.then_some(guard.1)
    }

    async fn send_start_a(&self) -> Result<()> {
        self.send_message(
            ControlMessage::StartA,
            &[0, 0],
            CTRL_CHANNEL_GENERIC,
            PACKET_FLAG_RELIABLE,
        )
        .await
    }

    async fn send_start_b(&self) -> Result<()> {
        self.send_message(
            ControlMessage::StartB,
            &[0],
            CTRL_CHANNEL_GENERIC,
            PACKET_FLAG_RELIABLE,
        )
        .await
    }

    async fn send_message(
        &self,
        message: ControlMessage,
        payload: &[u8],
        channel_id: u8,
        flags: u32,
    ) -> Result<()> {
        let Some(ptype) = self.inner.packet_types.get(message) else {
            return Err(MoonlightError::Unsupported);
        };
        send_raw(&self.inner, ptype, payload, channel_id, flags).await
    }
}

async fn send_raw(
    inner: &ControlInner,
    ptype: u16,
    payload: &[u8],
    _channel_id: u8,
    _flags: u32,
) -> Result<()> {
    let packet = if inner.encrypted {
        let seq = inner.send_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let crypto = inner.crypto.as_ref().ok_or(MoonlightError::ControlNotConnected)?;
        build_encrypted_packet(crypto, ptype, payload, seq)?
    } else if inner.legacy_tcp {
        let mut packet = Vec::with_capacity(4 + payload.len());
        packet.extend_from_slice(&ptype.to_le_bytes());
        packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    } else {
        let mut packet = Vec::with_capacity(2 + payload.len());
        packet.extend_from_slice(&ptype.to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    };
    inner.transport.send(&packet).await
}

/// IV layout: `seq (4, LE) || 6 zero bytes || originator || channel`.
fn control_iv(seq: u32, originator: u8) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[0..4].copy_from_slice(&seq.to_le_bytes());
    iv[10] = originator;
    iv[11] = IV_CHANNEL_CONTROL;
    iv
}

fn build_encrypted_packet(
    crypto: &CryptoContext,
    ptype: u16,
    payload: &[u8],
    seq: u32,
) -> Result<Vec<u8>> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.extend_from_slice(&ptype.to_le_bytes());
    inner.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    inner.extend_from_slice(payload);

    let iv = control_iv(seq, IV_ORIGINATOR_CLIENT);
    let (ciphertext, tag) = crypto.encrypt_gcm(&inner, &iv, &[])?;

    let outer_len = 4 + 16 + ciphertext.len();
    let mut packet = Vec::with_capacity(4 + outer_len);
    packet.extend_from_slice(&ENCRYPTED_HEADER_TYPE.to_le_bytes());
    packet.extend_from_slice(&(outer_len as u16).to_le_bytes());
    packet.extend_from_slice(&seq.to_le_bytes());
    packet.extend_from_slice(&tag);
    packet.extend_from_slice(&ciphertext);
    Ok(packet)
}

/// Open a host-originated encrypted packet, returning `(seq, type, payload)`.
fn decrypt_packet(crypto: &CryptoContext, data: &[u8]) -> Result<(u32, u16, Vec<u8>)> {
    if data.len() < 24 {
        return Err(MoonlightError::PacketTooSmall);
    }
    let header_type = u16::from_le_bytes([data[0], data[1]]);
    if header_type != ENCRYPTED_HEADER_TYPE {
        return Err(MoonlightError::DecryptionFailed);
    }
    let length = u16::from_le_bytes([data[2], data[3]]) as usize;
    if data.len() < 4 + length || length < 20 {
        return Err(MoonlightError::PacketTooSmall);
    }
    let seq = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let tag = &data[8..24];
    let ciphertext = &data[24..4 + length];

    let iv = control_iv(seq, IV_ORIGINATOR_HOST);
    let plaintext = crypto.decrypt_gcm(ciphertext, &iv, tag, &[])?;
    if plaintext.len() < 4 {
        return Err(MoonlightError::PacketTooSmall);
    }

    let ptype = u16::from_le_bytes([plaintext[0], plaintext[1]]);
    let payload_len = u16::from_le_bytes([plaintext[2], plaintext[3]]) as usize;
    let payload = plaintext
        .get(4..4 + payload_len.min(plaintext.len() - 4))
        .unwrap_or(&[])
        .to_vec();
    Ok((seq, ptype, payload))
}

/// Replay protection: the receive sequence must strictly increase. The very
/// first packet is accepted unconditionally.
fn accepts_seq(last: u32, seq: u32) -> bool {
    last == 0 || seq > last
}

/// Termination error code: big-endian u32 when 4+ bytes, else LE u16.
fn termination_code(payload: &[u8]) -> i32 {
    if payload.len() >= 4 {
        i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
    } else if payload.len() >= 2 {
        i32::from(u16::from_le_bytes([payload[0], payload[1]]))
    } else {
        ERR_UNEXPECTED_TERMINATION
    }
}

/// Sunshine HDR metadata block: three display primaries, white point,
/// max/min display luminance, all LE u16 pairs.
fn parse_hdr_metadata(payload: &[u8]) -> Option<HdrMetadata> {
    if payload.len() < 20 {
        return None;
    }
    let word = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
    let mut metadata = HdrMetadata::default();
    for (i, primary) in metadata.display_primaries.iter_mut().enumerate() {
        primary.x = word(i * 4);
        primary.y = word(i * 4 + 2);
    }
    metadata.white_point.x = word(12);
    metadata.white_point.y = word(14);
    metadata.max_display_luminance = word(16);
    metadata.min_display_luminance = word(18);
    Some(metadata)
}

async fn receive_loop(inner: Arc<ControlInner>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            received = timeout(RECV_POLL, socket.recv(&mut buffer)) => {
                let n = match received {
                    Err(_) => continue,
                    Ok(Err(err)) => {
                        if inner.token.is_cancelled() {
                            return;
                        }
                        warn!("[Control]: receive error: {err}");
                        inner.listener.connection_terminated(ERR_UNEXPECTED_TERMINATION);
                        return;
                    }
                    Ok(Ok(n)) => n,
                };
                if n < 2 {
                    continue;
                }
                process_packet(&inner, &buffer[..n]);
            }
        }
    }
}

/// Legacy hosts frame control messages as `type (u16 LE) || length (u16 LE)
/// || payload` over TCP. Runs on a blocking thread with a short read timeout
/// so cancellation stays reactive.
fn tcp_receive_loop(inner: Arc<ControlInner>, mut reader: std::net::TcpStream) {
    use std::io::Read;

    loop {
        if inner.token.is_cancelled() {
            return;
        }

        let mut header = [0u8; 4];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => {
                if !inner.token.is_cancelled() {
                    inner.listener.connection_terminated(ERR_UNEXPECTED_TERMINATION);
                }
                return;
            }
        }

        let ptype = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; length];
        if reader.read_exact(&mut payload).is_err() {
            if !inner.token.is_cancelled() {
                inner.listener.connection_terminated(ERR_UNEXPECTED_TERMINATION);
            }
            return;
        }
        dispatch_message(&inner, ptype, &payload);
    }
}

fn process_packet(inner: &ControlInner, data: &[u8]) {
    let (ptype, payload) = if inner.encrypted {
        let Some(crypto) = inner.crypto.as_ref() else {
            return;
        };
        let (seq, ptype, payload) = match decrypt_packet(crypto, data) {
            Ok(parsed) => parsed,
            Err(_) => {
                // Undecryptable packets are dropped silently; they never
                // surface per-packet errors.
                return;
            }
        };
        let last = inner.recv_seq.load(Ordering::SeqCst);
        if !accepts_seq(last, seq) {
            debug!("[Control]: rejecting replayed packet seq={seq} last={last}");
            return;
        }
        inner.recv_seq.store(seq, Ordering::SeqCst);
        (ptype, payload)
    } else {
        let ptype = u16::from_le_bytes([data[0], data[1]]);
        (ptype, data[2..].to_vec())
    };

    dispatch_message(inner, ptype, &payload);
}

fn dispatch_message(inner: &ControlInner, ptype: u16, payload: &[u8]) {
    match inner.packet_types.message_for(ptype) {
        Some(ControlMessage::HdrMode) if !payload.is_empty() => {
            let enabled = payload[0] != 0;
            let metadata = if inner.is_sunshine {
                parse_hdr_metadata(&payload[1..])
            } else {
                None
            };
            {
                let mut guard = inner.hdr.lock().expect("hdr lock");
                guard.0 = enabled;
                if let Some(metadata) = metadata {
                    guard.1 = metadata;
                }
            }
            inner.listener.set_hdr_mode(enabled, metadata);
        }
        Some(ControlMessage::RumbleData) if payload.len() >= 10 => {
            let controller = u16::from_le_bytes([payload[4], payload[5]]);
            let low = u16::from_le_bytes([payload[6], payload[7]]);
            let high = u16::from_le_bytes([payload[8], payload[9]]);
            inner.listener.rumble(controller, low, high);
        }
        Some(ControlMessage::RumbleTriggers) if payload.len() >= 6 => {
            let controller = u16::from_le_bytes([payload[0], payload[1]]);
            let left = u16::from_le_bytes([payload[2], payload[3]]);
            let right = u16::from_le_bytes([payload[4], payload[5]]);
            inner.listener.rumble_triggers(controller, left, right);
        }
        Some(ControlMessage::SetMotionEvent) if payload.len() >= 5 => {
            let controller = u16::from_le_bytes([payload[0], payload[1]]);
            let report_rate = u16::from_le_bytes([payload[2], payload[3]]);
            if let Some(motion) = MotionType::from_wire(payload[4]) {
                inner
                    .listener
                    .set_motion_event_state(controller, motion, report_rate);
            }
        }
        Some(ControlMessage::SetRgbLed) if payload.len() >= 5 => {
            let controller = u16::from_le_bytes([payload[0], payload[1]]);
            inner
                .listener
                .set_controller_led(controller, payload[2], payload[3], payload[4]);
        }
        Some(ControlMessage::Termination) => {
            let code = termination_code(payload);
            warn!("[Control]: host terminated the session (code {code})");
            inner.listener.connection_terminated(code);
        }
        _ => {}
    }
}

async fn ping_loop(inner: Arc<ControlInner>) {
    let mut ticker = tokio::time::interval(PERIODIC_PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = ticker.tick() => {
                send_periodic_ping(&inner).await;

                let transition = inner
                    .quality
                    .lock()
                    .expect("quality lock")
                    .evaluate(Instant::now());
                if let Some(status) = transition {
                    inner.listener.connection_status_update(status);
                }
            }
        }
    }
}

async fn send_periodic_ping(inner: &ControlInner) {
    let Some(ptype) = inner.packet_types.get(ControlMessage::PeriodicPing) else {
        return;
    };
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&4u16.to_le_bytes());
    if let Err(err) = send_raw(inner, ptype, &payload, CTRL_CHANNEL_GENERIC, PACKET_FLAG_RELIABLE).await {
        debug!("[Control]: ping send failed: {err}");
    }

    let (loss_payload, ptype) = {
        let quality = inner.quality.lock().expect("quality lock");
        let Some(ptype) = inner.packet_types.get(ControlMessage::LossStats) else {
            return;
        };
        let mut payload = [0u8; 32];
        payload[0..4]
            .copy_from_slice(&(quality.total.saturating_sub(quality.good)).to_le_bytes());
        payload[4..8].copy_from_slice(&LOSS_STATS_INTERVAL_MS.to_le_bytes());
        payload[8..12].copy_from_slice(&quality.last_good_frame.to_le_bytes());
        (payload, ptype)
    };
    if let Err(err) = send_raw(
        inner,
        ptype,
        &loss_payload,
        CTRL_CHANNEL_GENERIC,
        PACKET_FLAG_RELIABLE,
    )
    .await
    {
        debug!("[Control]: loss stats send failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CryptoContext {
        CryptoContext::new(&[0x11u8; 16]).unwrap()
    }

    #[test]
    fn encrypted_framing_round_trips() {
        let crypto = context();
        let packet = build_encrypted_packet(&crypto, 0x0302, &[0, 0], 7).unwrap();

        // Outer header: type 0x0001, length, seq.
        assert_eq!(u16::from_le_bytes([packet[0], packet[1]]), 0x0001);
        assert_eq!(u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]), 7);

        // Host decrypts with the same key but the client originator byte.
        let length = u16::from_le_bytes([packet[2], packet[3]]) as usize;
        let iv = control_iv(7, IV_ORIGINATOR_CLIENT);
        let plaintext = crypto
            .decrypt_gcm(&packet[24..4 + length], &iv, &packet[8..24], &[])
            .unwrap();
        assert_eq!(u16::from_le_bytes([plaintext[0], plaintext[1]]), 0x0302);
        assert_eq!(u16::from_le_bytes([plaintext[2], plaintext[3]]), 2);
        assert_eq!(&plaintext[4..], &[0, 0]);
    }

    #[test]
    fn host_packets_decrypt_with_host_iv() {
        let crypto = context();
        // Simulate the host side: same framing, 'H' originator.
        let mut inner = Vec::new();
        inner.extend_from_slice(&0x0109u16.to_le_bytes());
        inner.extend_from_slice(&4u16.to_le_bytes());
        inner.extend_from_slice(&[0, 0, 0, 0]);
        let iv = control_iv(3, IV_ORIGINATOR_HOST);
        let (ciphertext, tag) = crypto.encrypt_gcm(&inner, &iv, &[]).unwrap();

        let mut packet = Vec::new();
        packet.extend_from_slice(&ENCRYPTED_HEADER_TYPE.to_le_bytes());
        packet.extend_from_slice(&((4 + 16 + ciphertext.len()) as u16).to_le_bytes());
        packet.extend_from_slice(&3u32.to_le_bytes());
        packet.extend_from_slice(&tag);
        packet.extend_from_slice(&ciphertext);

        let (seq, ptype, payload) = decrypt_packet(&crypto, &packet).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(ptype, 0x0109);
        assert_eq!(payload, vec![0, 0, 0, 0]);
    }

    #[test]
    fn tampered_packet_is_rejected() {
        let crypto = context();
        let mut packet = build_encrypted_packet(&crypto, 0x0200, &[1, 2, 3], 1).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        // Client-built packets use the 'C' IV, so the host-side open fails
        // outright; a corrupted body would fail the tag check the same way.
        assert!(decrypt_packet(&crypto, &packet).is_err());
    }

    #[test]
    fn receive_sequence_must_strictly_increase() {
        assert!(accepts_seq(0, 1));
        assert!(accepts_seq(0, 100));
        assert!(accepts_seq(5, 6));
        assert!(accepts_seq(5, 50));
        // Replays and reordered packets are refused.
        assert!(!accepts_seq(5, 5));
        assert!(!accepts_seq(5, 4));
        assert!(!accepts_seq(100, 1));
    }

    #[test]
    fn termination_code_width_selection() {
        assert_eq!(termination_code(&[0, 0, 0, 0]), 0);
        assert_eq!(
            termination_code(&0x0000_0065u32.to_be_bytes()),
            0x65
        );
        assert_eq!(termination_code(&0x0102u16.to_le_bytes()), 0x0102);
        assert_eq!(termination_code(&[]), ERR_UNEXPECTED_TERMINATION);
    }

    #[test]
    fn hdr_metadata_layout() {
        let mut payload = Vec::new();
        for v in 1u16..=10 {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let metadata = parse_hdr_metadata(&payload).unwrap();
        assert_eq!(metadata.display_primaries[0].x, 1);
        assert_eq!(metadata.display_primaries[2].y, 6);
        assert_eq!(metadata.white_point.x, 7);
        assert_eq!(metadata.max_display_luminance, 9);
        assert_eq!(metadata.min_display_luminance, 10);
        assert!(parse_hdr_metadata(&payload[..19]).is_none());
    }

    #[test]
    fn quality_transitions_fire_once_per_state() {
        let mut tracker = QualityTracker::new();
        let start = Instant::now();
        assert_eq!(tracker.evaluate(start), None);

        // 3 seconds at 30% loss: one Poor transition.
        for i in 0..100 {
            tracker.record(i, i % 10 < 7);
        }
        assert_eq!(
            tracker.evaluate(start + QUALITY_WINDOW),
            Some(ConnectionStatus::Poor)
        );

        // Still lossy: no duplicate notification.
        for i in 100..200 {
            tracker.record(i, i % 10 < 7);
        }
        assert_eq!(tracker.evaluate(start + QUALITY_WINDOW * 2), None);

        // Recovered below the hysteresis floor: one Okay transition.
        for i in 200..300 {
            tracker.record(i, i % 100 != 0);
        }
        assert_eq!(
            tracker.evaluate(start + QUALITY_WINDOW * 3),
            Some(ConnectionStatus::Okay)
        );
    }

    #[test]
    fn moderate_loss_does_not_flap_back_to_okay() {
        let mut tracker = QualityTracker::new();
        let start = Instant::now();
        tracker.evaluate(start);

        for i in 0..100 {
            tracker.record(i, i % 10 < 6); // 40% loss
        }
        assert_eq!(
            tracker.evaluate(start + QUALITY_WINDOW),
            Some(ConnectionStatus::Poor)
        );

        // 15% loss is better than Poor but not below the Okay threshold.
        for i in 0..100 {
            tracker.record(i, i % 20 < 17);
        }
        assert_eq!(tracker.evaluate(start + QUALITY_WINDOW * 2), None);
    }
}

//! Video RTP reception and frame assembly.
//!
//! Packets arrive over UDP, optionally wrapped in a 28-byte AES-GCM preamble
//! (`IV(12) || tag(16)`). The payload begins with the vendor header whose
//! first 4 bytes are the little-endian frame index; packet-type bit 7 marks
//! IDR frames and bit 6 the end-of-frame packet. Frames assemble in sequence
//! order behind a short reorder window, with Reed-Solomon recovery over the
//! frame's parity shards when data packets go missing.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoContext;
use crate::error::{MoonlightError, Result};
use crate::fec::ReedSolomon;
use crate::protocol::{ENC_VIDEO_HEADER_SIZE, MAX_RTP_HEADER_SIZE, RTP_HEADER_SIZE};
use crate::types::{
    DecodeUnit, EncryptionFlags, FrameType, StreamConfiguration, VideoDecoder, VideoStats,
    CAPABILITY_DIRECT_SUBMIT,
};

const RECV_POLL: Duration = Duration::from_millis(100);
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
/// Out-of-order packets are held at least this long before the frame is
/// declared lossy and recovery starts.
const REORDER_WINDOW: Duration = Duration::from_millis(10);
const DECODE_QUEUE_DEPTH: usize = 16;

const PACKET_TYPE_IDR: u8 = 0x80;
const PACKET_TYPE_EOF: u8 = 0x40;

/// Events the supervisor reacts to: frame outcomes feed the control stream's
/// loss statistics, IDR requests flow to the control channel, and a traffic
/// timeout tears the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    FrameOutcome { frame_index: u32, good: bool },
    RequestIdr,
    NoTraffic,
}

/// One parsed video RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub packet_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub frame_index: u32,
    pub payload: Bytes,
    pub recv_time: Instant,
}

impl RtpPacket {
    pub fn is_idr(&self) -> bool {
        self.packet_type & PACKET_TYPE_IDR != 0
    }

    pub fn is_end_of_frame(&self) -> bool {
        self.packet_type & PACKET_TYPE_EOF != 0
    }
}

/// Parse an RTP packet carrying the 4-byte vendor frame-index prefix.
pub fn parse_rtp(data: &[u8]) -> Result<RtpPacket> {
    if data.len() < RTP_HEADER_SIZE + 4 {
        return Err(MoonlightError::PacketTooSmall);
    }
    let packet_type = data[1];
    let sequence = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let payload = &data[RTP_HEADER_SIZE..];
    let frame_index = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);

    Ok(RtpPacket {
        packet_type,
        sequence,
        timestamp,
        ssrc,
        frame_index,
        payload: Bytes::copy_from_slice(&payload[4..]),
        recv_time: Instant::now(),
    })
}

struct FrameAssembly {
    frame_index: u32,
    frame_type: FrameType,
    /// Data packets by sequence number.
    packets: BTreeMap<u16, Bytes>,
    /// Parity shards: same-frame packets past the end-of-frame marker.
    parity: BTreeMap<u16, Bytes>,
    first_seq: Option<u16>,
    eof_seq: Option<u16>,
    start_time: Instant,
    last_packet_time: Instant,
    data_size: usize,
}

impl FrameAssembly {
    fn new(frame_index: u32, frame_type: FrameType, now: Instant) -> Self {
        Self {
            frame_index,
            frame_type,
            packets: BTreeMap::new(),
            parity: BTreeMap::new(),
            first_seq: None,
            eof_seq: None,
            start_time: now,
            last_packet_time: now,
            data_size: 0,
        }
    }

    fn insert(&mut self, packet: RtpPacket) {
        self.last_packet_time = packet.recv_time;
        if packet.is_end_of_frame() {
            self.eof_seq = Some(packet.sequence);
            // Packets that raced ahead of the end-of-frame marker are parity.
            let eof = packet.sequence;
            let reclassified: Vec<u16> = self
                .packets
                .keys()
                .copied()
                .filter(|&seq| seq_after(seq, eof))
                .collect();
            for seq in reclassified {
                if let Some(data) = self.packets.remove(&seq) {
                    self.data_size -= data.len();
                    self.parity.insert(seq, data);
                }
            }
        }

        let is_parity = match self.eof_seq {
            Some(eof) => seq_after(packet.sequence, eof),
            None => false,
        };
        if is_parity {
            self.parity.entry(packet.sequence).or_insert(packet.payload);
            return;
        }

        if let Some(first) = self.first_seq {
            if seq_after(first, packet.sequence) {
                self.first_seq = Some(packet.sequence);
            }
        } else {
            self.first_seq = Some(packet.sequence);
        }
        if let std::collections::btree_map::Entry::Vacant(entry) =
            self.packets.entry(packet.sequence)
        {
            self.data_size += packet.payload.len();
            entry.insert(packet.payload);
        }
    }

    fn expected_data_packets(&self) -> Option<usize> {
        let first = self.first_seq?;
        let eof = self.eof_seq?;
        Some(usize::from(eof.wrapping_sub(first)) + 1)
    }

    fn is_complete(&self) -> bool {
        match self.expected_data_packets() {
            Some(expected) => self.packets.len() == expected,
            None => false,
        }
    }

    /// Known missing data packets; at least one when the end of the frame
    /// was never observed.
    fn missing_count(&self) -> usize {
        self.expected_data_packets()
            .map(|expected| expected.saturating_sub(self.packets.len()))
            .unwrap_or(1)
            .max(1)
    }

    /// Reconstruct the missing data packets from the parity shards. Shards
    /// are padded to a uniform size for the codec; recovered shards come back
    /// at that size.
    fn recover_with_fec(&mut self) -> Result<usize> {
        let first = self.first_seq.ok_or(MoonlightError::FecNotEnoughShards)?;
        let data_shards = self
            .expected_data_packets()
            .ok_or(MoonlightError::FecNotEnoughShards)?;
        let parity_shards = self.parity.len();
        let missing = data_shards - self.packets.len();
        if missing == 0 {
            return Ok(0);
        }
        if parity_shards == 0 || self.packets.len() + parity_shards < data_shards {
            return Err(MoonlightError::FecNotEnoughShards);
        }

        let shard_size = self
            .packets
            .values()
            .chain(self.parity.values())
            .map(|b| b.len())
            .max()
            .unwrap_or(0);

        let rs = ReedSolomon::new(data_shards, parity_shards)?;
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(rs.total_shards());
        let mut present = Vec::with_capacity(rs.total_shards());

        for i in 0..data_shards {
            let seq = first.wrapping_add(i as u16);
            match self.packets.get(&seq) {
                Some(data) => {
                    let mut shard = data.to_vec();
                    shard.resize(shard_size, 0);
                    shards.push(shard);
                    present.push(true);
                }
                None => {
                    shards.push(Vec::new());
                    present.push(false);
                }
            }
        }
        for data in self.parity.values() {
            let mut shard = data.to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
            present.push(true);
        }

        rs.reconstruct(&mut shards, &present)?;

        for i in 0..data_shards {
            let seq = first.wrapping_add(i as u16);
            if !self.packets.contains_key(&seq) {
                let recovered = Bytes::from(shards[i].clone());
                self.data_size += recovered.len();
                self.packets.insert(seq, recovered);
            }
        }
        Ok(missing)
    }

    fn into_decode_unit(self) -> DecodeUnit {
        let mut payload = BytesMut::with_capacity(self.data_size);
        for data in self.packets.values() {
            payload.extend_from_slice(data);
        }
        DecodeUnit {
            frame_number: self.frame_index,
            frame_type: self.frame_type,
            payload: payload.freeze(),
            enqueue_time_ms: self.start_time.elapsed().as_millis() as u64,
            presentation_time_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// True when `a` comes after `b` in wrapped sequence space.
fn seq_after(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Reassembles frames from parsed packets. Pure state machine, no I/O.
pub struct Depacketizer {
    waiting_for_idr: bool,
    received_full_frame: bool,
    current: Option<FrameAssembly>,
    stats: VideoStats,
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Depacketizer {
    pub fn new() -> Self {
        Self {
            waiting_for_idr: true,
            received_full_frame: false,
            current: None,
            stats: VideoStats::default(),
        }
    }

    pub fn stats(&self) -> &VideoStats {
        &self.stats
    }

    pub fn received_full_frame(&self) -> bool {
        self.received_full_frame
    }

    /// Re-arm the IDR gate: everything short of the next keyframe is dropped.
    pub fn request_idr(&mut self) {
        self.waiting_for_idr = true;
        self.current = None;
        self.stats.requested_idr_frames += 1;
    }

    /// Feed one packet. Completed frames land in `out`; events describe
    /// frame outcomes and recovery failures.
    pub fn process(
        &mut self,
        packet: RtpPacket,
        out: &mut Vec<DecodeUnit>,
        events: &mut Vec<VideoEvent>,
    ) {
        self.stats.received_packets += 1;

        // A new frame index finalizes whatever is still assembling; a failed
        // finalization re-arms the IDR gate, so this happens before gating.
        if let Some(current) = &self.current {
            if current.frame_index != packet.frame_index {
                self.finalize_current(out, events);
            }
        }

        if self.waiting_for_idr && !packet.is_idr() {
            self.stats.dropped_packets += 1;
            return;
        }
        if packet.is_idr() {
            self.waiting_for_idr = false;
        }

        let now = packet.recv_time;
        let frame_type = if packet.is_idr() {
            FrameType::Idr
        } else {
            FrameType::PFrames
        };
        let assembly = self
            .current
            .get_or_insert_with(|| FrameAssembly::new(packet.frame_index, frame_type, now));
        if packet.is_idr() {
            assembly.frame_type = FrameType::Idr;
        }
        assembly.insert(packet);

        if assembly.is_complete() {
            self.finalize_current(out, events);
        }
    }

    /// Called on receive timeouts: frames that sat with gaps longer than the
    /// reorder window get their lost packets counted and recovery attempted.
    pub fn flush_stale(
        &mut self,
        now: Instant,
        out: &mut Vec<DecodeUnit>,
        events: &mut Vec<VideoEvent>,
    ) {
        let stale = self
            .current
            .as_ref()
            .map(|a| {
                a.eof_seq.is_some() && now.duration_since(a.last_packet_time) >= REORDER_WINDOW
            })
            .unwrap_or(false);
        if stale {
            self.finalize_current(out, events);
        }
    }

    fn finalize_current(&mut self, out: &mut Vec<DecodeUnit>, events: &mut Vec<VideoEvent>) {
        let Some(mut assembly) = self.current.take() else {
            return;
        };
        let frame_index = assembly.frame_index;

        if !assembly.is_complete() {
            let missing = assembly.missing_count();
            match assembly.recover_with_fec() {
                Ok(recovered) => {
                    self.stats.recovered_packets += recovered as u32;
                }
                Err(_) => {
                    self.stats.dropped_packets += missing.min(u32::MAX as usize) as u32;
                    self.stats.network_dropped_frames += 1;
                    self.stats.requested_idr_frames += 1;
                    self.waiting_for_idr = true;
                    events.push(VideoEvent::FrameOutcome {
                        frame_index,
                        good: false,
                    });
                    events.push(VideoEvent::RequestIdr);
                    return;
                }
            }
        }

        if assembly.frame_type == FrameType::Idr {
            self.received_full_frame = true;
        }
        self.stats.received_frames += 1;
        self.stats.total_reassembly_time_ms +=
            assembly.start_time.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
        events.push(VideoEvent::FrameOutcome {
            frame_index,
            good: true,
        });
        out.push(assembly.into_decode_unit());
    }
}

/// Bounded hand-off to the decoder task. Overflow drops the oldest P-frame;
/// IDR units are never the victim, and an incoming P-frame is discarded
/// outright rather than displace a queued IDR.
struct DecodeQueue {
    queue: Mutex<VecDeque<DecodeUnit>>,
    notify: Notify,
    capacity: usize,
}

impl DecodeQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns the number of frames dropped to make room.
    fn push(&self, unit: DecodeUnit) -> u32 {
        let mut dropped = 0;
        {
            let mut queue = self.queue.lock().expect("decode queue lock");
            if queue.len() >= self.capacity {
                if let Some(victim) = queue
                    .iter()
                    .position(|u| u.frame_type != FrameType::Idr)
                {
                    queue.remove(victim);
                    dropped += 1;
                } else if unit.frame_type != FrameType::Idr {
                    // Queue full of keyframes; the newcomer loses instead.
                    return 1;
                } else {
                    queue.pop_front();
                    dropped += 1;
                }
            }
            queue.push_back(unit);
        }
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self, token: &CancellationToken) -> Option<DecodeUnit> {
        loop {
            if let Some(unit) = self.queue.lock().expect("decode queue lock").pop_front() {
                return Some(unit);
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

struct VideoInner {
    decoder: Arc<dyn VideoDecoder>,
    crypto: Option<CryptoContext>,
    encrypted: bool,
    socket: Arc<UdpSocket>,
    depacketizer: Mutex<Depacketizer>,
    queue: DecodeQueue,
    events: mpsc::UnboundedSender<VideoEvent>,
    token: CancellationToken,
}

pub struct VideoStream {
    inner: Arc<VideoInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VideoStream {
    /// Bind the video socket, start reception, keepalives, and (when the
    /// decoder does not take direct submission) the decode pump.
    pub async fn start(
        config: &StreamConfiguration,
        decoder: Arc<dyn VideoDecoder>,
        host_addr: std::net::IpAddr,
        video_port: u16,
        ping_payload: [u8; 16],
        events: mpsc::UnboundedSender<VideoEvent>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((host_addr, video_port)).await?;
        let socket = Arc::new(socket);

        let encrypted = config.encryption_flags.contains(EncryptionFlags::VIDEO);
        let crypto = if encrypted {
            Some(CryptoContext::new(&config.remote_input_aes_key)?)
        } else {
            None
        };

        let inner = Arc::new(VideoInner {
            decoder,
            crypto,
            encrypted,
            socket: socket.clone(),
            depacketizer: Mutex::new(Depacketizer::new()),
            queue: DecodeQueue::new(DECODE_QUEUE_DEPTH),
            events,
            token: parent.child_token(),
        });

        let buffer_size = config.packet_size + MAX_RTP_HEADER_SIZE + ENC_VIDEO_HEADER_SIZE;

        let stream = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        let mut tasks = stream.tasks.lock().expect("video task lock");
        tasks.push(tokio::spawn(receive_loop(inner.clone(), buffer_size)));
        tasks.push(tokio::spawn(keepalive_loop(
            socket,
            inner.token.clone(),
            ping_payload,
        )));
        if inner.decoder.capabilities() & CAPABILITY_DIRECT_SUBMIT == 0 {
            tasks.push(tokio::spawn(decode_pump(inner.clone())));
        }
        drop(tasks);

        Ok(stream)
    }

    pub async fn stop(&self) {
        self.inner.token.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("video task lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.inner.decoder.stop();
        self.inner.decoder.cleanup();
    }

    /// Drop everything until the next keyframe; pairs with an IDR request on
    /// the control stream.
    pub fn request_idr_frame(&self) {
        self.inner
            .depacketizer
            .lock()
            .expect("depacketizer lock")
            .request_idr();
    }

    pub fn stats(&self) -> VideoStats {
        self.inner
            .depacketizer
            .lock()
            .expect("depacketizer lock")
            .stats()
            .clone()
    }
}

async fn receive_loop(inner: Arc<VideoInner>, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    let mut waiting = Duration::ZERO;
    let mut received_data = false;
    let mut first_data_time: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            received = timeout(RECV_POLL, inner.socket.recv(&mut buffer)) => {
                let n = match received {
                    Err(_) => {
                        if !received_data {
                            waiting += RECV_POLL;
                            if waiting >= FIRST_FRAME_TIMEOUT {
                                warn!("[Video]: no traffic within {FIRST_FRAME_TIMEOUT:?}");
                                let _ = inner.events.send(VideoEvent::NoTraffic);
                                return;
                            }
                        }
                        drain_stale(&inner);
                        continue;
                    }
                    Ok(Err(err)) => {
                        if !inner.token.is_cancelled() {
                            warn!("[Video]: receive error: {err}");
                        }
                        return;
                    }
                    Ok(Ok(n)) => n,
                };

                if !received_data {
                    received_data = true;
                    first_data_time = Some(Instant::now());
                }

                // Traffic without a single complete frame also counts as a
                // dead stream.
                let full_frame = inner
                    .depacketizer
                    .lock()
                    .expect("depacketizer lock")
                    .received_full_frame();
                if !full_frame {
                    if let Some(first) = first_data_time {
                        if first.elapsed() > FIRST_FRAME_TIMEOUT {
                            let _ = inner.events.send(VideoEvent::NoTraffic);
                            return;
                        }
                    }
                }

                handle_datagram(&inner, &buffer[..n]);
            }
        }
    }
}

fn handle_datagram(inner: &VideoInner, data: &[u8]) {
    let plaintext;
    let rtp_bytes: &[u8] = if inner.encrypted {
        let Some(crypto) = inner.crypto.as_ref() else {
            return;
        };
        if data.len() < ENC_VIDEO_HEADER_SIZE + RTP_HEADER_SIZE {
            return;
        }
        let iv = &data[0..12];
        let tag = &data[12..28];
        match crypto.decrypt_gcm(&data[28..], iv, tag, &[]) {
            Ok(decrypted) => {
                plaintext = decrypted;
                &plaintext
            }
            Err(_) => {
                // Drop undecryptable packets quietly and keep counting.
                let mut depacketizer =
                    inner.depacketizer.lock().expect("depacketizer lock");
                depacketizer.stats.dropped_packets += 1;
                return;
            }
        }
    } else {
        data
    };

    let packet = match parse_rtp(rtp_bytes) {
        Ok(packet) => packet,
        Err(_) => return,
    };

    let mut out = Vec::new();
    let mut events = Vec::new();
    {
        let mut depacketizer = inner.depacketizer.lock().expect("depacketizer lock");
        depacketizer.process(packet, &mut out, &mut events);
    }
    deliver(inner, out, events);
}

fn drain_stale(inner: &VideoInner) {
    let mut out = Vec::new();
    let mut events = Vec::new();
    {
        let mut depacketizer = inner.depacketizer.lock().expect("depacketizer lock");
        depacketizer.flush_stale(Instant::now(), &mut out, &mut events);
    }
    deliver(inner, out, events);
}

fn deliver(inner: &VideoInner, units: Vec<DecodeUnit>, events: Vec<VideoEvent>) {
    for event in events {
        let _ = inner.events.send(event);
    }

    let direct = inner.decoder.capabilities() & CAPABILITY_DIRECT_SUBMIT != 0;
    for unit in units {
        if direct {
            if inner.decoder.submit_decode_unit(unit) != 0 {
                let _ = inner.events.send(VideoEvent::RequestIdr);
            }
            let mut depacketizer = inner.depacketizer.lock().expect("depacketizer lock");
            depacketizer.stats.submitted_frames += 1;
        } else {
            let dropped = inner.queue.push(unit);
            if dropped > 0 {
                debug!("[Video]: decode queue full, dropped {dropped} frame(s)");
                let mut depacketizer = inner.depacketizer.lock().expect("depacketizer lock");
                depacketizer.stats.dropped_frames += dropped;
            }
        }
    }
}

async fn decode_pump(inner: Arc<VideoInner>) {
    while let Some(unit) = inner.queue.pop(&inner.token).await {
        if inner.decoder.submit_decode_unit(unit) != 0 {
            let _ = inner.events.send(VideoEvent::RequestIdr);
        }
        let mut depacketizer = inner.depacketizer.lock().expect("depacketizer lock");
        depacketizer.stats.submitted_frames += 1;
    }
}

/// Every media socket keeps its NAT binding alive with a 20-byte datagram:
/// the 16-byte ping payload followed by a big-endian sequence number.
pub(crate) async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    token: CancellationToken,
    payload: [u8; 16],
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut seq: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                seq = seq.wrapping_add(1);
                let mut packet = [0u8; 20];
                packet[..16].copy_from_slice(&payload);
                packet[16..].copy_from_slice(&seq.to_be_bytes());
                if let Err(err) = socket.send(&packet).await {
                    debug!("[Video]: keepalive send failed: {err}");
                }
            }
        }
    }
}

/// The default keepalive payload when the host did not hand one out during
/// SETUP: ASCII "PING" zero-padded.
pub fn default_ping_payload() -> [u8; 16] {
    let mut payload = [0u8; 16];
    payload[..4].copy_from_slice(b"PING");
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(frame_index: u32, seq: u16, flags: u8, payload: &[u8]) -> RtpPacket {
        let mut data = Vec::with_capacity(RTP_HEADER_SIZE + 4 + payload.len());
        data.push(0x80);
        data.push(flags);
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&90_000u32.to_be_bytes());
        data.extend_from_slice(&0x1234u32.to_be_bytes());
        data.extend_from_slice(&frame_index.to_le_bytes());
        data.extend_from_slice(payload);
        parse_rtp(&data).unwrap()
    }

    #[test]
    fn rtp_parse_extracts_wire_fields() {
        let parsed = packet(102, 7, PACKET_TYPE_IDR, b"unit");
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.frame_index, 102);
        assert!(parsed.is_idr());
        assert!(!parsed.is_end_of_frame());
        assert_eq!(&parsed.payload[..], b"unit");
    }

    #[test]
    fn p_frames_are_gated_until_an_idr_arrives() {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        let mut events = Vec::new();

        depacketizer.process(packet(100, 1, PACKET_TYPE_EOF, b"p1"), &mut out, &mut events);
        depacketizer.process(packet(101, 2, PACKET_TYPE_EOF, b"p2"), &mut out, &mut events);
        assert!(out.is_empty());

        depacketizer.process(packet(102, 3, PACKET_TYPE_IDR, b"aaa"), &mut out, &mut events);
        depacketizer.process(packet(102, 4, PACKET_TYPE_IDR, b"bbb"), &mut out, &mut events);
        depacketizer.process(
            packet(102, 5, PACKET_TYPE_IDR | PACKET_TYPE_EOF, b"ccc"),
            &mut out,
            &mut events,
        );

        assert_eq!(out.len(), 1);
        let unit = &out[0];
        assert_eq!(unit.frame_number, 102);
        assert_eq!(unit.frame_type, FrameType::Idr);
        assert_eq!(&unit.payload[..], b"aaabbbccc");
        assert_eq!(depacketizer.stats().dropped_packets, 2);
    }

    #[test]
    fn payload_concatenates_in_sequence_order() {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        let mut events = Vec::new();

        // Arrivals out of order; the EOF packet lands before the middle one.
        depacketizer.process(packet(5, 10, PACKET_TYPE_IDR, b"one"), &mut out, &mut events);
        depacketizer.process(
            packet(5, 12, PACKET_TYPE_IDR | PACKET_TYPE_EOF, b"three"),
            &mut out,
            &mut events,
        );
        assert!(out.is_empty());
        depacketizer.process(packet(5, 11, PACKET_TYPE_IDR, b"two"), &mut out, &mut events);

        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"onetwothree");
        let total: usize = [b"one".len(), b"two".len(), b"three".len()].iter().sum();
        assert_eq!(out[0].payload.len(), total);
    }

    #[test]
    fn new_frame_index_finalizes_previous_assembly() {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        let mut events = Vec::new();

        depacketizer.process(packet(7, 1, PACKET_TYPE_IDR, b"a"), &mut out, &mut events);
        depacketizer.process(
            packet(7, 2, PACKET_TYPE_IDR | PACKET_TYPE_EOF, b"b"),
            &mut out,
            &mut events,
        );
        assert_eq!(out.len(), 1);

        // Frame 8 is missing a packet when frame 9 starts: recovery fails
        // (no parity) and an IDR request fires.
        depacketizer.process(packet(8, 3, 0, b"x"), &mut out, &mut events);
        events.clear();
        depacketizer.process(packet(9, 6, 0, b"y"), &mut out, &mut events);

        assert_eq!(out.len(), 1);
        assert!(events.contains(&VideoEvent::RequestIdr));
        assert!(events.contains(&VideoEvent::FrameOutcome {
            frame_index: 8,
            good: false
        }));
        // The gate re-armed: frame 9's remaining packets are refused.
        depacketizer.process(packet(9, 7, PACKET_TYPE_EOF, b"z"), &mut out, &mut events);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn fec_recovers_a_missing_data_packet() {
        // Build a frame of 3 data shards and 2 parity shards, then lose one
        // data shard in transit.
        let shard_size = 8usize;
        let data: Vec<Vec<u8>> = (0..3)
            .map(|i| (0..shard_size).map(|b| (i * 16 + b) as u8).collect())
            .collect();
        let rs = ReedSolomon::new(3, 2).unwrap();
        let mut shards = data.clone();
        shards.push(vec![0u8; shard_size]);
        shards.push(vec![0u8; shard_size]);
        rs.encode(&mut shards).unwrap();

        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        let mut events = Vec::new();

        depacketizer.process(packet(1, 0, PACKET_TYPE_IDR, &shards[0]), &mut out, &mut events);
        // Shard 1 is lost. Shard 2 carries the end-of-frame marker.
        depacketizer.process(
            packet(1, 2, PACKET_TYPE_IDR | PACKET_TYPE_EOF, &shards[2]),
            &mut out,
            &mut events,
        );
        // Parity arrives past the end-of-frame sequence.
        depacketizer.process(packet(1, 3, PACKET_TYPE_IDR, &shards[3]), &mut out, &mut events);
        assert!(out.is_empty());
        depacketizer.process(packet(1, 4, PACKET_TYPE_IDR, &shards[4]), &mut out, &mut events);

        // Force finalization via the stale path.
        depacketizer.flush_stale(
            Instant::now() + REORDER_WINDOW + Duration::from_millis(1),
            &mut out,
            &mut events,
        );
        assert_eq!(out.len(), 1);
        let expected: Vec<u8> = data.concat();
        assert_eq!(&out[0].payload[..], &expected[..]);
        assert_eq!(depacketizer.stats().recovered_packets, 1);
    }

    #[test]
    fn decode_queue_never_drops_idr_units() {
        let queue = DecodeQueue::new(2);
        let unit = |n: u32, t: FrameType| DecodeUnit {
            frame_number: n,
            frame_type: t,
            payload: Bytes::new(),
            enqueue_time_ms: 0,
            presentation_time_ms: 0,
        };

        assert_eq!(queue.push(unit(1, FrameType::PFrames)), 0);
        assert_eq!(queue.push(unit(2, FrameType::Idr)), 0);
        // Full: the P-frame is the victim, not the IDR.
        assert_eq!(queue.push(unit(3, FrameType::Idr)), 1);
        let contents: Vec<u32> = queue
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.frame_number)
            .collect();
        assert_eq!(contents, vec![2, 3]);

        // Full of IDRs: an incoming P-frame is refused instead.
        assert_eq!(queue.push(unit(4, FrameType::PFrames)), 1);
        let contents: Vec<u32> = queue
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.frame_number)
            .collect();
        assert_eq!(contents, vec![2, 3]);
    }

    #[test]
    fn default_ping_payload_is_padded_ascii() {
        let payload = default_ping_payload();
        assert_eq!(&payload[..4], b"PING");
        assert_eq!(&payload[4..], &[0u8; 12]);
    }
}

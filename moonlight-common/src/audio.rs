//! Audio RTP reception.
//!
//! Encrypted audio uses AES-128-CBC with an IV of `BE(ri_key_id + seq)` zero
//! padded to 16 bytes. The first half second of audio is dropped on purpose
//! to absorb startup jitter; sequence gaps queue packet-loss-concealment
//! markers for the downstream decoder.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoContext;
use crate::error::Result;
use crate::protocol::RTP_HEADER_SIZE;
use crate::types::{
    AudioRenderer, AudioStats, OpusConfig, StreamConfiguration, CAPABILITY_DIRECT_SUBMIT,
};
use crate::video::keepalive_loop;

const MAX_PACKET_SIZE: usize = 1400;
const RECV_POLL: Duration = Duration::from_millis(100);
/// Milliseconds of leading audio discarded to catch up to real time.
const INITIAL_DROP_MS: u32 = 500;
const QUEUE_DEPTH: usize = 30;
/// RTP payload type carrying actual Opus audio (FEC packets differ).
const PAYLOAD_TYPE_OPUS: u8 = 97;
/// Cap on the concealment markers produced by one sequence gap.
const MAX_PLC_ENTRIES: u16 = 8;

/// CBC IV for one audio packet.
fn audio_iv(ri_key_id: u32, sequence: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&ri_key_id.wrapping_add(u32::from(sequence)).to_be_bytes());
    iv
}

/// Socket-free packet pipeline: drop window, loss accounting, decryption.
struct PacketProcessor {
    crypto: Option<CryptoContext>,
    ri_key_id: u32,
    packets_to_drop: u32,
    last_sequence: u16,
    received_any: bool,
    stats: AudioStats,
}

impl PacketProcessor {
    fn new(config: &StreamConfiguration, packet_duration_ms: u32) -> Result<Self> {
        let crypto = if config.audio_encryption {
            Some(CryptoContext::new(&config.remote_input_aes_key)?)
        } else {
            None
        };
        Ok(Self {
            crypto,
            ri_key_id: config.ri_key_id(),
            packets_to_drop: INITIAL_DROP_MS / packet_duration_ms.max(1),
            last_sequence: 0,
            received_any: false,
            stats: AudioStats::default(),
        })
    }

    /// Stop discarding: real-time flow is established once the receive loop
    /// sees its first idle poll after traffic.
    fn freeze_drop_window(&mut self) {
        if self.received_any {
            self.packets_to_drop = 0;
        }
    }

    /// Process one datagram into queue entries: `None` markers for detected
    /// losses, then the decrypted sample.
    fn process(&mut self, datagram: &[u8], out: &mut Vec<Option<Bytes>>) {
        if datagram.len() < RTP_HEADER_SIZE {
            return;
        }
        self.received_any = true;
        self.stats.received_packets += 1;

        let payload_type = datagram[1] & 0x7F;
        if self.packets_to_drop > 0 {
            if payload_type == PAYLOAD_TYPE_OPUS {
                self.packets_to_drop -= 1;
            }
            return;
        }

        let sequence = u16::from_be_bytes([datagram[2], datagram[3]]);
        if self.last_sequence != 0 && sequence != self.last_sequence.wrapping_add(1) {
            let lost = sequence.wrapping_sub(self.last_sequence).wrapping_sub(1);
            self.stats.dropped_packets += u32::from(lost);
            for _ in 0..lost.min(MAX_PLC_ENTRIES) {
                out.push(None);
            }
        }
        self.last_sequence = sequence;

        let payload = &datagram[RTP_HEADER_SIZE..];
        let sample = match &self.crypto {
            Some(crypto) => {
                let iv = audio_iv(self.ri_key_id, sequence);
                match crypto.decrypt_cbc(payload, &iv) {
                    Ok(plaintext) => Bytes::from(plaintext),
                    Err(_) => {
                        // Undecryptable packets never surface per-packet.
                        self.stats.dropped_packets += 1;
                        return;
                    }
                }
            }
            None => Bytes::copy_from_slice(payload),
        };
        out.push(Some(sample));
    }
}

/// Bounded sample queue with drop-oldest overflow.
struct SampleQueue {
    queue: Mutex<VecDeque<Option<Bytes>>>,
    notify: Notify,
    capacity: usize,
}

impl SampleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, entry: Option<Bytes>) {
        {
            let mut queue = self.queue.lock().expect("audio queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(entry);
        }
        self.notify.notify_one();
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("audio queue lock").len()
    }

    async fn pop(&self, token: &CancellationToken) -> Option<Option<Bytes>> {
        loop {
            if let Some(entry) = self.queue.lock().expect("audio queue lock").pop_front() {
                return Some(entry);
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

struct AudioInner {
    renderer: Arc<dyn AudioRenderer>,
    processor: Mutex<PacketProcessor>,
    queue: SampleQueue,
    packet_duration_ms: u32,
    token: CancellationToken,
}

pub struct AudioStream {
    inner: Arc<AudioInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioStream {
    pub async fn start(
        config: &StreamConfiguration,
        renderer: Arc<dyn AudioRenderer>,
        host_addr: std::net::IpAddr,
        audio_port: u16,
        opus_config: &OpusConfig,
        packet_duration_ms: u32,
        ping_payload: [u8; 16],
        parent: &CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((host_addr, audio_port)).await?;
        let socket = Arc::new(socket);

        renderer.init(config.audio_configuration, opus_config);
        renderer.start();

        let inner = Arc::new(AudioInner {
            renderer,
            processor: Mutex::new(PacketProcessor::new(config, packet_duration_ms)?),
            queue: SampleQueue::new(QUEUE_DEPTH),
            packet_duration_ms,
            token: parent.child_token(),
        });

        let stream = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        let mut tasks = stream.tasks.lock().expect("audio task lock");
        tasks.push(tokio::spawn(receive_loop(inner.clone(), socket.clone())));
        tasks.push(tokio::spawn(keepalive_loop(
            socket,
            inner.token.clone(),
            ping_payload,
        )));
        if inner.renderer.capabilities() & CAPABILITY_DIRECT_SUBMIT == 0 {
            tasks.push(tokio::spawn(render_pump(inner.clone())));
        }
        drop(tasks);

        Ok(stream)
    }

    pub async fn stop(&self) {
        self.inner.token.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("audio task lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.inner.renderer.stop();
        self.inner.renderer.cleanup();
    }

    pub fn stats(&self) -> AudioStats {
        self.inner
            .processor
            .lock()
            .expect("audio processor lock")
            .stats
            .clone()
    }

    /// Samples waiting for the renderer.
    pub fn pending_frames(&self) -> usize {
        self.inner.queue.len()
    }

    /// Buffered playback time in milliseconds.
    pub fn pending_duration_ms(&self) -> u32 {
        self.pending_frames() as u32 * self.inner.packet_duration_ms
    }
}

async fn receive_loop(inner: Arc<AudioInner>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; MAX_PACKET_SIZE];
    let direct = inner.renderer.capabilities() & CAPABILITY_DIRECT_SUBMIT != 0;

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            received = timeout(RECV_POLL, socket.recv(&mut buffer)) => {
                let n = match received {
                    Err(_) => {
                        inner
                            .processor
                            .lock()
                            .expect("audio processor lock")
                            .freeze_drop_window();
                        continue;
                    }
                    Ok(Err(err)) => {
                        if !inner.token.is_cancelled() {
                            warn!("[Audio]: receive error: {err}");
                        }
                        return;
                    }
                    Ok(Ok(n)) => n,
                };

                let mut entries = Vec::new();
                inner
                    .processor
                    .lock()
                    .expect("audio processor lock")
                    .process(&buffer[..n], &mut entries);

                if entries.is_empty() {
                    continue;
                }
                if direct {
                    for entry in entries {
                        inner.renderer.play_sample(entry);
                    }
                } else {
                    for entry in entries {
                        inner.queue.push(entry);
                    }
                }
            }
        }
    }
}

async fn render_pump(inner: Arc<AudioInner>) {
    while let Some(entry) = inner.queue.pop(&inner.token).await {
        if entry.is_none() {
            debug!("[Audio]: concealment sample for lost packet");
        }
        inner.renderer.play_sample(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncryptionFlags;

    fn datagram(sequence: u16, payload_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; RTP_HEADER_SIZE];
        data[0] = 0x80;
        data[1] = payload_type;
        data[2..4].copy_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn plain_config() -> StreamConfiguration {
        StreamConfiguration::default()
    }

    #[test]
    fn iv_is_key_id_plus_sequence_big_endian() {
        let iv = audio_iv(0x0000_1000, 0x0022);
        assert_eq!(&iv[..4], &0x0000_1022u32.to_be_bytes());
        assert_eq!(&iv[4..], &[0u8; 12]);
    }

    #[test]
    fn initial_drop_window_spans_half_a_second() {
        let processor = PacketProcessor::new(&plain_config(), 5).unwrap();
        assert_eq!(processor.packets_to_drop, 100);

        let processor = PacketProcessor::new(&plain_config(), 10).unwrap();
        assert_eq!(processor.packets_to_drop, 50);
    }

    #[test]
    fn drop_window_only_counts_real_audio() {
        let mut processor = PacketProcessor::new(&plain_config(), 250).unwrap();
        assert_eq!(processor.packets_to_drop, 2);
        let mut out = Vec::new();

        // FEC payload type does not consume the drop budget.
        processor.process(&datagram(1, 127, b"fec"), &mut out);
        assert_eq!(processor.packets_to_drop, 2);

        processor.process(&datagram(2, PAYLOAD_TYPE_OPUS, b"a"), &mut out);
        processor.process(&datagram(3, PAYLOAD_TYPE_OPUS, b"b"), &mut out);
        assert!(out.is_empty());

        processor.process(&datagram(4, PAYLOAD_TYPE_OPUS, b"c"), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_deref(), Some(b"c".as_slice()));
    }

    #[test]
    fn drop_window_freezes_once_traffic_flows() {
        let mut processor = PacketProcessor::new(&plain_config(), 5).unwrap();
        let mut out = Vec::new();
        processor.process(&datagram(1, PAYLOAD_TYPE_OPUS, b"x"), &mut out);
        processor.freeze_drop_window();
        assert_eq!(processor.packets_to_drop, 0);

        processor.process(&datagram(2, PAYLOAD_TYPE_OPUS, b"y"), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn sequence_gaps_count_losses_and_emit_concealment() {
        let mut processor = PacketProcessor::new(&plain_config(), 5).unwrap();
        processor.packets_to_drop = 0;
        let mut out = Vec::new();

        processor.process(&datagram(10, PAYLOAD_TYPE_OPUS, b"a"), &mut out);
        processor.process(&datagram(13, PAYLOAD_TYPE_OPUS, b"b"), &mut out);

        assert_eq!(processor.stats.dropped_packets, 2);
        // Two PLC markers between the two real samples.
        assert_eq!(out.len(), 4);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_none());
        assert!(out[3].is_some());
    }

    #[test]
    fn encrypted_payloads_round_trip_through_cbc() {
        let mut config = plain_config();
        config.audio_encryption = true;
        config.encryption_flags = EncryptionFlags::AUDIO;
        config.remote_input_aes_key = [0x5Au8; 16];
        config.remote_input_aes_iv[..4].copy_from_slice(&100u32.to_be_bytes());

        let crypto = CryptoContext::new(&config.remote_input_aes_key).unwrap();
        let sequence = 7u16;
        let iv = audio_iv(100, sequence);
        let ciphertext = crypto.encrypt_cbc(b"opus frame", &iv).unwrap();

        let mut processor = PacketProcessor::new(&config, 5).unwrap();
        processor.packets_to_drop = 0;
        let mut out = Vec::new();
        processor.process(&datagram(sequence, PAYLOAD_TYPE_OPUS, &ciphertext), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_deref(), Some(b"opus frame".as_slice()));
    }

    #[test]
    fn sample_queue_drops_oldest_on_overflow() {
        let queue = SampleQueue::new(2);
        queue.push(Some(Bytes::from_static(b"one")));
        queue.push(Some(Bytes::from_static(b"two")));
        queue.push(Some(Bytes::from_static(b"three")));

        let contents = queue.queue.lock().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].as_deref(), Some(b"two".as_slice()));
        assert_eq!(contents[1].as_deref(), Some(b"three".as_slice()));
    }
}

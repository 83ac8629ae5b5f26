//! Media fan-out to browser peers.
//!
//! The upstream session produces one stream of video units and one of audio
//! samples; every connected WebRTC peer gets its own unbounded subscription
//! so a slow peer never stalls the others or the receive loops.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use log::warn;
use tokio::sync::mpsc;

/// One encoded video frame ready for a WebRTC track.
#[derive(Clone)]
pub struct VideoFrame {
    pub payload: Bytes,
    /// 90 kHz RTP clock.
    pub timestamp: u32,
    pub is_idr: bool,
}

/// One Opus packet ready for a WebRTC track.
#[derive(Clone)]
pub struct AudioSample {
    pub payload: Bytes,
    /// 48 kHz RTP clock.
    pub timestamp: u32,
}

/// Per-peer subscription fan-out. Broadcasting is synchronous and lock-light
/// so it can run from the media callbacks.
pub struct Broadcaster<T: Clone> {
    subscribers: RwLock<HashMap<String, mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, peer_id: String) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .expect("broadcaster lock")
            .insert(peer_id, tx);
        rx
    }

    pub fn unsubscribe(&self, peer_id: &str) {
        self.subscribers
            .write()
            .expect("broadcaster lock")
            .remove(peer_id);
    }

    pub fn broadcast(&self, item: T) {
        let subscribers = self.subscribers.read().expect("broadcaster lock");
        for (peer_id, tx) in subscribers.iter() {
            if tx.send(item.clone()).is_err() {
                // The peer's forwarding task is gone; unsubscribe happens on
                // its disconnect path.
                warn!("[Broadcaster]: peer {peer_id} channel closed");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("broadcaster lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_each_receive_every_item() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe("a".into());
        let mut b = broadcaster.subscribe("b".into());

        broadcaster.broadcast(AudioSample {
            payload: Bytes::from_static(b"opus"),
            timestamp: 960,
        });

        assert_eq!(a.try_recv().unwrap().timestamp, 960);
        assert_eq!(b.try_recv().unwrap().timestamp, 960);
    }

    #[test]
    fn unsubscribed_peers_stop_receiving() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe("a".into());
        broadcaster.unsubscribe("a");
        broadcaster.broadcast(VideoFrame {
            payload: Bytes::new(),
            timestamp: 0,
            is_idr: false,
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}

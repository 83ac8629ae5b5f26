//! Session and role arbitration.
//!
//! One upstream streaming session exists at a time. Its roster holds exactly
//! one Host (slot 0, full input), up to three more Players (slots 1..3,
//! gamepad plus optionally keyboard), and any number of Spectators. All
//! input from browser peers funnels through [`Session::route_input`], which
//! enforces the permission matrix and stamps the sender's gamepad slot
//! before the packet reaches the upstream input assembler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::signaling::InputEvent;

pub const MAX_PLAYERS: usize = 4;
const INPUT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Player,
    Spectator,
}

/// Input classes for permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Keyboard,
    Mouse,
    Scroll,
    Gamepad,
    Touch,
    Pen,
    Motion,
    Battery,
    Text,
}

impl InputKind {
    /// Keyboard-class input needs the per-peer keyboard grant.
    fn needs_keyboard_grant(self) -> bool {
        matches!(self, Self::Keyboard | Self::Mouse | Self::Scroll | Self::Text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub role: Role,
    /// 0..3 for players (0 is always the Host), -1 for spectators.
    pub player_slot: i32,
    pub joined_at: SystemTime,
    pub keyboard_enabled: bool,
}

/// A permitted input on its way upstream.
#[derive(Debug, Clone)]
pub struct InputPacket {
    pub peer_id: String,
    pub slot: i32,
    pub event: InputEvent,
}

/// Roster change notifications for the signaling layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(Peer),
    PeerLeft(Peer),
    RoleChanged(Peer),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    HostAlreadyPresent,
    PeerNotFound,
    NoFreeSlot,
    CannotDemoteHost,
    SessionExists,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::HostAlreadyPresent => "session already has a host",
            Self::PeerNotFound => "peer not found",
            Self::NoFreeSlot => "no player slots available",
            Self::CannotDemoteHost => "cannot demote the host",
            Self::SessionExists => "a session is already active",
        };
        f.write_str(message)
    }
}

impl std::error::Error for SessionError {}

struct Roster {
    peers: HashMap<String, Peer>,
    /// Fixed player slots; index 0 is the host.
    slots: [Option<String>; MAX_PLAYERS],
    host_id: Option<String>,
}

pub struct Session {
    pub id: String,
    pub created_at: SystemTime,
    roster: RwLock<Roster>,
    input_tx: mpsc::Sender<InputPacket>,
    input_rx: Mutex<Option<mpsc::Receiver<InputPacket>>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    max_players: usize,
}

impl Session {
    fn new(max_players: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(64);
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            created_at: SystemTime::now(),
            roster: RwLock::new(Roster {
                peers: HashMap::new(),
                slots: Default::default(),
                host_id: None,
            }),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            events,
            cancel: CancellationToken::new(),
            max_players,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The consuming end of the input queue. Takeable once, by the bridge.
    pub fn take_input_channel(&self) -> Option<mpsc::Receiver<InputPacket>> {
        self.input_rx.lock().expect("input channel lock").take()
    }

    /// Seed the first peer as Host on slot 0 with the keyboard grant.
    pub fn add_host(&self, name: impl Into<String>) -> Result<Peer, SessionError> {
        let mut roster = self.roster.write().expect("roster lock");
        if roster.host_id.is_some() {
            return Err(SessionError::HostAlreadyPresent);
        }
        let peer = Peer {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            role: Role::Host,
            player_slot: 0,
            joined_at: SystemTime::now(),
            keyboard_enabled: true,
        };
        roster.slots[0] = Some(peer.id.clone());
        roster.host_id = Some(peer.id.clone());
        roster.peers.insert(peer.id.clone(), peer.clone());
        drop(roster);

        let _ = self.events.send(SessionEvent::PeerJoined(peer.clone()));
        Ok(peer)
    }

    /// Everyone joins as a spectator; promotion is explicit.
    pub fn add_spectator(&self, name: impl Into<String>) -> Peer {
        let peer = Peer {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            role: Role::Spectator,
            player_slot: -1,
            joined_at: SystemTime::now(),
            keyboard_enabled: false,
        };
        self.roster
            .write()
            .expect("roster lock")
            .peers
            .insert(peer.id.clone(), peer.clone());
        let _ = self.events.send(SessionEvent::PeerJoined(peer.clone()));
        peer
    }

    /// Give a spectator the lowest free player slot (1..3).
    pub fn promote_to_player(&self, peer_id: &str) -> Result<i32, SessionError> {
        let mut roster = self.roster.write().expect("roster lock");
        let peer = roster
            .peers
            .get(peer_id)
            .cloned()
            .ok_or(SessionError::PeerNotFound)?;
        if matches!(peer.role, Role::Host | Role::Player) {
            return Ok(peer.player_slot);
        }

        let slot = (1..self.max_players.min(MAX_PLAYERS))
            .find(|&slot| roster.slots[slot].is_none())
            .ok_or(SessionError::NoFreeSlot)?;

        roster.slots[slot] = Some(peer_id.to_string());
        let updated = {
            let peer = roster.peers.get_mut(peer_id).expect("peer vanished");
            peer.role = Role::Player;
            peer.player_slot = slot as i32;
            peer.clone()
        };
        drop(roster);

        info!("[Session]: {} promoted to player slot {slot}", updated.name);
        let _ = self.events.send(SessionEvent::RoleChanged(updated));
        Ok(slot as i32)
    }

    pub fn demote_to_spectator(&self, peer_id: &str) -> Result<(), SessionError> {
        let mut roster = self.roster.write().expect("roster lock");
        let peer = roster
            .peers
            .get(peer_id)
            .cloned()
            .ok_or(SessionError::PeerNotFound)?;
        if peer.role == Role::Host {
            return Err(SessionError::CannotDemoteHost);
        }
        if peer.role == Role::Spectator {
            return Ok(());
        }

        if let Some(slot) = usize::try_from(peer.player_slot).ok().filter(|&s| s < MAX_PLAYERS) {
            roster.slots[slot] = None;
        }
        let updated = {
            let peer = roster.peers.get_mut(peer_id).expect("peer vanished");
            peer.role = Role::Spectator;
            peer.player_slot = -1;
            peer.keyboard_enabled = false;
            peer.clone()
        };
        drop(roster);

        let _ = self.events.send(SessionEvent::RoleChanged(updated));
        Ok(())
    }

    /// Remove a peer, freeing its slot. The Host leaving closes the session.
    pub fn remove_peer(&self, peer_id: &str) {
        let removed = {
            let mut roster = self.roster.write().expect("roster lock");
            let Some(peer) = roster.peers.remove(peer_id) else {
                return;
            };
            if let Some(slot) =
                usize::try_from(peer.player_slot).ok().filter(|&s| s < MAX_PLAYERS)
            {
                roster.slots[slot] = None;
            }
            if roster.host_id.as_deref() == Some(peer_id) {
                roster.host_id = None;
            }
            peer
        };

        let was_host = removed.role == Role::Host;
        let _ = self.events.send(SessionEvent::PeerLeft(removed));
        if was_host {
            info!("[Session]: host left, closing session {}", self.id);
            self.close();
        }
    }

    /// Toggle the keyboard grant. A no-op for the Host, who always has it;
    /// the external interface layer ensures only the Host reaches this.
    pub fn set_keyboard_enabled(&self, peer_id: &str, enabled: bool) {
        let updated = {
            let mut roster = self.roster.write().expect("roster lock");
            let Some(peer) = roster.peers.get_mut(peer_id) else {
                return;
            };
            if peer.role == Role::Host {
                return;
            }
            peer.keyboard_enabled = enabled;
            peer.clone()
        };
        let _ = self.events.send(SessionEvent::RoleChanged(updated));
    }

    pub fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.roster
            .read()
            .expect("roster lock")
            .peers
            .get(peer_id)
            .cloned()
    }

    pub fn host(&self) -> Option<Peer> {
        let roster = self.roster.read().expect("roster lock");
        roster
            .host_id
            .as_ref()
            .and_then(|id| roster.peers.get(id))
            .cloned()
    }

    /// Roster snapshot, host first, then players by slot, then spectators by
    /// join time.
    pub fn peers(&self) -> Vec<Peer> {
        let roster = self.roster.read().expect("roster lock");
        let mut peers: Vec<Peer> = roster.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            let rank = |p: &Peer| match p.role {
                Role::Host => (0, 0, SystemTime::UNIX_EPOCH),
                Role::Player => (1, p.player_slot, SystemTime::UNIX_EPOCH),
                Role::Spectator => (2, 0, p.joined_at),
            };
            rank(a).cmp(&rank(b))
        });
        peers
    }

    pub fn player_count(&self) -> usize {
        self.roster
            .read()
            .expect("roster lock")
            .slots
            .iter()
            .flatten()
            .count()
    }

    /// Bitmask of occupied gamepad slots, as `/launch` wants it.
    pub fn gamepad_mask(&self) -> u32 {
        let roster = self.roster.read().expect("roster lock");
        roster
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, occupant)| occupant.as_ref().map(|_| 1u32 << slot))
            .sum()
    }

    /// The permission matrix. Spectators send nothing; keyboard-class input
    /// needs the Host role or an explicit grant; gamepad-class input needs a
    /// player slot.
    pub fn can_send_input(&self, peer_id: &str, kind: InputKind) -> bool {
        let roster = self.roster.read().expect("roster lock");
        let Some(peer) = roster.peers.get(peer_id) else {
            return false;
        };
        match peer.role {
            Role::Spectator => false,
            Role::Host => true,
            Role::Player => {
                if kind.needs_keyboard_grant() {
                    peer.keyboard_enabled
                } else {
                    true
                }
            }
        }
    }

    /// Permission-check, slot-stamp and enqueue. Returns whether the packet
    /// was accepted; a full queue drops silently by design.
    pub fn route_input(&self, peer_id: &str, event: InputEvent) -> bool {
        if !self.can_send_input(peer_id, event.kind()) {
            return false;
        }
        let slot = {
            let roster = self.roster.read().expect("roster lock");
            match roster.peers.get(peer_id) {
                Some(peer) => peer.player_slot,
                None => return false,
            }
        };
        let packet = InputPacket {
            peer_id: peer_id.to_string(),
            slot,
            event,
        };
        match self.input_tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[Session]: input queue full, dropping packet");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel everything owned by the session and close the input queue.
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = self.events.send(SessionEvent::Closed);
    }
}

/// Process-wide owner of the single active session.
pub struct SessionManager {
    active: Mutex<Option<Arc<Session>>>,
    max_players: usize,
}

impl SessionManager {
    pub fn new(max_players: usize) -> Self {
        let max_players = if max_players == 0 || max_players > MAX_PLAYERS {
            MAX_PLAYERS
        } else {
            max_players
        };
        Self {
            active: Mutex::new(None),
            max_players,
        }
    }

    /// Create the active session, seeding the Host peer.
    pub fn create_session(
        &self,
        host_name: impl Into<String>,
    ) -> Result<(Arc<Session>, Peer), SessionError> {
        let mut active = self.active.lock().expect("session manager lock");
        if active.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(SessionError::SessionExists);
        }
        let session = Arc::new(Session::new(self.max_players));
        let host = session.add_host(host_name)?;
        info!("[Session]: created session {}", session.id);
        *active = Some(session.clone());
        Ok((session, host))
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.active
            .lock()
            .expect("session manager lock")
            .clone()
            .filter(|s| !s.is_closed())
    }

    pub fn close_session(&self) {
        if let Some(session) = self.active.lock().expect("session manager lock").take() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(MAX_PLAYERS)
    }

    #[test]
    fn host_is_seeded_on_slot_zero_with_keyboard() {
        let session = session();
        let host = session.add_host("Host").unwrap();
        assert_eq!(host.role, Role::Host);
        assert_eq!(host.player_slot, 0);
        assert!(host.keyboard_enabled);
        assert!(session.add_host("Another").is_err());
    }

    #[test]
    fn promotion_assigns_lowest_free_slot() {
        let session = session();
        session.add_host("Host").unwrap();
        let a = session.add_spectator("A");
        let b = session.add_spectator("B");
        let c = session.add_spectator("C");

        assert_eq!(session.promote_to_player(&a.id).unwrap(), 1);
        assert_eq!(session.promote_to_player(&b.id).unwrap(), 2);
        assert_eq!(session.promote_to_player(&c.id).unwrap(), 3);

        let d = session.add_spectator("D");
        assert!(matches!(
            session.promote_to_player(&d.id),
            Err(SessionError::NoFreeSlot)
        ));

        // Freeing slot 2 makes it the next assignment again.
        session.demote_to_spectator(&b.id).unwrap();
        assert_eq!(session.promote_to_player(&d.id).unwrap(), 2);
    }

    #[test]
    fn concurrent_promotions_never_share_a_slot() {
        let session = Arc::new(session());
        session.add_host("Host").unwrap();
        let ids: Vec<String> = (0..3)
            .map(|i| session.add_spectator(format!("P{i}")).id)
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let session = session.clone();
                let id = id.clone();
                std::thread::spawn(move || session.promote_to_player(&id).unwrap())
            })
            .collect();

        let mut slots: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![1, 2, 3]);
    }

    #[test]
    fn host_cannot_be_demoted() {
        let session = session();
        let host = session.add_host("Host").unwrap();
        assert!(matches!(
            session.demote_to_spectator(&host.id),
            Err(SessionError::CannotDemoteHost)
        ));
        // And the keyboard grant cannot be revoked either.
        session.set_keyboard_enabled(&host.id, false);
        assert!(session.peer(&host.id).unwrap().keyboard_enabled);
    }

    #[test]
    fn host_leaving_closes_the_session() {
        let session = session();
        let host = session.add_host("Host").unwrap();
        session.add_spectator("S");
        assert!(!session.is_closed());
        session.remove_peer(&host.id);
        assert!(session.is_closed());
    }

    #[test]
    fn permission_matrix() {
        let session = session();
        let host = session.add_host("H").unwrap();
        let player = session.add_spectator("P");
        session.promote_to_player(&player.id).unwrap();
        let spectator = session.add_spectator("S");

        // Spectators: nothing, across every kind.
        for kind in [
            InputKind::Keyboard,
            InputKind::Mouse,
            InputKind::Scroll,
            InputKind::Gamepad,
            InputKind::Touch,
            InputKind::Pen,
            InputKind::Motion,
            InputKind::Battery,
            InputKind::Text,
        ] {
            assert!(!session.can_send_input(&spectator.id, kind));
        }

        // Host: everything.
        assert!(session.can_send_input(&host.id, InputKind::Keyboard));
        assert!(session.can_send_input(&host.id, InputKind::Gamepad));

        // Player without the grant: gamepad-class only.
        assert!(!session.can_send_input(&player.id, InputKind::Keyboard));
        assert!(!session.can_send_input(&player.id, InputKind::Mouse));
        assert!(session.can_send_input(&player.id, InputKind::Gamepad));
        assert!(session.can_send_input(&player.id, InputKind::Touch));

        session.set_keyboard_enabled(&player.id, true);
        assert!(session.can_send_input(&player.id, InputKind::Keyboard));
    }

    #[test]
    fn routed_packets_are_stamped_with_the_sender_slot() {
        let session = session();
        let host = session.add_host("H").unwrap();
        let player = session.add_spectator("P");
        session.promote_to_player(&player.id).unwrap();
        session.promote_to_player(&session.add_spectator("Q").id).unwrap();
        let spectator = session.add_spectator("S");

        let mut rx = session.take_input_channel().unwrap();

        let pad = InputEvent::Gamepad {
            buttons: 0x1000,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 0,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        };
        let key = InputEvent::Key {
            code: 0x41,
            down: true,
            modifiers: 0,
        };

        assert!(session.route_input(&player.id, pad.clone()));
        assert!(!session.route_input(&player.id, key.clone()));
        assert!(session.route_input(&host.id, key.clone()));
        assert!(!session.route_input(&spectator.id, pad.clone()));
        assert!(!session.route_input(&spectator.id, key));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.slot, 1);
        assert_eq!(first.peer_id, player.id);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.slot, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn gamepad_mask_reflects_occupied_slots() {
        let session = session();
        session.add_host("H").unwrap();
        assert_eq!(session.gamepad_mask(), 0b0001);
        let p = session.add_spectator("P");
        session.promote_to_player(&p.id).unwrap();
        assert_eq!(session.gamepad_mask(), 0b0011);
    }

    #[test]
    fn manager_enforces_a_single_active_session() {
        let manager = SessionManager::new(4);
        let (session, _host) = manager.create_session("Host").unwrap();
        assert!(matches!(
            manager.create_session("Other"),
            Err(SessionError::SessionExists)
        ));
        session.close();
        assert!(manager.create_session("Other").is_ok());
    }
}

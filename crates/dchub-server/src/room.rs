//! Rooms: the global room plus lazily-created named rooms, each with a
//! bounded chat log replayed to joiners.
//!
//! The global room (named `""`) mirrors the roster: it keeps no member
//! set of its own, so "membership of the global room equals the set of
//! online peers" holds structurally rather than by bookkeeping. Named
//! rooms track explicit membership and are dropped when the last member
//! leaves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dchub_proto::Sid;

use crate::error::HubError;
use crate::hub::Hub;
use crate::peer::{Peer, PeerRef};

/// A chat message. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// When the hub processed the message.
    pub time: SystemTime,
    /// Sender display name; the hub's bot name for hub messages.
    pub name: String,
    /// Sender session, when a peer (not the hub) sent it.
    pub sid: Option<Sid>,
    /// Message text.
    pub text: String,
    /// Action (`/me`) flag.
    pub me: bool,
}

impl ChatMessage {
    /// Message from a peer.
    #[must_use]
    pub fn from_peer(peer: &PeerRef, text: String, me: bool) -> ChatMessage {
        ChatMessage {
            time: SystemTime::now(),
            name: peer.name(),
            sid: Some(peer.sid()),
            text,
            me,
        }
    }

    /// Hub-originated message with the given display name.
    #[must_use]
    pub fn from_hub(name: String, text: String) -> ChatMessage {
        ChatMessage { time: SystemTime::now(), name, sid: None, text, me: false }
    }
}

struct RoomState {
    members: Vec<PeerRef>,
    log: VecDeque<ChatMessage>,
}

/// A chat room.
pub struct Room {
    name: String,
    global: bool,
    log_cap: usize,
    replay: usize,
    state: Mutex<RoomState>,
}

impl Room {
    /// Create the global room.
    pub(crate) fn global(log_cap: usize, replay: usize) -> Arc<Room> {
        Arc::new(Room {
            name: String::new(),
            global: true,
            log_cap,
            replay,
            state: Mutex::new(RoomState { members: Vec::new(), log: VecDeque::new() }),
        })
    }

    /// Create a named room.
    pub(crate) fn named(name: &str, log_cap: usize, replay: usize) -> Arc<Room> {
        Arc::new(Room {
            name: name.to_string(),
            global: false,
            log_cap,
            replay,
            state: Mutex::new(RoomState { members: Vec::new(), log: VecDeque::new() }),
        })
    }

    /// Room name; `""` is the global room.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the global room.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RoomState> {
        self.state.lock().expect("room lock poisoned")
    }

    /// Current members. For the global room this is the roster.
    pub fn members(&self, hub: &Hub) -> Vec<PeerRef> {
        if self.global {
            hub.roster().peers()
        } else {
            self.state().members.clone()
        }
    }

    /// Number of members (named rooms only track their own set).
    pub fn member_count(&self, hub: &Hub) -> usize {
        if self.global {
            hub.roster().len()
        } else {
            self.state().members.len()
        }
    }

    /// Whether the peer is a member.
    pub fn is_member(&self, hub: &Hub, peer: &PeerRef) -> bool {
        if self.global {
            hub.roster().by_sid(peer.sid()).is_some()
        } else {
            self.state().members.iter().any(|p| Arc::ptr_eq(p, peer))
        }
    }

    /// Add a peer to a named room, notify it, and replay the last few
    /// messages to the joiner only. No-op on the global room (roster
    /// membership covers it) and on double joins.
    pub fn join(self: &Arc<Self>, peer: &PeerRef) -> Result<(), HubError> {
        if !self.global {
            let mut st = self.state();
            if st.members.iter().any(|p| Arc::ptr_eq(p, peer)) {
                return Ok(());
            }
            st.members.push(Arc::clone(peer));
        }
        peer.base().track_room(self);
        peer.join_room(self)?;
        self.replay_to(peer);
        Ok(())
    }

    /// Remove a peer from a named room.
    pub fn leave(self: &Arc<Self>, peer: &PeerRef) {
        if !self.global {
            self.state().members.retain(|p| !Arc::ptr_eq(p, peer));
        }
        peer.base().untrack_room(self);
        let _ = peer.leave_room(self);
    }

    /// Replay the room's recent history to one peer.
    fn replay_to(&self, peer: &PeerRef) {
        let msgs: Vec<ChatMessage> = {
            let st = self.state();
            let n = st.log.len().saturating_sub(self.replay);
            st.log.iter().skip(n).cloned().collect()
        };
        for msg in msgs {
            let _ = peer.hub_chat_msg(&ChatMessage {
                name: msg.name.clone(),
                text: if msg.me {
                    format!("* {} {}", msg.name, msg.text)
                } else {
                    msg.text.clone()
                },
                me: false,
                ..msg
            });
        }
    }

    /// Record a message in the bounded log.
    fn log_message(&self, msg: &ChatMessage) {
        let mut st = self.state();
        if st.log.len() == self.log_cap {
            st.log.pop_front();
        }
        st.log.push_back(msg.clone());
    }

    /// Fan a peer's chat message out to the room, excluding the sender
    /// (their client echoes locally).
    ///
    /// Member snapshot is taken first; sends happen without any room or
    /// roster lock held. Per-recipient failures are ignored.
    pub fn send_chat(&self, hub: &Hub, from: &PeerRef, msg: &ChatMessage) {
        self.log_message(msg);
        for p in self.members(hub) {
            if p.sid() == from.sid() {
                continue;
            }
            if let Err(e) = p.chat_msg(self, from, msg) {
                tracing::debug!(to = %p.name(), "chat delivery failed: {e}");
            }
        }
    }

    /// Deliver a hub-originated message to every member.
    pub fn send_hub_msg(&self, hub: &Hub, msg: &ChatMessage) {
        self.log_message(msg);
        for p in self.members(hub) {
            if let Err(e) = p.hub_chat_msg(msg) {
                tracing::debug!(to = %p.name(), "hub message delivery failed: {e}");
            }
        }
    }

    /// Messages currently held in the log (oldest first).
    pub fn history(&self) -> Vec<ChatMessage> {
        self.state().log.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("global", &self.global)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded() {
        let room = Room::named("ops", 3, 2);
        for i in 0..10 {
            room.log_message(&ChatMessage::from_hub("hub".to_string(), format!("m{i}")));
        }
        let hist = room.history();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].text, "m7");
        assert_eq!(hist[2].text, "m9");
    }

    #[test]
    fn global_room_has_empty_name() {
        let room = Room::global(50, 10);
        assert_eq!(room.name(), "");
        assert!(room.is_global());
    }
}

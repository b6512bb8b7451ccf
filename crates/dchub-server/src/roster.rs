//! Roster: the process-wide authoritative map of online peers.
//!
//! Four indexes are maintained over the same peer set: by SID, by CID
//! (ADC only), by case-folded nick, and by user-profile name. A nick can
//! also be *reserved* — present in the nick index with no peer bound —
//! while a handshake is in flight; the reservation is released exactly
//! once, either by transferring it into a full entry on acceptance or by
//! the RAII guard when the handshake fails.
//!
//! Concurrency: one reader-writer lock around the index struct. Holders
//! never call into a peer's write path under the lock; broadcasts
//! snapshot first and send after release.
//!
//! Index inconsistencies (SID reuse, a missing entry on identity-checked
//! removal) are bugs, not runtime conditions, and panic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use dchub_proto::{Cid, Sid};

use crate::error::HubError;
use crate::peer::{Peer, PeerRef};

/// Case-fold a nick for index lookups.
#[must_use]
pub fn fold_nick(nick: &str) -> String {
    nick.to_lowercase()
}

enum NameEntry {
    /// Held by an in-flight handshake.
    Reserved,
    /// Bound to an online peer.
    Online(PeerRef),
}

#[derive(Default)]
struct Indexes {
    by_sid: HashMap<Sid, PeerRef>,
    by_cid: HashMap<Cid, PeerRef>,
    by_name: HashMap<String, NameEntry>,
    by_profile: HashMap<String, HashSet<Sid>>,
    next_sid: u32,
}

/// The roster. See the module docs for the invariants it enforces.
pub struct Roster {
    inner: RwLock<Indexes>,
}

impl Roster {
    /// Empty roster. SID allocation starts at a random point so that
    /// restarts do not hand out the same identifiers.
    #[must_use]
    pub fn new() -> Arc<Roster> {
        let mut idx = Indexes::default();
        idx.next_sid = rand::random::<u32>() & Sid::MASK;
        Arc::new(Roster { inner: RwLock::new(idx) })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.inner.read().expect("roster lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.inner.write().expect("roster lock poisoned")
    }

    /// Allocate a SID not currently online. SIDs are not reused while
    /// their peer is online.
    pub fn alloc_sid(&self) -> Sid {
        let mut idx = self.write();
        loop {
            let sid = Sid::new(idx.next_sid);
            idx.next_sid = (idx.next_sid + 1) & Sid::MASK;
            if !idx.by_sid.contains_key(&sid) {
                return sid;
            }
        }
    }

    /// Non-authoritative availability hint; only
    /// [`Roster::reserve_name`] decides.
    pub fn name_available(&self, nick: &str) -> bool {
        !self.read().by_name.contains_key(&fold_nick(nick))
    }

    /// Reserve a nick for an in-flight handshake.
    ///
    /// If the nick is bound to a peer that has already died but whose
    /// connection task has not cleaned up yet, the new handshake takes
    /// the name over and the dead entry is evicted.
    pub fn reserve_name(self: &Arc<Self>, nick: &str) -> Result<NameReservation, HubError> {
        let folded = fold_nick(nick);
        let mut idx = self.write();
        match idx.by_name.get(&folded) {
            None => {},
            Some(NameEntry::Reserved) => return Err(HubError::NickTaken),
            Some(NameEntry::Online(peer)) => {
                if !peer.base().is_closed() {
                    return Err(HubError::NickTaken);
                }
                // Takeover: the previous session is dead.
                let dead = Arc::clone(peer);
                remove_peer_entries(&mut idx, &dead);
            },
        }
        idx.by_name.insert(folded.clone(), NameEntry::Reserved);
        Ok(NameReservation { roster: Arc::clone(self), folded, armed: true })
    }

    /// Whether a CID is already bound to an online peer.
    pub fn cid_in_use(&self, cid: &Cid) -> bool {
        self.read().by_cid.contains_key(cid)
    }

    /// Atomically convert a reservation into a full roster entry.
    ///
    /// Under the write lock the reservation is replaced by the peer, all
    /// applicable indexes are installed, and a snapshot of the peers
    /// that were online *before* this one is taken for the join
    /// broadcast. The caller broadcasts after the lock is released.
    pub fn accept_peer(
        &self,
        peer: PeerRef,
        res: NameReservation,
    ) -> Result<Vec<PeerRef>, HubError> {
        let folded = res.disarm();
        let mut idx = self.write();

        // CID collisions are a user condition (two clients with the same
        // identity), checked here under the same lock that installs it.
        if let Some(cid) = peer.cid() {
            if idx.by_cid.contains_key(&cid) {
                idx.by_name.remove(&folded);
                return Err(HubError::CidTaken);
            }
        }

        let snapshot: Vec<PeerRef> = idx.by_sid.values().cloned().collect();

        match idx.by_name.get(&folded) {
            Some(NameEntry::Reserved) => {},
            _ => panic!("accept_peer without a live reservation for {folded:?}"),
        }
        let sid = peer.sid();
        assert!(
            !idx.by_sid.contains_key(&sid),
            "SID {sid} reused while online"
        );
        idx.by_name.insert(folded, NameEntry::Online(Arc::clone(&peer)));
        if let Some(cid) = peer.cid() {
            idx.by_cid.insert(cid, Arc::clone(&peer));
        }
        if let Some(profile) = peer.base().profile() {
            idx.by_profile.entry(profile).or_default().insert(sid);
        }
        idx.by_sid.insert(sid, peer);
        Ok(snapshot)
    }

    /// Remove a peer from all indexes.
    ///
    /// Removal is identity-checked: if the entry for this SID is no
    /// longer `peer` (a takeover already evicted it), nothing happens
    /// and `false` is returned.
    pub fn leave(&self, peer: &PeerRef) -> bool {
        let mut idx = self.write();
        match idx.by_sid.get(&peer.sid()) {
            Some(current) if Arc::ptr_eq(current, peer) => {},
            _ => return false,
        }
        remove_peer_entries(&mut idx, peer);
        true
    }

    /// Look up a peer by SID.
    pub fn by_sid(&self, sid: Sid) -> Option<PeerRef> {
        self.read().by_sid.get(&sid).cloned()
    }

    /// Look up a peer by CID.
    pub fn by_cid(&self, cid: &Cid) -> Option<PeerRef> {
        self.read().by_cid.get(cid).cloned()
    }

    /// Look up a peer by nick (case-folded).
    pub fn by_name(&self, nick: &str) -> Option<PeerRef> {
        match self.read().by_name.get(&fold_nick(nick)) {
            Some(NameEntry::Online(p)) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    /// Online peers bound to the given profile.
    pub fn by_profile(&self, profile: &str) -> Vec<PeerRef> {
        let idx = self.read();
        idx.by_profile
            .get(profile)
            .into_iter()
            .flatten()
            .filter_map(|sid| idx.by_sid.get(sid).cloned())
            .collect()
    }

    /// Snapshot of all online peers.
    pub fn peers(&self) -> Vec<PeerRef> {
        self.read().by_sid.values().cloned().collect()
    }

    /// Number of online peers.
    pub fn len(&self) -> usize {
        self.read().by_sid.len()
    }

    /// Whether nobody is online.
    pub fn is_empty(&self) -> bool {
        self.read().by_sid.is_empty()
    }
}

/// Remove every index entry belonging to `peer`. Caller holds the write
/// lock and has verified identity for the SID entry.
fn remove_peer_entries(idx: &mut Indexes, peer: &PeerRef) {
    let sid = peer.sid();
    let removed = idx.by_sid.remove(&sid);
    assert!(removed.is_some(), "peer {sid} missing from SID index on leave");

    let folded = fold_nick(&peer.name());
    match idx.by_name.get(&folded) {
        Some(NameEntry::Online(current)) if Arc::ptr_eq(current, peer) => {
            idx.by_name.remove(&folded);
        },
        Some(_) => {}, // superseded by a takeover or a fresh reservation
        None => panic!("peer {sid} missing from nick index on leave"),
    }

    if let Some(cid) = peer.cid() {
        match idx.by_cid.get(&cid) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                idx.by_cid.remove(&cid);
            },
            _ => {},
        }
    }

    if let Some(profile) = peer.base().profile() {
        if let Some(set) = idx.by_profile.get_mut(&profile) {
            set.remove(&sid);
            if set.is_empty() {
                idx.by_profile.remove(&profile);
            }
        }
    }
}

/// RAII guard for a reserved nick.
///
/// Dropping the guard releases the reservation unless it was transferred
/// into a full entry by [`Roster::accept_peer`]. Release is exactly-once
/// either way.
pub struct NameReservation {
    roster: Arc<Roster>,
    folded: String,
    armed: bool,
}

impl NameReservation {
    /// The reserved (folded) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.folded
    }

    fn disarm(mut self) -> String {
        self.armed = false;
        std::mem::take(&mut self.folded)
    }
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut idx = self.roster.write();
        if let Some(NameEntry::Reserved) = idx.by_name.get(&self.folded) {
            idx.by_name.remove(&self.folded);
        }
    }
}

impl std::fmt::Debug for Roster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roster").field("online", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::config::Config;
    use crate::db::MemoryDatabase;
    use crate::hub::{Hub, HubOptions};
    use crate::peer::{BasePeer, ConnInfo, Peer, Protocol, UserInfo};
    use crate::room::{ChatMessage, Room};

    struct DummyPeer {
        base: BasePeer,
        _rx: mpsc::Receiver<crate::conn::Outbound>,
    }

    impl Peer for DummyPeer {
        fn base(&self) -> &BasePeer {
            &self.base
        }

        fn user_info(&self) -> UserInfo {
            self.base.user()
        }

        fn peers_join(&self, _: &[PeerRef]) -> Result<(), HubError> {
            Ok(())
        }

        fn peers_update(&self, _: &[PeerRef]) -> Result<(), HubError> {
            Ok(())
        }

        fn peers_leave(&self, _: &[PeerRef]) -> Result<(), HubError> {
            Ok(())
        }

        fn chat_msg(&self, _: &Room, _: &PeerRef, _: &ChatMessage) -> Result<(), HubError> {
            Ok(())
        }

        fn private_msg(&self, _: &PeerRef, _: &ChatMessage) -> Result<(), HubError> {
            Ok(())
        }

        fn hub_chat_msg(&self, _: &ChatMessage) -> Result<(), HubError> {
            Ok(())
        }

        fn join_room(&self, _: &Room) -> Result<(), HubError> {
            Ok(())
        }

        fn leave_room(&self, _: &Room) -> Result<(), HubError> {
            Ok(())
        }

        fn connect_to(&self, _: &PeerRef, _: &str, _: &str, _: bool) -> Result<(), HubError> {
            Ok(())
        }

        fn rev_connect_to(&self, _: &PeerRef, _: &str, _: bool) -> Result<(), HubError> {
            Ok(())
        }

        fn search(&self, _: &crate::peer::SearchRequest) -> Result<(), HubError> {
            Ok(())
        }

        fn redirect(&self, _: &str) -> Result<(), HubError> {
            Ok(())
        }
    }

    fn test_hub() -> std::sync::Arc<Hub> {
        Hub::new(Config::new(), HubOptions::default(), Arc::new(MemoryDatabase::new()))
    }

    fn dummy(hub: &Arc<Hub>, name: &str, cid: Option<Cid>) -> PeerRef {
        let (tx, rx) = mpsc::channel(64);
        let (close_tx, _) = watch::channel(false);
        let sid = hub.roster().alloc_sid();
        let cinfo = ConnInfo::plain(
            "127.0.0.1:411".parse().unwrap(),
            "10.0.0.1:50000".parse().unwrap(),
        );
        let peer = Arc::new(DummyPeer {
            base: BasePeer::new(hub, sid, cid, cinfo, Protocol::Nmdc, tx, close_tx),
            _rx: rx,
        });
        peer.base.set_name(name);
        peer
    }

    #[test]
    fn reserve_blocks_duplicates() {
        let hub = test_hub();
        let roster = hub.roster();
        let res = roster.reserve_name("Alice").unwrap();
        assert!(!roster.name_available("alice"), "folded lookup");
        assert!(matches!(roster.reserve_name("ALICE"), Err(HubError::NickTaken)));
        drop(res);
        assert!(roster.name_available("alice"), "reservation released on drop");
    }

    #[test]
    fn accept_installs_all_indexes() {
        let hub = test_hub();
        let roster = hub.roster();
        let cid = Cid([9; 24]);
        let peer = dummy(&hub, "alice", Some(cid));
        peer.base().set_profile(Some("op".to_string()));

        let res = roster.reserve_name("alice").unwrap();
        let snapshot = roster.accept_peer(Arc::clone(&peer), res).unwrap();
        assert!(snapshot.is_empty(), "first peer sees an empty snapshot");

        assert!(Arc::ptr_eq(&roster.by_sid(peer.sid()).unwrap(), &peer));
        assert!(Arc::ptr_eq(&roster.by_name("ALICE").unwrap(), &peer));
        assert!(Arc::ptr_eq(&roster.by_cid(&cid).unwrap(), &peer));
        assert_eq!(roster.by_profile("op").len(), 1);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn leave_is_identity_checked() {
        let hub = test_hub();
        let roster = hub.roster();

        let alice = dummy(&hub, "alice", None);
        let res = roster.reserve_name("alice").unwrap();
        roster.accept_peer(Arc::clone(&alice), res).unwrap();

        // The session dies without cleaning up; a new handshake takes
        // the nick over.
        alice.base().shutdown();
        let res = roster.reserve_name("alice").unwrap();
        let alice2 = dummy(&hub, "alice", None);
        roster.accept_peer(Arc::clone(&alice2), res).unwrap();

        // The dead session's deferred cleanup must not remove the new
        // entry.
        assert!(!roster.leave(&alice), "stale leave is a no-op");
        assert!(Arc::ptr_eq(&roster.by_name("alice").unwrap(), &alice2));
        assert!(roster.leave(&alice2));
        assert!(roster.is_empty());
    }

    #[test]
    fn takeover_requires_dead_peer() {
        let hub = test_hub();
        let roster = hub.roster();
        let alice = dummy(&hub, "alice", None);
        let res = roster.reserve_name("alice").unwrap();
        roster.accept_peer(Arc::clone(&alice), res).unwrap();

        // Still alive: no takeover.
        assert!(matches!(roster.reserve_name("alice"), Err(HubError::NickTaken)));
    }

    #[test]
    fn cid_collision_rejected_and_reservation_released() {
        let hub = test_hub();
        let roster = hub.roster();
        let cid = Cid([7; 24]);

        let a = dummy(&hub, "a", Some(cid));
        let res = roster.reserve_name("a").unwrap();
        roster.accept_peer(Arc::clone(&a), res).unwrap();

        let b = dummy(&hub, "b", Some(cid));
        let res = roster.reserve_name("b").unwrap();
        assert!(matches!(roster.accept_peer(b, res), Err(HubError::CidTaken)));
        assert!(roster.name_available("b"), "failed accept releases the nick");
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn alloc_sid_skips_online() {
        let hub = test_hub();
        let roster = hub.roster();
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let peer = dummy(&hub, &format!("user{i}"), None);
            assert!(seen.insert(peer.sid()), "SID reuse while online");
            let res = roster.reserve_name(&format!("user{i}")).unwrap();
            roster.accept_peer(peer, res).unwrap();
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Random interleavings of reserve/accept/leave keep every
        /// index consistent: each online peer appears in each
        /// applicable index exactly once.
        #[test]
        fn indexes_stay_consistent(ops in proptest::collection::vec(0u8..3, 1..40)) {
            let hub = test_hub();
            let roster = hub.roster();
            let mut online: Vec<PeerRef> = Vec::new();
            let mut counter = 0usize;

            for op in ops {
                match op {
                    // join a new peer
                    0 => {
                        counter += 1;
                        let name = format!("peer{counter}");
                        let cid = Cid([counter as u8; 24]);
                        let peer = dummy(&hub, &name, Some(cid));
                        let res = roster.reserve_name(&name).unwrap();
                        roster.accept_peer(Arc::clone(&peer), res).unwrap();
                        online.push(peer);
                    },
                    // leave a random-ish peer
                    1 if !online.is_empty() => {
                        let peer = online.remove(counter % online.len());
                        prop_assert!(roster.leave(&peer));
                    },
                    // reserve-then-release must not disturb anything
                    _ => {
                        let res = roster.reserve_name(&format!("tmp{counter}"));
                        drop(res);
                    },
                }

                prop_assert_eq!(roster.len(), online.len());
                for p in &online {
                    let by_sid = roster.by_sid(p.sid()).unwrap();
                    prop_assert!(Arc::ptr_eq(&by_sid, p));
                    let by_name = roster.by_name(&p.name()).unwrap();
                    prop_assert!(Arc::ptr_eq(&by_name, p));
                    let by_cid = roster.by_cid(&p.cid().unwrap()).unwrap();
                    prop_assert!(Arc::ptr_eq(&by_cid, p));
                }
            }
        }
    }
}
